//! Controller served over newline-delimited JSON on a real socket

use scholia::controller::{ClientRegistry, Controller, ControllerSettings, Outcome, Reply};
use scholia::interface::ndjson::NdjsonInterface;
use scholia::provider::MemoryProvider;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct Peer {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Peer {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn reply(&mut self) -> Reply {
        let line = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn serves_requests_until_shutdown() {
    let registry = ClientRegistry::new();
    let interface = NdjsonInterface::bind("127.0.0.1:0", registry.clone())
        .await
        .unwrap();
    let addr = interface.local_addr();
    let controller = Controller::new(
        ControllerSettings::default(),
        registry.clone(),
        MemoryProvider::with_toy_data(),
    );
    let running = tokio::spawn(controller.start(vec![Box::new(interface)]));

    let mut peer = Peer::connect(addr).await;

    peer.send_line(r#"{"id":"a1","command":"ping"}"#).await;
    let pong = peer.reply().await;
    assert_eq!(pong.id, json!("a1"));
    assert_eq!(pong.data, json!("pong"));

    peer.send_line("{not json").await;
    let malformed = peer.reply().await;
    assert_eq!(malformed.id, Value::Null);
    assert_eq!(malformed.error_code(), Some("parse_error"));

    peer.send_line(r#"{"id":2,"command":"get_paper_data","params":{"paperID":"PMC3398920"}}"#)
        .await;
    let paper = peer.reply().await;
    assert!(!paper.is_error());
    assert_eq!(paper.data["paper"]["id"], json!("PMC3398920"));

    peer.send_line(r#"{"id":3,"command":"shutdown"}"#).await;
    let ack = peer.reply().await;
    assert_eq!(ack.command, "shutdown");
    assert_eq!(ack.data, Value::Null);

    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
    assert!(peer.lines.next_line().await.unwrap().is_none());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn each_connection_gets_its_own_replies() {
    let registry = ClientRegistry::new();
    let interface = NdjsonInterface::bind("127.0.0.1:0", registry.clone())
        .await
        .unwrap();
    let addr = interface.local_addr();
    let controller = Controller::new(ControllerSettings::default(), registry, MemoryProvider::new());
    let running = tokio::spawn(controller.start(vec![Box::new(interface)]));

    let mut first = Peer::connect(addr).await;
    let mut second = Peer::connect(addr).await;

    second.send_line(r#"{"id":"second","command":"test_connection"}"#).await;
    first.send_line(r#"{"id":"first","command":"ping"}"#).await;

    let reply = first.reply().await;
    assert_eq!(reply.id, json!("first"));
    assert_eq!(reply.data, json!("pong"));

    let reply = second.reply().await;
    assert_eq!(reply.id, json!("second"));
    assert_eq!(reply.data["text"], json!("The connection is working."));

    first.send_line(r#"{"id":9,"command":"restart"}"#).await;
    assert_eq!(first.reply().await.data, Value::Null);
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Restart);
}

#[tokio::test]
async fn replies_reach_a_peer_that_stopped_sending() {
    let registry = ClientRegistry::new();
    let interface = NdjsonInterface::bind("127.0.0.1:0", registry.clone())
        .await
        .unwrap();
    let addr = interface.local_addr();
    let controller = Controller::new(ControllerSettings::default(), registry.clone(), MemoryProvider::new());
    let running = tokio::spawn(controller.start(vec![Box::new(interface)]));

    let mut peer = Peer::connect(addr).await;
    peer.send_line(r#"{"id":1,"command":"ping"}"#).await;
    peer.send_line(r#"{"id":2,"command":"test_connection"}"#).await;
    peer.writer.shutdown().await.unwrap();

    let first = peer.reply().await;
    assert_eq!(first.id, json!(1));
    assert_eq!(first.data, json!("pong"));
    let second = peer.reply().await;
    assert_eq!(second.id, json!(2));
    assert_eq!(second.data["text"], json!("The connection is working."));
    assert!(peer.lines.next_line().await.unwrap().is_none());

    let mut closer = Peer::connect(addr).await;
    closer.send_line(r#"{"id":3,"command":"shutdown"}"#).await;
    assert_eq!(closer.reply().await.data, Value::Null);
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
    assert!(registry.is_empty());
}
