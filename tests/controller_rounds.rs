//! End-to-end controller behavior over the in-process transport

use futures::FutureExt;
use futures::future::BoxFuture;
use scholia::controller::{
    ClientRegistry, CommandPolicy, Controller, ControllerSettings, Outcome, Params, Request,
    TransportError,
};
use scholia::interface::Interface;
use scholia::interface::channel::ChannelInterface;
use scholia::provider::{MemoryProvider, Provider, ProviderResult, ToyLoadReport};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Clone, Default)]
struct Counters {
    shutdowns: Arc<AtomicUsize>,
    toy_loads: Arc<AtomicUsize>,
}

struct CountingProvider(Counters);

impl Provider for CountingProvider {
    fn name(&self) -> &str {
        "counting"
    }

    async fn shutdown(&mut self) -> ProviderResult<()> {
        self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn toy_load(&mut self) -> ProviderResult<ToyLoadReport> {
        self.0.toy_loads.fetch_add(1, Ordering::SeqCst);
        Ok(ToyLoadReport {
            paper_id: "toy".into(),
            sentences: 0,
            events: 0,
            contexts: 0,
        })
    }
}

struct RefusingInterface {
    calls: Arc<AtomicUsize>,
}

impl Interface for RefusingInterface {
    fn name(&self) -> &str {
        "refusing"
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        async { Err(TransportError::Task("refused".into())) }.boxed()
    }
}

fn request(id: u64, command: &str) -> Request {
    Request::new(id, command, Params::new())
}

fn settings(policy: CommandPolicy) -> ControllerSettings {
    ControllerSettings {
        policy,
        ..ControllerSettings::default()
    }
}

#[tokio::test]
async fn replies_to_one_client_keep_request_order() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let mut client = channel.connect().unwrap();
    for id in 1..=3 {
        client.send(request(id, "ping")).await.unwrap();
    }
    client.send(request(4, "shutdown")).await.unwrap();

    let controller = Controller::new(ControllerSettings::default(), registry, MemoryProvider::new());
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    for id in 1..=3 {
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.id, json!(id));
        assert_eq!(reply.data, json!("pong"));
    }
    let ack = client.recv().await.unwrap();
    assert_eq!(ack.id, json!(4));
    assert_eq!(ack.data, Value::Null);

    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
}

#[tokio::test]
async fn restart_lets_requests_from_the_same_round_finish() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let mut a = channel.connect().unwrap();
    let mut b = channel.connect().unwrap();
    a.send(request(1, "restart")).await.unwrap();
    b.send(request(2, "ping")).await.unwrap();

    let controller = Controller::new(
        ControllerSettings::default(),
        registry.clone(),
        MemoryProvider::new(),
    );
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    let ack = a.recv().await.unwrap();
    assert_eq!(ack.command, "restart");
    assert_eq!(ack.data, Value::Null);

    let pong = b.recv().await.unwrap();
    assert_eq!(pong.id, json!(2));
    assert_eq!(pong.data, json!("pong"));

    // The instance is draining: nothing B sends now is read.
    let _ = b.send(request(3, "ping")).await;

    assert_eq!(running.await.unwrap().unwrap(), Outcome::Restart);
    assert!(registry.is_empty());
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert!(b.recv().await.is_none());
}

#[tokio::test]
async fn slow_client_cannot_hold_the_instance_open() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 1);
    let mut slow = channel.connect().unwrap();
    let mut other = channel.connect().unwrap();
    slow.send(request(1, "ping")).await.unwrap();

    let settings = ControllerSettings {
        shutdown_timeout: Duration::from_millis(200),
        ..ControllerSettings::default()
    };
    let controller = Controller::new(settings, registry.clone(), MemoryProvider::new());
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    // The unread pong fills the reply queue, so the acknowledgement blocks.
    slow.send(request(2, "shutdown")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = other.send(request(3, "ping")).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Outcome::Shutdown);
    assert!(other.recv().await.is_none());
    assert_eq!(slow.recv().await.unwrap().data, json!("pong"));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn dropped_client_is_deregistered_while_serving() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let controller = Controller::new(
        ControllerSettings::default(),
        registry.clone(),
        MemoryProvider::new(),
    );
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    let gone = channel.connect().unwrap();
    let mut stays = channel.connect().unwrap();
    drop(gone);
    assert_eq!(registry.len(), 1);
    assert_eq!(channel.connected(), 1);

    stays.send(request(1, "ping")).await.unwrap();
    assert_eq!(stays.recv().await.unwrap().data, json!("pong"));
    stays.send(request(2, "shutdown")).await.unwrap();
    assert_eq!(stays.recv().await.unwrap().data, Value::Null);
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
}

#[tokio::test]
async fn shutdown_releases_provider_and_every_interface_once() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let mut client = channel.connect().unwrap();
    client.send(request(1, "shutdown")).await.unwrap();

    let counters = Counters::default();
    let refusals = Arc::new(AtomicUsize::new(0));
    let interfaces: Vec<Box<dyn Interface>> = vec![
        Box::new(RefusingInterface {
            calls: Arc::clone(&refusals),
        }),
        Box::new(channel.clone()),
    ];
    let controller = Controller::new(
        ControllerSettings::default(),
        registry.clone(),
        CountingProvider(counters.clone()),
    );
    let outcome = controller.start(interfaces).await.unwrap();

    assert_eq!(outcome, Outcome::Shutdown);
    assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(refusals.load(Ordering::SeqCst), 1);
    assert_eq!(client.recv().await.unwrap().data, Value::Null);
    assert!(client.is_closed());
    assert_eq!(channel.connected(), 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn disabled_command_never_reaches_the_provider() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let mut client = channel.connect().unwrap();
    client.send(request(1, "toy_load")).await.unwrap();
    client.send(request(2, "shutdown")).await.unwrap();

    let counters = Counters::default();
    let controller = Controller::new(
        settings(CommandPolicy::default()),
        registry,
        CountingProvider(counters.clone()),
    );
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    let refused = client.recv().await.unwrap();
    assert_eq!(refused.id, json!(1));
    assert_eq!(refused.error_code(), Some("command_disabled"));
    assert_eq!(refused.error_message(), Some("Command disabled: toy_load"));

    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
    assert_eq!(counters.toy_loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn enabled_toy_load_reaches_the_provider() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let mut client = channel.connect().unwrap();
    client.send(request(1, "toy_load")).await.unwrap();
    client.send(request(2, "shutdown")).await.unwrap();

    let counters = Counters::default();
    let controller = Controller::new(
        settings(CommandPolicy::default().with("toy_load", true)),
        registry,
        CountingProvider(counters.clone()),
    );
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    let loaded = client.recv().await.unwrap();
    assert!(!loaded.is_error());
    assert_eq!(loaded.data["paper_id"], json!("toy"));

    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
    assert_eq!(counters.toy_loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_input_is_answered_and_serving_continues() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let mut client = channel.connect().unwrap();
    client.send(request(1, "frobnicate")).await.unwrap();
    client.send_raw("expected value at line 1 column 1").await.unwrap();
    client.send(request(3, "ping")).await.unwrap();
    client.send(request(4, "shutdown")).await.unwrap();

    let controller = Controller::new(ControllerSettings::default(), registry, MemoryProvider::new());
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    let unknown = client.recv().await.unwrap();
    assert_eq!(unknown.id, json!(1));
    assert_eq!(unknown.command, "frobnicate");
    assert_eq!(unknown.error_code(), Some("invalid_command"));
    assert_eq!(unknown.error_message(), Some("Invalid input to server."));

    let malformed = client.recv().await.unwrap();
    assert_eq!(malformed.id, Value::Null);
    assert_eq!(malformed.error_code(), Some("parse_error"));

    assert_eq!(client.recv().await.unwrap().data, json!("pong"));
    assert_eq!(client.recv().await.unwrap().data, Value::Null);
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
}

#[tokio::test]
async fn clients_come_and_go_while_serving() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let controller = Controller::new(
        ControllerSettings::default(),
        registry.clone(),
        MemoryProvider::with_toy_data(),
    );
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    let mut early = channel.connect().unwrap();
    early.send(request(1, "ping")).await.unwrap();
    assert_eq!(early.recv().await.unwrap().data, json!("pong"));
    early.disconnect().await.unwrap();
    assert!(registry.is_empty());

    let mut late = channel.connect().unwrap();
    late.send(Request::new(
        2,
        "get_paper_list",
        Params::new().with("draw", 7).with("start", 0).with("length", -1),
    ))
    .await
    .unwrap();
    let list = late.recv().await.unwrap();
    assert_eq!(list.data["draw"], json!(7));
    assert_eq!(list.data["recordsTotal"], json!(1));
    assert_eq!(list.data["data"].as_array().unwrap().len(), 1);

    late.send(request(3, "shutdown")).await.unwrap();
    assert_eq!(late.recv().await.unwrap().data, Value::Null);
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
}

#[tokio::test]
async fn annotation_edits_are_visible_to_other_clients() {
    let registry = ClientRegistry::new();
    let channel = ChannelInterface::new(registry.clone(), 8);
    let controller = Controller::new(
        ControllerSettings::default(),
        registry,
        MemoryProvider::with_toy_data(),
    );
    let running = tokio::spawn(controller.start(vec![Box::new(channel.clone())]));

    let mut writer = channel.connect().unwrap();
    let mut reader = channel.connect().unwrap();

    writer
        .send(Request::new(
            1,
            "save_comments",
            Params::new()
                .with("paperID", "PMC3398920")
                .with("comments", "check line 4"),
        ))
        .await
        .unwrap();
    assert_eq!(writer.recv().await.unwrap().data, json!(true));

    reader
        .send(Request::new(
            2,
            "get_comments",
            Params::new().with("paperID", "PMC3398920"),
        ))
        .await
        .unwrap();
    assert_eq!(reader.recv().await.unwrap().data["comment"], json!("check line 4"));

    reader.send(request(3, "shutdown")).await.unwrap();
    reader.recv().await.unwrap();
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Shutdown);
}
