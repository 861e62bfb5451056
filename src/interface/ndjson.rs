//! Newline-delimited JSON over TCP
//!
//! Each line from the peer is one request object; each reply is written as
//! one line. Lines that do not decode are passed to the controller as
//! malformed input so the peer gets an error reply.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::queued::{QueueEnds, QueuedHandle};
use super::{ClientHandle, Interface};
use crate::controller::error::TransportError;
use crate::controller::message::{Inbound, Reply, Request};
use crate::controller::registry::ClientRegistry;

const QUEUE_CAPACITY: usize = 32;

/// TCP listener speaking newline-delimited JSON
pub struct NdjsonInterface {
    name: String,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    acceptor: Option<JoinHandle<()>>,
}

impl NdjsonInterface {
    /// Bind `addr` and start accepting connections into `registry`
    pub async fn bind(addr: impl ToSocketAddrs, registry: ClientRegistry) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, stop) = watch::channel(false);
        let acceptor = tokio::spawn(accept_loop(listener, registry, stop));
        info!(addr = %local_addr, "ndjson interface listening");

        Ok(Self {
            name: format!("ndjson:{}", local_addr),
            local_addr,
            shutdown,
            acceptor: Some(acceptor),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Interface for NdjsonInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            self.shutdown.send_replace(true);
            match self.acceptor.take() {
                Some(acceptor) => acceptor
                    .await
                    .map_err(|err| TransportError::Task(err.to_string())),
                None => Ok(()),
            }
        }
        .boxed()
    }
}

impl Drop for NdjsonInterface {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(listener: TcpListener, registry: ClientRegistry, mut stop: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();
    let connection_stop = stop.clone();

    loop {
        tokio::select! {
            _ = stop.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(stream, peer, registry.clone(), connection_stop.clone()));
                }
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                }
            },
            Some(finished) = connections.join_next() => {
                if let Err(err) = finished {
                    warn!(error = %err, "connection task failed");
                }
            }
        }
    }

    drop(listener);
    while let Some(finished) = connections.join_next().await {
        if let Err(err) = finished {
            warn!(error = %err, "connection task failed during shutdown");
        }
    }
    debug!("ndjson acceptor stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: ClientRegistry,
    stop: watch::Receiver<bool>,
) {
    let (handle, ends) = QueuedHandle::new(peer.to_string(), QUEUE_CAPACITY);
    let dyn_handle: Arc<dyn ClientHandle> = handle.clone();
    let id = match registry.register(Arc::clone(&dyn_handle)) {
        Ok(id) => id,
        Err(err) => {
            warn!(peer = %peer, error = %err, "could not register connection");
            return;
        }
    };
    debug!(peer = %peer, client = %id, "connection opened");

    let QueueEnds { requests, replies } = ends;
    let (read_half, write_half) = stream.into_split();
    let reading = async {
        // On EOF only the request queue closes; the handle shuts itself once
        // the controller has taken the last request and its reply is queued.
        if let ReadEnd::Failed = read_requests(read_half, requests, &handle, stop.clone()).await {
            handle.shut();
        }
    };
    let writing = write_replies(write_half, replies, &handle, stop.clone());
    tokio::join!(reading, writing);

    if registry.deregister(&dyn_handle).is_err() {
        debug!(peer = %peer, client = %id, "connection was already deregistered");
    }
    debug!(peer = %peer, client = %id, "connection closed");
}

enum ReadEnd {
    Eof,
    Stopped,
    Failed,
}

async fn read_requests(
    read_half: OwnedReadHalf,
    requests: mpsc::Sender<Inbound>,
    handle: &QueuedHandle,
    mut stop: watch::Receiver<bool>,
) -> ReadEnd {
    let mut lines = BufReader::new(read_half).lines();
    let mut closed = handle.subscribe_closed();

    loop {
        let line = tokio::select! {
            _ = stop.wait_for(|stop| *stop) => return ReadEnd::Stopped,
            _ = closed.wait_for(|closed| *closed) => return ReadEnd::Stopped,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(label = handle.label(), "peer finished sending");
                return ReadEnd::Eof;
            }
            Err(err) => {
                debug!(label = handle.label(), error = %err, "read failed");
                return ReadEnd::Failed;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let inbound = match serde_json::from_str::<Request>(&line) {
            Ok(request) => Inbound::Request(request),
            Err(err) => Inbound::Malformed {
                reason: err.to_string(),
            },
        };
        if requests.send(inbound).await.is_err() {
            return ReadEnd::Failed;
        }
    }
}

async fn write_replies(
    write_half: OwnedWriteHalf,
    mut replies: mpsc::Receiver<Reply>,
    handle: &QueuedHandle,
    mut stop: watch::Receiver<bool>,
) {
    let mut writer = BufWriter::new(write_half);
    let mut closed = handle.subscribe_closed();

    loop {
        let reply = tokio::select! {
            biased;
            reply = replies.recv() => reply,
            _ = closed.wait_for(|closed| *closed) => None,
            _ = stop.wait_for(|stop| *stop) => None,
        };
        let Some(reply) = reply else { break };
        if let Err(err) = write_reply(&mut writer, &reply).await {
            debug!(label = handle.label(), error = %err, "write failed");
            handle.shut();
            return;
        }
    }

    // Replies queued before the close still go out.
    while let Ok(reply) = replies.try_recv() {
        if write_reply(&mut writer, &reply).await.is_err() {
            break;
        }
    }
    handle.shut();
    let _ = writer.shutdown().await;
}

async fn write_reply(writer: &mut BufWriter<OwnedWriteHalf>, reply: &Reply) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(reply)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
