//! Client handle backed by bounded queues
//!
//! The transport side pushes decoded input into the request queue and pops
//! replies from the reply queue; the controller side sees a [`ClientHandle`].
//! Closing flips a watch flag that wakes both directions.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};

use super::ClientHandle;
use crate::controller::error::TransportError;
use crate::controller::message::{Inbound, Reply};

/// Transport-side ends of a [`QueuedHandle`]
#[derive(Debug)]
pub struct QueueEnds {
    /// Push decoded client input here
    pub requests: mpsc::Sender<Inbound>,
    /// Pop replies for the client here
    pub replies: mpsc::Receiver<Reply>,
}

/// Controller-side handle over a pair of bounded queues
#[derive(Debug)]
pub struct QueuedHandle {
    label: String,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    outbound: mpsc::Sender<Reply>,
    closed: watch::Sender<bool>,
}

impl QueuedHandle {
    /// Create a handle whose queues hold at most `capacity` items each
    pub fn new(label: impl Into<String>, capacity: usize) -> (Arc<Self>, QueueEnds) {
        let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
        let (reply_tx, reply_rx) = mpsc::channel(capacity.max(1));
        let handle = Arc::new(Self {
            label: label.into(),
            inbound: Mutex::new(request_rx),
            outbound: reply_tx,
            closed: watch::Sender::new(false),
        });
        let ends = QueueEnds {
            requests: request_tx,
            replies: reply_rx,
        };
        (handle, ends)
    }

    /// Whether the handle was closed
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver that observes the closed flag
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Mark the handle closed; idempotent
    pub fn shut(&self) {
        self.closed.send_replace(true);
    }
}

impl ClientHandle for QueuedHandle {
    fn label(&self) -> &str {
        &self.label
    }

    fn next_request(&self) -> BoxFuture<'_, Inbound> {
        async move {
            let mut closed = self.closed.subscribe();
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                biased;
                item = inbound.recv() => match item {
                    Some(item) => item,
                    None => {
                        // Sender gone and queue drained; every earlier reply
                        // was already queued, so the writer may finish.
                        self.shut();
                        Inbound::Closed
                    }
                },
                _ = closed.wait_for(|closed| *closed) => Inbound::Closed,
            }
        }
        .boxed()
    }

    fn send_reply(&self, reply: Reply) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            let mut closed = self.closed.subscribe();
            tokio::select! {
                sent = self.outbound.send(reply) => sent.map_err(|_| TransportError::Closed),
                _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            }
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move { self.shut() }.boxed()
    }
}
