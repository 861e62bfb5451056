//! In-process transport
//!
//! Used by embedders and tests: each [`RemoteClient`] is the "far end" of a
//! registered client handle and talks to the controller through bounded
//! queues instead of a socket.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use super::queued::{QueueEnds, QueuedHandle};
use super::{ClientHandle, Interface};
use crate::controller::error::{RegistryError, TransportError};
use crate::controller::message::{Inbound, Reply, Request};
use crate::controller::registry::{ClientId, ClientRegistry};

/// Interface whose clients live in the same process.
///
/// Clones share their client list, so a clone kept by the embedder can keep
/// connecting clients after another clone was handed to the controller.
#[derive(Clone)]
pub struct ChannelInterface {
    name: String,
    registry: ClientRegistry,
    capacity: usize,
    next_label: Arc<AtomicU64>,
    clients: Arc<Mutex<Vec<Arc<QueuedHandle>>>>,
}

impl ChannelInterface {
    /// Create an interface registering into `registry`; `capacity` bounds each queue
    pub fn new(registry: ClientRegistry, capacity: usize) -> Self {
        Self::named("channel", registry, capacity)
    }

    /// Same as [`new`](Self::new) with a custom name for logs
    pub fn named(name: impl Into<String>, registry: ClientRegistry, capacity: usize) -> Self {
        Self {
            name: name.into(),
            registry,
            capacity,
            next_label: Arc::new(AtomicU64::new(1)),
            clients: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Connect a new client and register its handle
    pub fn connect(&self) -> Result<RemoteClient, RegistryError> {
        let label = format!(
            "{}#{}",
            self.name,
            self.next_label.fetch_add(1, Ordering::Relaxed)
        );
        let (handle, ends) = QueuedHandle::new(label, self.capacity);
        let dyn_handle: Arc<dyn ClientHandle> = handle.clone();
        let id = self.registry.register(Arc::clone(&dyn_handle))?;
        self.clients.lock().push(Arc::clone(&handle));

        Ok(RemoteClient {
            id,
            handle,
            dyn_handle,
            ends,
            registry: self.registry.clone(),
            clients: Arc::clone(&self.clients),
        })
    }

    /// Clients connected through this interface and not yet closed
    pub fn connected(&self) -> usize {
        self.clients.lock().iter().filter(|c| !c.is_closed()).count()
    }
}

impl Interface for ChannelInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let clients: Vec<_> = self.clients.lock().drain(..).collect();
            for client in clients {
                client.shut();
                let handle: Arc<dyn ClientHandle> = client;
                if self.registry.deregister(&handle).is_ok() {
                    debug!(interface = %self.name, label = handle.label(), "client removed at shutdown");
                }
            }
            Ok(())
        }
        .boxed()
    }
}

/// The client side of a channel connection.
///
/// Dropping it is a disconnect: the handle is closed and deregistered.
pub struct RemoteClient {
    id: ClientId,
    handle: Arc<QueuedHandle>,
    dyn_handle: Arc<dyn ClientHandle>,
    ends: QueueEnds,
    registry: ClientRegistry,
    clients: Arc<Mutex<Vec<Arc<QueuedHandle>>>>,
}

impl RemoteClient {
    /// Registration id of this client's handle
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether the server side closed the connection
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Send a request
    pub async fn send(&self, request: Request) -> Result<(), TransportError> {
        self.push(Inbound::Request(request)).await
    }

    /// Send input the server cannot decode
    pub async fn send_raw(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.push(Inbound::Malformed {
            reason: reason.into(),
        })
        .await
    }

    async fn push(&self, inbound: Inbound) -> Result<(), TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Closed);
        }
        self.ends
            .requests
            .send(inbound)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next reply; `None` once the connection is closed and drained
    pub async fn recv(&mut self) -> Option<Reply> {
        let mut closed = self.handle.subscribe_closed();
        tokio::select! {
            biased;
            reply = self.ends.replies.recv() => reply,
            _ = closed.wait_for(|closed| *closed) => self.ends.replies.try_recv().ok(),
        }
    }

    /// Reply already queued, without waiting
    pub fn try_recv(&mut self) -> Option<Reply> {
        match self.ends.replies.try_recv() {
            Ok(reply) => Some(reply),
            Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => None,
        }
    }

    /// Close the connection and deregister the handle
    pub async fn disconnect(self) -> Result<ClientId, RegistryError> {
        self.dyn_handle.close().await;
        self.forget();
        self.registry.deregister(&self.dyn_handle)
    }

    fn forget(&self) {
        self.clients
            .lock()
            .retain(|client| !Arc::ptr_eq(client, &self.handle));
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.handle.shut();
        self.forget();
        if self.registry.deregister(&self.dyn_handle).is_ok() {
            debug!(client = %self.id, label = self.handle.label(), "client dropped without disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_registers_and_disconnect_deregisters() {
        let registry = ClientRegistry::new();
        let interface = ChannelInterface::new(registry.clone(), 8);
        let client = interface.connect().unwrap();
        assert!(registry.contains(client.id()));
        assert_eq!(interface.connected(), 1);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let id = runtime.block_on(client.disconnect()).unwrap();
        assert!(!registry.contains(id));
        assert_eq!(interface.connected(), 0);
    }

    #[test]
    fn dropping_a_client_disconnects_it() {
        let registry = ClientRegistry::new();
        let interface = ChannelInterface::new(registry.clone(), 8);
        let dropped = interface.connect().unwrap();
        let kept = interface.connect().unwrap();
        let dropped_handle = Arc::clone(&dropped.handle);

        drop(dropped);
        assert!(dropped_handle.is_closed());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(kept.id()));
        assert_eq!(interface.connected(), 1);
        assert_eq!(interface.clients.lock().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_and_deregisters_every_client() {
        let registry = ClientRegistry::new();
        let mut interface = ChannelInterface::new(registry.clone(), 8);
        let mut a = interface.connect().unwrap();
        let b = interface.connect().unwrap();
        assert_eq!(registry.len(), 2);

        interface.shutdown().await.unwrap();
        assert!(registry.is_empty());
        assert!(a.is_closed());
        assert!(a.recv().await.is_none());
        assert!(matches!(
            b.send(Request::new(1, "ping", Default::default())).await,
            Err(TransportError::Closed)
        ));
    }
}
