//! Registry of connected client handles
//!
//! Transports mutate the registry from their own tasks; the multiplexer reads
//! it once per round. Membership changes arm a level-triggered "changed" flag
//! that stays armed until the multiplexer resets it, so a change landing
//! between observation and reset is never lost.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use super::error::RegistryError;
use crate::interface::ClientHandle;

/// Identifier assigned to a handle when it is registered; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.simple().to_string();
        f.write_str(&text[..8])
    }
}

/// A registry member: the handle plus the id it was registered under
#[derive(Clone)]
pub struct RegisteredClient {
    /// Registration id
    pub id: ClientId,
    /// The transport's handle
    pub handle: Arc<dyn ClientHandle>,
}

impl fmt::Debug for RegisteredClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredClient")
            .field("id", &self.id)
            .field("label", &self.handle.label())
            .finish()
    }
}

struct RegistryInner {
    clients: Mutex<Vec<RegisteredClient>>,
    armed: AtomicBool,
    notify: Notify,
}

/// Shared set of connected clients with a "changed" signal
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn same_handle(a: &Arc<dyn ClientHandle>, b: &Arc<dyn ClientHandle>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clients: Mutex::new(Vec::new()),
                armed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Add a handle and arm the changed signal.
    ///
    /// Registering a handle twice is a transport bug and is reported.
    pub fn register(&self, handle: Arc<dyn ClientHandle>) -> Result<ClientId, RegistryError> {
        let id = {
            let mut clients = self.inner.clients.lock();
            if let Some(existing) = clients.iter().find(|c| same_handle(&c.handle, &handle)) {
                return Err(RegistryError::AlreadyRegistered(existing.id));
            }
            let id = ClientId::generate();
            clients.push(RegisteredClient {
                id,
                handle: Arc::clone(&handle),
            });
            id
        };
        debug!(client = %id, label = handle.label(), "client registered");
        self.arm();
        Ok(id)
    }

    /// Remove a handle and arm the changed signal.
    ///
    /// Deregistering an absent handle is a transport bug and is reported.
    pub fn deregister(&self, handle: &Arc<dyn ClientHandle>) -> Result<ClientId, RegistryError> {
        let removed = {
            let mut clients = self.inner.clients.lock();
            let index = clients
                .iter()
                .position(|c| same_handle(&c.handle, handle))
                .ok_or(RegistryError::NotRegistered)?;
            clients.remove(index)
        };
        debug!(client = %removed.id, label = handle.label(), "client deregistered");
        self.arm();
        Ok(removed.id)
    }

    fn arm(&self) {
        if !self.inner.armed.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_one();
        }
    }

    /// Resolves once the changed signal is armed
    pub async fn changed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.armed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Whether a membership change has not been observed yet
    pub fn is_changed(&self) -> bool {
        self.inner.armed.load(Ordering::Acquire)
    }

    /// Mark the current changes as observed; returns whether it was armed
    pub fn reset_changed(&self) -> bool {
        self.inner.armed.swap(false, Ordering::AcqRel)
    }

    /// Copy of the current membership
    pub fn snapshot(&self) -> Vec<RegisteredClient> {
        self.inner.clients.lock().clone()
    }

    /// Whether the client is still registered
    pub fn contains(&self, id: ClientId) -> bool {
        self.inner.clients.lock().iter().any(|c| c.id == id)
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Whether no clients are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every client, returning them; used during teardown
    pub fn clear(&self) -> Vec<RegisteredClient> {
        let drained: Vec<_> = self.inner.clients.lock().drain(..).collect();
        if !drained.is_empty() {
            self.arm();
        }
        drained
    }
}
