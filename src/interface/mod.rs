//! Transport contracts between the controller and connected clients
//!
//! A transport implements two traits: [`Interface`] for the server side (one
//! per listening endpoint) and [`ClientHandle`] for each accepted connection.
//! Transports register handles into the
//! [`ClientRegistry`](crate::controller::registry::ClientRegistry) on connect
//! and deregister them on disconnect.

use futures::future::BoxFuture;

use crate::controller::error::TransportError;
use crate::controller::message::{Inbound, Reply};

pub mod channel;
pub mod ndjson;
pub mod queued;

/// The controller's view of one connected client
pub trait ClientHandle: Send + Sync + 'static {
    /// Short label for logs (peer address, test name)
    fn label(&self) -> &str;

    /// Next input from the client.
    ///
    /// Suspends until input arrives or the handle closes. The controller
    /// cancels this future when the client is deregistered, so it must be
    /// cancel-safe: a cancelled call must not consume input.
    fn next_request(&self) -> BoxFuture<'_, Inbound>;

    /// Queue a reply for the client, waiting under backpressure
    fn send_reply(&self, reply: Reply) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Gracefully close the connection; idempotent
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A listening endpoint owned by one controller instance
pub trait Interface: Send + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Close every client of this interface and stop accepting new ones
    fn shutdown(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;
}
