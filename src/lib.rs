//! Scholia – controller core for a collaborative text-annotation server
//!
//! Editors connect through one or more transports, send commands and receive
//! replies. This crate provides:
//! - A client registry with a level-triggered "membership changed" signal
//! - A watch multiplexer keeping one outstanding read per connected client
//! - A statically checked command table with a configurable enablement policy
//! - A lifecycle state machine for race-free restart and shutdown
//! - An in-memory persistence service and two transports (in-process, NDJSON/TCP)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime configuration
pub mod config;

/// Controller core: registry, multiplexer, dispatcher, lifecycle
pub mod controller;

/// Host-process helpers
pub mod host;

/// Transport contracts and implementations
pub mod interface;

/// Persistence service contract and implementations
pub mod provider;

// Re-export key types for convenience
pub use config::ServerConfig;
pub use controller::{ClientRegistry, Controller, ControllerSettings, Outcome};

/// Current version of the server
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
