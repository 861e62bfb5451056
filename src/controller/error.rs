//! Error types for the controller core
//!
//! Protocol and handler failures never leave the dispatcher: they become error
//! replies. Only [`ControllerError`] reaches the host process.

use std::io;
use thiserror::Error;

use super::registry::ClientId;
use crate::provider::ProviderError;

/// Fatal controller error, surfaced to the host process
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The multiplexer bookkeeping no longer matches the registry
    #[error("Multiplexer invariant violated: {0}")]
    Invariant(String),

    /// A lifecycle transition was requested from the wrong state
    #[error("Illegal lifecycle transition: {0}")]
    Lifecycle(String),
}

/// Misuse of the client registry by a transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The handle is already a member of the registry
    #[error("Client handle is already registered as {0}")]
    AlreadyRegistered(ClientId),

    /// The handle is not a member of the registry
    #[error("Client handle is not registered")]
    NotRegistered,
}

/// Failure while dispatching a single request
///
/// Every variant is converted into an error reply for the originating client.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The client sent something that is not a request
    #[error("Malformed request: {0}")]
    Parse(String),

    /// A required parameter is missing or has the wrong type
    #[error("{0}")]
    InvalidParams(String),

    /// The command name is not in the command table
    #[error("Invalid input to server.")]
    InvalidCommand(String),

    /// The command exists but is disabled by configuration
    #[error("Command disabled: {0}")]
    Disabled(String),

    /// The persistence service reported a failure
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// The handler panicked; the message is best effort
    #[error("Server returned an error: {0}")]
    Panicked(String),

    /// A result could not be encoded into the reply payload
    #[error("Could not encode result: {0}")]
    Encode(#[from] serde_json::Error),

    /// A local resource needed by the handler could not be read
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl DispatchError {
    /// Missing or mistyped parameter
    pub fn invalid_param(name: &str) -> Self {
        DispatchError::InvalidParams(format!("missing or invalid parameter: {}", name))
    }

    /// Stable machine-readable code carried in the error reply
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Parse(_) => "parse_error",
            DispatchError::InvalidParams(_) => "invalid_params",
            DispatchError::InvalidCommand(_) => "invalid_command",
            DispatchError::Disabled(_) => "command_disabled",
            DispatchError::Provider(_) => "provider_error",
            DispatchError::Panicked(_) => "handler_panicked",
            DispatchError::Encode(_) => "encode_error",
            DispatchError::Io(_) => "io_error",
        }
    }
}

/// Transport-level failure reported by a client handle or interface
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is gone; the reply could not be queued
    #[error("Connection closed")]
    Closed,

    /// Socket-level failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The interface background task ended abnormally
    #[error("Interface task failed: {0}")]
    Task(String),
}

/// Convenience result alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;
