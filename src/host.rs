//! Host-process helpers
//!
//! Builds one controller instance from a [`ServerConfig`] and runs it to
//! completion. The caller decides what to do with the [`Outcome`].

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::controller::{ClientRegistry, Controller, ControllerError, Outcome};
use crate::interface::Interface;
use crate::interface::ndjson::NdjsonInterface;
use crate::provider::MemoryProvider;

/// Failure to build or run an instance
#[derive(Debug, Error)]
pub enum HostError {
    /// An interface could not bind its address
    #[error("Interface '{name}' failed to bind {listen}: {source}")]
    Bind {
        /// Interface name
        name: String,
        /// Configured address
        listen: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// The controller stopped on a fatal error
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Build a provider according to the configuration
pub fn build_provider(config: &ServerConfig) -> MemoryProvider {
    if config.provider.seed_toy_data {
        MemoryProvider::with_toy_data()
    } else {
        MemoryProvider::new()
    }
}

/// Bind every configured interface into `registry`
pub async fn bind_interfaces(
    config: &ServerConfig,
    registry: &ClientRegistry,
) -> Result<Vec<Box<dyn Interface>>, HostError> {
    let mut interfaces: Vec<Box<dyn Interface>> = Vec::new();
    for entry in &config.interfaces {
        match NdjsonInterface::bind(entry.listen.as_str(), registry.clone()).await {
            Ok(interface) => {
                info!(interface = %entry.name, addr = %interface.local_addr(), "interface bound");
                interfaces.push(Box::new(interface));
            }
            Err(source) => {
                for bound in interfaces.iter_mut() {
                    if let Err(err) = bound.shutdown().await {
                        warn!(interface = bound.name(), error = %err, "failed to release interface");
                    }
                }
                return Err(HostError::Bind {
                    name: entry.name.clone(),
                    listen: entry.listen.clone(),
                    source,
                });
            }
        }
    }
    Ok(interfaces)
}

/// Run one controller instance until it restarts, shuts down or fails
pub async fn start_instance(config: &ServerConfig) -> Result<Outcome, HostError> {
    let registry = ClientRegistry::new();
    let interfaces = bind_interfaces(config, &registry).await?;
    let provider = build_provider(config);
    let controller = Controller::new(config.controller_settings(), registry, provider);
    Ok(controller.start(interfaces).await?)
}
