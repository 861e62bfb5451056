//! Server configuration
//!
//! Stored as pretty-printed JSON. Every field has a default, so a partial file
//! (or none at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::controller::{CommandPolicy, ControllerSettings};

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("Failed to access config file {path:?}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The file is not valid configuration JSON
    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },

    /// The configuration could not be serialized
    #[error("Failed to serialize config: {0}")]
    Encode(#[from] serde_json::Error),

    /// The values are inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One listening endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Name used in logs
    pub name: String,
    /// Socket address to bind, e.g. `127.0.0.1:8090`
    pub listen: String,
}

/// Persistence settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Load the bundled sample paper when an instance starts
    pub seed_toy_data: bool,
}

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening endpoints
    pub interfaces: Vec<InterfaceConfig>,

    /// Persistence settings
    pub provider: ProviderConfig,

    /// Command enablement (name → enabled)
    pub commands: CommandPolicy,

    /// Enable diagnostic commands and verbose logging
    pub debug: bool,

    /// Upper bound for each teardown step, in milliseconds
    pub shutdown_timeout_ms: u64,

    /// File served by the `motd` command
    pub motd_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interfaces: vec![InterfaceConfig {
                name: "ndjson".to_string(),
                listen: "127.0.0.1:8090".to_string(),
            }],
            provider: ProviderConfig::default(),
            commands: CommandPolicy::default(),
            debug: false,
            shutdown_timeout_ms: 5_000,
            motd_file: None,
        }
    }
}

impl ServerConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig =
            serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON, replacing the file atomically
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self)?;
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(io_error)?;
        file.write_all(&json).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);

        fs::rename(&temp_path, path).map_err(io_error)
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "shutdown_timeout_ms must be greater than zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for interface in &self.interfaces {
            if interface.listen.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "interface '{}' has no listen address",
                    interface.name
                )));
            }
            if !names.insert(interface.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "interface name '{}' is used more than once",
                    interface.name
                )));
            }
        }
        Ok(())
    }

    /// Effective command policy (the debug switch applied)
    pub fn command_policy(&self) -> CommandPolicy {
        self.commands.clone().for_debug(self.debug)
    }

    /// Teardown step timeout
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Settings for a controller instance
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            policy: self.command_policy(),
            shutdown_timeout: self.shutdown_timeout(),
            motd_file: self.motd_file.clone(),
        }
    }
}
