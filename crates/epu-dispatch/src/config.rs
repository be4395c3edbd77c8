use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use epu_core::{Address, DEFAULT_DISPATCHER_ENDPOINT, default_broker_socket};
use serde::Deserialize;
use thiserror::Error;

use crate::client::DEFAULT_TIMEOUT;

/// Optional messaging settings read from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessagingConfig {
    /// Broker socket path.
    pub broker_socket: Option<PathBuf>,
    /// Dispatcher endpoint name.
    pub endpoint: Option<String>,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read messaging config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse messaging config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl MessagingConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Layers explicit overrides on top of this file's values and defaults.
    pub fn resolve(
        &self,
        broker_socket: Option<PathBuf>,
        endpoint: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Settings {
        Settings {
            broker_socket: broker_socket
                .or_else(|| self.broker_socket.clone())
                .unwrap_or_else(default_broker_socket),
            endpoint: Address::new(
                endpoint
                    .or_else(|| self.endpoint.clone())
                    .unwrap_or_else(|| DEFAULT_DISPATCHER_ENDPOINT.to_string()),
            ),
            timeout: timeout_ms
                .or(self.timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TIMEOUT),
        }
    }
}

/// Effective messaging settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker_socket: PathBuf,
    pub endpoint: Address,
    pub timeout: Duration,
}
