use std::{env, path::PathBuf};

/// Resolves the broker socket path from the environment, else `/tmp`.
pub fn default_broker_socket() -> PathBuf {
    match env::var_os("EPU_BROKER_SOCKET") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from("/tmp/epu-broker.sock"),
    }
}
