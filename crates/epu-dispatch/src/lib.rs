//! Client side of the process dispatch handshake: send one uniquely
//! identified launch request to a named dispatcher and await its reply.

mod error;

pub mod client;
pub mod config;
pub mod spec_file;

pub use client::{DEFAULT_TIMEOUT, DispatchClient};
pub use config::{ConfigError, MessagingConfig, Settings};
pub use error::{ConnectError, DispatchError, ErrorKind, RetryAdvice, SpecLoadError};
pub use spec_file::load_process_spec;
