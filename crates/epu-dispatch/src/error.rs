use std::{path::PathBuf, time::Duration};

use epu_bus::BusError;
use epu_core::{Address, ErrorCode};
use thiserror::Error;

/// The process spec document could not be loaded.
#[derive(Debug, Error)]
pub enum SpecLoadError {
    #[error("failed to read process spec {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse process spec {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("process spec {} must be a JSON object", .path.display())]
    NotAnObject { path: PathBuf },
    #[error("process spec {} is empty", .path.display())]
    Empty { path: PathBuf },
}

/// The client could not establish its messaging session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to message broker at {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: BusError,
    },
    #[error("failed to bind reply address {address}: {source}")]
    Bind {
        address: Address,
        #[source]
        source: BusError,
    },
}

/// Terminal failure of one dispatch attempt.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Rejected locally before anything was sent.
    #[error("invalid dispatch request: {reason}")]
    InvalidRequest { reason: String },
    /// Nothing is bound at the endpoint; the request was not delivered.
    #[error("dispatch endpoint {endpoint} is unreachable: {reason}")]
    EndpointUnreachable { endpoint: Address, reason: String },
    /// The exchange broke after the request may have been sent.
    #[error("transport failure during dispatch: {0}")]
    Transport(#[from] BusError),
    /// No correlated reply within the bound; the outcome is unknown.
    #[error("no reply from {endpoint} within {}ms; outcome unknown", .timeout.as_millis())]
    Timeout { endpoint: Address, timeout: Duration },
    /// A reply arrived but is not a valid dispatch result.
    #[error("invalid reply from {endpoint}: {reason}")]
    Protocol {
        endpoint: Address,
        reason: String,
        /// Reply payload exactly as received.
        payload: Vec<u8>,
    },
    /// The service answered with a fault instead of a result.
    #[error("{endpoint} refused the request [{code:?}]: {message}")]
    Remote {
        endpoint: Address,
        code: ErrorCode,
        message: String,
    },
}

/// Discriminant of [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    EndpointUnreachable,
    Transport,
    Timeout,
    Protocol,
    Remote,
}

/// Whether and how a failed attempt may be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAdvice {
    /// The request never reached the service; any upid is safe.
    Safe,
    /// The service may have acted; retry only with the same upid.
    SameProcessId,
    /// Retrying the same request cannot succeed.
    DoNotRetry,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            DispatchError::EndpointUnreachable { .. } => ErrorKind::EndpointUnreachable,
            DispatchError::Transport(_) => ErrorKind::Transport,
            DispatchError::Timeout { .. } => ErrorKind::Timeout,
            DispatchError::Protocol { .. } => ErrorKind::Protocol,
            DispatchError::Remote { .. } => ErrorKind::Remote,
        }
    }

    pub fn retry_advice(&self) -> RetryAdvice {
        match self.kind() {
            ErrorKind::EndpointUnreachable => RetryAdvice::Safe,
            ErrorKind::Transport | ErrorKind::Timeout => RetryAdvice::SameProcessId,
            ErrorKind::InvalidRequest | ErrorKind::Protocol | ErrorKind::Remote => {
                RetryAdvice::DoNotRetry
            }
        }
    }

    /// True when the remote service may or may not have launched the process.
    pub fn outcome_unknown(&self) -> bool {
        self.retry_advice() == RetryAdvice::SameProcessId
    }

    /// Raw reply bytes of a protocol error.
    pub fn raw_payload(&self) -> Option<&[u8]> {
        match self {
            DispatchError::Protocol { payload, .. } => Some(payload),
            _ => None,
        }
    }
}
