use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Renders 128 fresh random bits as 32 lower-case hex characters.
fn random_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Identifies one client instance; doubles as its reply address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(
    /// Hex-encoded 128-bit random token.
    pub String,
);

impl ClientIdentity {
    /// Draws a new identity from the thread-local RNG.
    pub fn generate() -> Self {
        Self(random_token())
    }

    /// Address at which this client receives replies.
    pub fn address(&self) -> Address {
        Address(self.0.clone())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique process identifier (upid), the idempotency key of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(
    /// Opaque identifier string.
    pub String,
);

impl ProcessId {
    /// Draws a new upid for a fresh launch attempt.
    pub fn generate() -> Self {
        Self(random_token())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejected caller-supplied upid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidProcessId {
    #[error("process id cannot be empty")]
    Empty,
    #[error("process id cannot contain whitespace: {0:?}")]
    Whitespace(String),
}

impl FromStr for ProcessId {
    type Err = InvalidProcessId;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(InvalidProcessId::Empty);
        }
        if value.chars().any(char::is_whitespace) {
            return Err(InvalidProcessId::Whitespace(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }
}

/// Logical bus address; resolved by the transport, never a network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates a reply to the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(
    /// Per-client monotonic token assigned at send time.
    pub u64,
);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
