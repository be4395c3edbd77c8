use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category carried by a fault reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    UnknownOperation,
    Internal,
}

/// Failure raised by a bus service while handling a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn unknown_operation(op: &str) -> Self {
        Self {
            code: ErrorCode::UnknownOperation,
            message: format!("operation {op} is not supported"),
        }
    }
}
