//! Frames exchanged between a [`SocketTransport`](crate::SocketTransport)
//! and the broker.

use epu_core::{Address, CorrelationId, Message};
use serde::{Deserialize, Serialize};

/// Frames sent by a connected transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Claims an address for this connection, replacing an earlier binding
    /// of the same address on this connection.
    Bind { address: Address, binding: u64 },
    /// Releases an address if `binding` is still the one holding it.
    Unbind { address: Address, binding: u64 },
    /// Routes a message to its destination.
    Send { message: Message },
}

/// Frames sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    /// Bind acknowledgment.
    Bound { address: Address },
    /// Bind refusal.
    BindRejected { address: Address, reason: String },
    /// Message addressed to one of this connection's addresses.
    Deliver { message: Message },
    /// A message sent on this connection had no route.
    Bounced {
        /// Unresolved destination.
        to: Address,
        /// Reply address of the bounced message.
        reply_to: Address,
        /// Correlation token of the bounced message.
        correlation_id: CorrelationId,
        /// Why routing failed.
        reason: String,
    },
}
