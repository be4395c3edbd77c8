use epu_core::Address;
use thiserror::Error;

/// Transport and serialization failures on the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Underlying socket I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Frame encoding failed.
    #[error("failed to encode cbor frame: {0}")]
    Encode(String),
    /// Frame decoding failed.
    #[error("failed to decode cbor frame: {0}")]
    Decode(String),
    /// Frame size exceeded maximum allowed payload.
    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: u32, max: u32 },
    /// No mailbox is bound at the destination address.
    #[error("no endpoint bound at {address}")]
    Unreachable { address: Address },
    /// Another live mailbox already owns the address.
    #[error("address {address} is already bound")]
    AddressInUse { address: Address },
    /// The broker refused a bind request.
    #[error("broker rejected bind of {address}: {reason}")]
    BindRejected { address: Address, reason: String },
    /// The transport session is gone.
    #[error("transport closed")]
    Closed,
}
