use serde::{Serialize, de::DeserializeOwned};

use crate::BusError;

/// Serializes a bus frame to CBOR.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, BusError> {
    serde_cbor::to_vec(frame).map_err(|err| BusError::Encode(err.to_string()))
}

/// Deserializes a CBOR bus frame.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BusError> {
    serde_cbor::from_slice(bytes).map_err(|err| BusError::Decode(err.to_string()))
}
