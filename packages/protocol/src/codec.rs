//! Protobuf encoding helpers.

use prost::Message;
use thiserror::Error;

/// Errors decoding a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is not a valid encoding of the expected message.
    #[error("{0}")]
    Decode(#[from] prost::DecodeError),
}

/// Decode a message from a payload.
pub fn decode<M: Message + Default>(payload: &[u8]) -> Result<M, ProtocolError> {
    Ok(M::decode(payload)?)
}

/// Encode a message into a new buffer.
pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}
