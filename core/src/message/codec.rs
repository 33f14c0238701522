// Message codec — serialization with size limits to prevent abuse

use super::types::OverlayMessage;
use thiserror::Error;

/// Maximum encoded frame size: 256 KB
/// This prevents memory exhaustion from malicious oversized frames.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Maximum payload: 64 KB
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Failures turning a message into a wire frame or back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Serialize a message to a wire frame (bincode)
pub fn encode_message(msg: &OverlayMessage) -> Result<Vec<u8>, CodecError> {
    if msg.contents.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: msg.contents.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let bytes =
        bincode::serialize(msg).map_err(|e| CodecError::Serialization(e.to_string()))?;

    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(bytes)
}

/// Deserialize a wire frame back to a message
pub fn decode_message(bytes: &[u8]) -> Result<OverlayMessage, CodecError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    bincode::deserialize(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}
