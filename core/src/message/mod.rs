// Message module — the overlay wire envelope and its serialization

pub mod types;
pub mod codec;

pub use types::{OverlayMessage, UNBOUNDED_HOPS};
pub use codec::{encode_message, decode_message, CodecError};
