//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, encoding or decoding protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// An interned string index is not present in the changeset.
    #[error("unknown interned string {0}")]
    UnknownInternString(u32),

    /// A string buffer range lies outside the changeset's buffer.
    #[error("string range {offset}+{size} exceeds buffer of {buffer_len} bytes")]
    BadStringRange {
        /// Range offset.
        offset: u32,
        /// Range size.
        size: u32,
        /// Length of the buffer.
        buffer_len: usize,
    },

    /// A string range does not hold valid UTF-8.
    #[error("string range does not contain valid UTF-8")]
    InvalidUtf8,

    /// An instruction slot position is past its end.
    #[error("slot position {pos} out of range for {size} instructions")]
    SlotPositionOutOfRange {
        /// Requested position.
        pos: usize,
        /// Number of instructions in the slot.
        size: usize,
    },
}

impl ProtocolError {
    /// Creates an encoding error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}
