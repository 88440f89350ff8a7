//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete message (need more data)
    #[error("incomplete message")]
    Incomplete,

    /// Declared frame length exceeds the configured maximum
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Declared frame length cannot hold a type id
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Unknown message type
    #[error("unknown message type {0}")]
    Type(u16),

    /// Payload does not match the layout of its type
    #[error("malformed {0} payload")]
    Malformed(&'static str),

    /// Legacy stream contained a byte that is neither padding nor a marker
    #[error("bad legacy marker 0x{0:02x}")]
    Marker(u8),

    /// Message is too large to be framed at all
    #[error("message of {0} bytes does not fit a frame")]
    Oversized(usize),
}
