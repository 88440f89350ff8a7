//! Message types and framing for peer links.
//!
//! This crate provides the byte-level presentation of link traffic: the typed
//! [`Message`] set exchanged between peers, the multiplexed packet framer that
//! splits a decrypted byte stream into discrete messages, and the legacy
//! single-message framing with inline trailing bulk data.
//!
//! ## Multiplexed Wire Format
//!
//! ```text
//! +----------------------+----------------------------------+
//! | u16 total_len        | length of bytes that follow      |
//! +----------------------+----------------------------------+
//! | u16 type_id          | message type                     |
//! +----------------------+----------------------------------+
//! | payload              | total_len - 2 bytes              |
//! +----------------------+----------------------------------+
//! ```
//!
//! Bulk chunk payloads start with `u16 transfer_id | u32 offset` followed by
//! the raw chunk bytes.
//!
//! ## Legacy Wire Format
//!
//! ```text
//! +-----------+-------------+---------------+------------------+------+---------+
//! | 0x00 pad* | u8 0xA7     | u16 type_id   | u32 body_len     | body | trailer |
//! |           |             |               | u32 trailer_len  |      |         |
//! +-----------+-------------+---------------+------------------+------+---------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod legacy;
pub mod message;
pub mod presentation;

// Re-export main types
pub use error::WireError;
pub use frame::{
    encode_message, encoded_len, padding_for, Decoded, PacketFramer, DEFAULT_MAX_FRAME_BODY,
    FRAME_HEADER_LEN, MIN_PADDING_FRAME,
};
pub use legacy::{encode_legacy, legacy_encoded_len, parse_legacy, LEGACY_HEADER_LEN, LEGACY_MARKER};
pub use message::{
    AppFlags, AppMessage, BulkChunk, BulkHeader, Capabilities, Hello, Message, MessageType,
    CHUNK_HEADER_LEN, GOODBYE_NORMAL, WIRE_VERSION,
};
pub use presentation::{
    LegacyPresentation, MuxPresentation, Parsed, PresentationKind, WirePresentation,
};
