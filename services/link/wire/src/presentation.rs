//! Wire presentations: the two ways a message can be laid out on a link.
//!
//! The send pipeline resolves every queued message against the presentation
//! of the connection it is about to leave on, which fixes its byte form and
//! length. The receive side uses the same presentation to parse it back.

use bytes::BytesMut;

use crate::frame::{self, DEFAULT_MAX_FRAME_BODY};
use crate::legacy;
use crate::message::Message;
use crate::WireError;

/// Outcome of parsing one message from the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Not enough bytes yet; `skipped` leading padding bytes may be discarded
    NeedMore {
        /// Padding bytes already seen
        skipped: usize,
    },
    /// One complete message
    Message {
        /// The decoded message
        message: Message,
        /// Bytes consumed including leading padding
        consumed: usize,
        /// Length of the trailing bulk field that follows (legacy only)
        trailer_len: u64,
    },
}

/// Identifies a presentation, used as a cache key for resolved bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentationKind {
    /// Length-prefixed frames, bulk data as flow-controlled chunks
    Multiplexed,
    /// One message at a time, bulk data inline after the message
    Legacy,
}

/// Serialises and parses single messages for one link format
pub trait WirePresentation: Send + Sync + std::fmt::Debug {
    /// Which format this is
    fn kind(&self) -> PresentationKind;

    /// Encoded length of a message (inline trailer excluded)
    fn encoded_len(&self, message: &Message) -> usize;

    /// Append the encoded message to `buf`
    fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), WireError>;

    /// Parse one message from the front of `buf`
    fn parse(&self, buf: &[u8]) -> Result<Parsed, WireError>;

    /// Largest body the peer's parser accepts
    fn max_body(&self) -> usize;

    /// Whether bulk payloads travel inline after their message
    fn inline_bulk(&self) -> bool {
        self.kind() == PresentationKind::Legacy
    }
}

/// Multiplexed presentation
#[derive(Debug, Clone, Copy)]
pub struct MuxPresentation {
    max_body: usize,
}

impl MuxPresentation {
    /// Create a presentation accepting frame bodies up to `max_body`
    pub fn new(max_body: usize) -> Self {
        Self {
            max_body: max_body.min(DEFAULT_MAX_FRAME_BODY),
        }
    }
}

impl Default for MuxPresentation {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BODY)
    }
}

impl WirePresentation for MuxPresentation {
    fn kind(&self) -> PresentationKind {
        PresentationKind::Multiplexed
    }

    fn encoded_len(&self, message: &Message) -> usize {
        frame::encoded_len(message)
    }

    fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), WireError> {
        frame::encode_message(message, buf)
    }

    fn max_body(&self) -> usize {
        self.max_body
    }

    fn parse(&self, buf: &[u8]) -> Result<Parsed, WireError> {
        if buf.len() < 2 {
            return Ok(Parsed::NeedMore { skipped: 0 });
        }
        let total = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if total > self.max_body {
            return Err(WireError::FrameTooLarge {
                len: total,
                max: self.max_body,
            });
        }
        if buf.len() < 2 + total {
            return Ok(Parsed::NeedMore { skipped: 0 });
        }
        let body = bytes::Bytes::copy_from_slice(&buf[2..2 + total]);
        let message = frame::decode_body(body)?;
        Ok(Parsed::Message {
            message,
            consumed: 2 + total,
            trailer_len: 0,
        })
    }
}

/// Legacy presentation
#[derive(Debug, Clone, Copy)]
pub struct LegacyPresentation {
    max_body: usize,
}

impl LegacyPresentation {
    /// Create a presentation accepting bodies up to `max_body`
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl Default for LegacyPresentation {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BODY)
    }
}

impl WirePresentation for LegacyPresentation {
    fn kind(&self) -> PresentationKind {
        PresentationKind::Legacy
    }

    fn encoded_len(&self, message: &Message) -> usize {
        legacy::legacy_encoded_len(message)
    }

    fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), WireError> {
        legacy::encode_legacy(message, buf)
    }

    fn max_body(&self) -> usize {
        self.max_body
    }

    fn parse(&self, buf: &[u8]) -> Result<Parsed, WireError> {
        legacy::parse_legacy(buf, self.max_body)
    }
}
