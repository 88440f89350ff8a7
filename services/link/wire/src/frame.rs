//! Multiplexed packet framing.
//!
//! Each message is written as `u16 total_len | u16 type_id | payload` where
//! `total_len` covers the type id and payload but not itself. The
//! [`PacketFramer`] decodes a stream of such frames incrementally and copes
//! with the length prefix or body being split across any number of reads.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use tracing::trace;

use crate::message::{Message, MessageType};
use crate::WireError;

/// Length prefix + type id
pub const FRAME_HEADER_LEN: usize = 2 + 2;

/// Largest body a `u16` length prefix can describe
pub const DEFAULT_MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Smallest possible padding frame (header with empty payload)
pub const MIN_PADDING_FRAME: usize = FRAME_HEADER_LEN;

/// Messages produced by one call to [`PacketFramer::feed`]
pub type Decoded = SmallVec<[Message; 4]>;

/// Encoded size of a message including its frame header
pub fn encoded_len(message: &Message) -> usize {
    FRAME_HEADER_LEN + message.payload_len()
}

/// Append one framed message to `buf`
pub fn encode_message(message: &Message, buf: &mut BytesMut) -> Result<(), WireError> {
    let body_len = 2 + message.payload_len();
    if body_len > DEFAULT_MAX_FRAME_BODY {
        return Err(WireError::Oversized(body_len));
    }

    buf.reserve(2 + body_len);
    buf.put_u16(body_len as u16);
    buf.put_u16(message.message_type() as u16);
    message.encode_payload(buf);
    Ok(())
}

/// Padding messages that bring `len` up to a multiple of `boundary`.
///
/// Empty when `len` is already aligned. When the gap is smaller than a
/// minimal padding frame the next boundary is used instead. A gap wider than
/// one frame with a body of `max_body` is split over several frames.
pub fn padding_for(len: usize, boundary: usize, max_body: usize) -> Decoded {
    let mut out = Decoded::new();
    if boundary == 0 {
        return out;
    }
    let rem = len % boundary;
    if rem == 0 {
        return out;
    }

    let mut gap = boundary - rem;
    while gap < MIN_PADDING_FRAME {
        gap += boundary;
    }
    let widest = (2 + max_body.min(DEFAULT_MAX_FRAME_BODY)).max(2 * MIN_PADDING_FRAME);
    while gap > 0 {
        let mut frame = gap.min(widest);
        let left = gap - frame;
        if left > 0 && left < MIN_PADDING_FRAME {
            frame -= MIN_PADDING_FRAME;
        }
        out.push(Message::Padding {
            len: (frame - FRAME_HEADER_LEN) as u16,
        });
        gap -= frame;
    }
    out
}

/// Body being buffered: declared total and bytes collected so far
#[derive(Debug)]
struct PartialBody {
    total: usize,
    buf: BytesMut,
}

/// Incremental decoder for multiplexed frames
#[derive(Debug)]
pub struct PacketFramer {
    max_body: usize,
    prefix: [u8; 2],
    prefix_len: usize,
    body: Option<PartialBody>,
}

impl PacketFramer {
    /// Create a new framer accepting bodies up to `max_body` bytes
    pub fn new(max_body: usize) -> Self {
        Self {
            max_body: max_body.min(DEFAULT_MAX_FRAME_BODY),
            prefix: [0; 2],
            prefix_len: 0,
            body: None,
        }
    }

    /// Whether the framer sits on a frame boundary
    pub fn is_idle(&self) -> bool {
        self.prefix_len == 0 && self.body.is_none()
    }

    /// Bytes of the current frame buffered so far (prefix + body)
    pub fn buffered(&self) -> usize {
        self.prefix_len + self.body.as_ref().map_or(0, |b| b.buf.len())
    }

    /// Feed decrypted bytes and return every message they complete.
    ///
    /// A corrupt or over-length frame is a hard error; the framer does not
    /// try to resynchronise and must be discarded together with its stream.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Decoded, WireError> {
        let mut out = Decoded::new();

        while !data.is_empty() {
            match self.body.as_mut() {
                None => {
                    let take = (2 - self.prefix_len).min(data.len());
                    self.prefix[self.prefix_len..self.prefix_len + take]
                        .copy_from_slice(&data[..take]);
                    self.prefix_len += take;
                    data = &data[take..];

                    if self.prefix_len == 2 {
                        let total = u16::from_be_bytes(self.prefix) as usize;
                        self.prefix_len = 0;
                        if total < 2 {
                            return Err(WireError::FrameTooShort(total));
                        }
                        if total > self.max_body {
                            return Err(WireError::FrameTooLarge {
                                len: total,
                                max: self.max_body,
                            });
                        }
                        self.body = Some(PartialBody {
                            total,
                            buf: BytesMut::with_capacity(total),
                        });
                    }
                }
                Some(body) => {
                    let take = (body.total - body.buf.len()).min(data.len());
                    body.buf.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if body.buf.len() == body.total {
                        let complete = self.body.take().map(|b| b.buf.freeze());
                        if let Some(frame) = complete {
                            out.push(decode_body(frame)?);
                        }
                    }
                }
            }
        }

        trace!(decoded = out.len(), pending = self.buffered(), "framer fed");
        Ok(out)
    }
}

/// Decode a complete frame body (type id + payload)
pub(crate) fn decode_body(mut body: Bytes) -> Result<Message, WireError> {
    if body.len() < 2 {
        return Err(WireError::FrameTooShort(body.len()));
    }
    let typ = MessageType::try_from(u16::from_be_bytes([body[0], body[1]]))?;
    let payload = body.split_off(2);
    Message::decode_payload(typ, payload)
}
