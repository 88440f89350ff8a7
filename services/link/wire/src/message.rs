//! Typed link messages and their payload layouts.
//!
//! Every message has a `u16` type id and a payload whose layout depends on
//! the type. Framing (length prefixes, legacy markers) lives in [`crate::frame`]
//! and [`crate::legacy`]; this module only knows about payloads.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Link protocol version carried in HELLO
pub const WIRE_VERSION: u8 = 1;

/// Goodbye reason for an orderly shutdown
pub const GOODBYE_NORMAL: u8 = 0;

/// Message types as defined in the wire protocol
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Filler used to pad packets to a boundary
    Padding = 0x0000,
    /// Connection handshake
    Hello = 0x0001,
    /// Application message, optionally announcing a bulk payload
    Application = 0x0002,
    /// Flow-control credit grant for a bulk transfer
    FlowCredit = 0x0003,
    /// Request rate the sender is willing to accept
    RateAnnouncement = 0x0004,
    /// One chunk of a multiplexed bulk transfer
    BulkChunk = 0x0005,
    /// Ask the peer to discard a transfer id
    KillTransfer = 0x0006,
    /// Orderly close of the sending direction
    Goodbye = 0x0007,
}

impl TryFrom<u16> for MessageType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(MessageType::Padding),
            0x0001 => Ok(MessageType::Hello),
            0x0002 => Ok(MessageType::Application),
            0x0003 => Ok(MessageType::FlowCredit),
            0x0004 => Ok(MessageType::RateAnnouncement),
            0x0005 => Ok(MessageType::BulkChunk),
            0x0006 => Ok(MessageType::KillTransfer),
            0x0007 => Ok(MessageType::Goodbye),
            _ => Err(WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Capability bits advertised in HELLO
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u16 {
        /// Peer speaks the multiplexed packet format
        const MULTIPLEX = 1 << 0;
        /// Peer honours flow-control credit for bulk transfers
        const BULK_CREDIT = 1 << 1;
        /// Peer negotiates request rates
        const RATE_LIMIT = 1 << 2;
    }
}

bitflags! {
    /// Application message flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AppFlags: u8 {
        /// Message is a request (subject to request-rate gating)
        const REQUEST = 1 << 0;
        /// Message announces a bulk payload
        const HAS_BULK = 1 << 1;
    }
}

/// HELLO payload length: node id, version, capabilities, bulk window
const HELLO_LEN: usize = 8 + 1 + 2 + 4;

/// HELLO payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Node ID of the sender
    pub node_id: u64,
    /// Protocol version
    pub version: u8,
    /// Advertised capabilities
    pub capabilities: Capabilities,
    /// Bulk credit window of the sender; 0 when it has none to offer
    pub bulk_window: u32,
}

impl Hello {
    /// Create a HELLO for the current wire version
    pub fn new(node_id: u64, capabilities: Capabilities) -> Self {
        Self {
            node_id,
            version: WIRE_VERSION,
            capabilities,
            bulk_window: 0,
        }
    }

    /// Advertise a bulk credit window
    pub fn with_bulk_window(mut self, window: u32) -> Self {
        self.bulk_window = window;
        self
    }

    /// Whether the sender uses the multiplexed format
    pub fn multiplexed(&self) -> bool {
        self.capabilities.contains(Capabilities::MULTIPLEX)
    }
}

/// Bulk payload announced by an application message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkHeader {
    /// Transfer id the chunks will carry (0 for inline trailers)
    pub transfer_id: u16,
    /// Total bulk length in bytes
    pub length: u32,
}

/// Application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    /// Correlation id chosen by the application
    pub corr_id: u64,
    /// Whether this is a request
    pub request: bool,
    /// Opaque body
    pub body: Bytes,
    /// Bulk payload announcement
    pub bulk: Option<BulkHeader>,
}

impl AppMessage {
    fn flags(&self) -> AppFlags {
        let mut flags = AppFlags::empty();
        if self.request {
            flags |= AppFlags::REQUEST;
        }
        if self.bulk.is_some() {
            flags |= AppFlags::HAS_BULK;
        }
        flags
    }
}

/// One chunk of a multiplexed bulk transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkChunk {
    /// Transfer id
    pub transfer_id: u16,
    /// Byte offset of `data` within the transfer
    pub offset: u32,
    /// Chunk bytes
    pub data: Bytes,
}

/// Chunk payload header: transfer id + offset
pub const CHUNK_HEADER_LEN: usize = 2 + 4;

/// A link message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Filler of `len` zero bytes
    Padding {
        /// Payload length
        len: u16,
    },
    /// Connection handshake
    Hello(Hello),
    /// Application traffic
    Application(AppMessage),
    /// Credit grant
    FlowCredit {
        /// Transfer the credit applies to
        transfer_id: u16,
        /// Additional bytes the sender may push
        credit: u32,
    },
    /// Request rate announcement
    RateAnnouncement {
        /// Requests per second the sender accepts
        requests_per_sec: u32,
    },
    /// Bulk chunk
    BulkChunk(BulkChunk),
    /// Discard a transfer id
    KillTransfer {
        /// Transfer to discard
        transfer_id: u16,
    },
    /// Orderly close
    Goodbye {
        /// Reason code
        reason: u8,
    },
}

impl Message {
    /// The wire type of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Padding { .. } => MessageType::Padding,
            Message::Hello(_) => MessageType::Hello,
            Message::Application(_) => MessageType::Application,
            Message::FlowCredit { .. } => MessageType::FlowCredit,
            Message::RateAnnouncement { .. } => MessageType::RateAnnouncement,
            Message::BulkChunk(_) => MessageType::BulkChunk,
            Message::KillTransfer { .. } => MessageType::KillTransfer,
            Message::Goodbye { .. } => MessageType::Goodbye,
        }
    }

    /// Whether this is an application request
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Application(app) if app.request)
    }

    /// The bulk announcement carried by an application message
    pub fn bulk_header(&self) -> Option<BulkHeader> {
        match self {
            Message::Application(app) => app.bulk,
            _ => None,
        }
    }

    /// Payload length in bytes (excluding type id and framing)
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Padding { len } => *len as usize,
            Message::Hello(_) => HELLO_LEN,
            Message::Application(app) => {
                let bulk = if app.bulk.is_some() { 2 + 4 } else { 0 };
                8 + 1 + bulk + app.body.len()
            }
            Message::FlowCredit { .. } => 2 + 4,
            Message::RateAnnouncement { .. } => 4,
            Message::BulkChunk(chunk) => CHUNK_HEADER_LEN + chunk.data.len(),
            Message::KillTransfer { .. } => 2,
            Message::Goodbye { .. } => 1,
        }
    }

    /// Append the payload to `buf`
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Message::Padding { len } => buf.put_bytes(0, *len as usize),
            Message::Hello(hello) => {
                buf.put_u64(hello.node_id);
                buf.put_u8(hello.version);
                buf.put_u16(hello.capabilities.bits());
                buf.put_u32(hello.bulk_window);
            }
            Message::Application(app) => {
                buf.put_u64(app.corr_id);
                buf.put_u8(app.flags().bits());
                if let Some(bulk) = app.bulk {
                    buf.put_u16(bulk.transfer_id);
                    buf.put_u32(bulk.length);
                }
                buf.put_slice(&app.body);
            }
            Message::FlowCredit {
                transfer_id,
                credit,
            } => {
                buf.put_u16(*transfer_id);
                buf.put_u32(*credit);
            }
            Message::RateAnnouncement { requests_per_sec } => buf.put_u32(*requests_per_sec),
            Message::BulkChunk(chunk) => {
                buf.put_u16(chunk.transfer_id);
                buf.put_u32(chunk.offset);
                buf.put_slice(&chunk.data);
            }
            Message::KillTransfer { transfer_id } => buf.put_u16(*transfer_id),
            Message::Goodbye { reason } => buf.put_u8(*reason),
        }
    }

    /// Decode a payload of the given type
    pub fn decode_payload(typ: MessageType, mut payload: Bytes) -> Result<Message, WireError> {
        let message = match typ {
            MessageType::Padding => {
                let len = u16::try_from(payload.len()).map_err(|_| WireError::Malformed("padding"))?;
                Message::Padding { len }
            }
            MessageType::Hello => {
                // the window is optional on the wire
                if payload.len() != HELLO_LEN && payload.len() != HELLO_LEN - 4 {
                    return Err(WireError::Malformed("hello"));
                }
                let node_id = payload.get_u64();
                let version = payload.get_u8();
                let capabilities = Capabilities::from_bits_truncate(payload.get_u16());
                let bulk_window = if payload.has_remaining() { payload.get_u32() } else { 0 };
                Message::Hello(Hello {
                    node_id,
                    version,
                    capabilities,
                    bulk_window,
                })
            }
            MessageType::Application => {
                expect_at_least(&payload, 9, "application")?;
                let corr_id = payload.get_u64();
                let flags = AppFlags::from_bits(payload.get_u8())
                    .ok_or(WireError::Malformed("application"))?;
                let bulk = if flags.contains(AppFlags::HAS_BULK) {
                    expect_at_least(&payload, 6, "application")?;
                    let transfer_id = payload.get_u16();
                    let length = payload.get_u32();
                    Some(BulkHeader {
                        transfer_id,
                        length,
                    })
                } else {
                    None
                };
                Message::Application(AppMessage {
                    corr_id,
                    request: flags.contains(AppFlags::REQUEST),
                    body: payload,
                    bulk,
                })
            }
            MessageType::FlowCredit => {
                expect_exact(&payload, 6, "flow credit")?;
                Message::FlowCredit {
                    transfer_id: payload.get_u16(),
                    credit: payload.get_u32(),
                }
            }
            MessageType::RateAnnouncement => {
                expect_exact(&payload, 4, "rate announcement")?;
                Message::RateAnnouncement {
                    requests_per_sec: payload.get_u32(),
                }
            }
            MessageType::BulkChunk => {
                expect_at_least(&payload, CHUNK_HEADER_LEN, "bulk chunk")?;
                let transfer_id = payload.get_u16();
                let offset = payload.get_u32();
                Message::BulkChunk(BulkChunk {
                    transfer_id,
                    offset,
                    data: payload,
                })
            }
            MessageType::KillTransfer => {
                expect_exact(&payload, 2, "kill transfer")?;
                Message::KillTransfer {
                    transfer_id: payload.get_u16(),
                }
            }
            MessageType::Goodbye => {
                expect_exact(&payload, 1, "goodbye")?;
                Message::Goodbye {
                    reason: payload.get_u8(),
                }
            }
        };
        Ok(message)
    }
}

fn expect_exact(payload: &Bytes, len: usize, what: &'static str) -> Result<(), WireError> {
    if payload.len() != len {
        return Err(WireError::Malformed(what));
    }
    Ok(())
}

fn expect_at_least(payload: &Bytes, len: usize, what: &'static str) -> Result<(), WireError> {
    if payload.len() < len {
        return Err(WireError::Malformed(what));
    }
    Ok(())
}
