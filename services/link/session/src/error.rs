//! Terminal outcomes reported to senders, and flow-controller rejections.

use std::time::Duration;

use link_wire::WireError;
use thiserror::Error;

/// Result delivered exactly once to the originator of a send
pub type SendResult = Result<(), TransportError>;

/// Why a send, transfer or connection failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The write finished before this message was fully on the wire
    #[error("sent {sent} of {total} bytes")]
    Truncated {
        /// Bytes of the message that left
        sent: usize,
        /// Encoded length of the message
        total: usize,
    },

    /// The connection carrying the message went away
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Corrupt, over-length or otherwise invalid traffic
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),

    /// No connection and the peer looks unreachable
    #[error("peer {0} is probably unreachable")]
    Unreachable(u64),

    /// A blocking send ran past its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The message sat in the queue past its expiry
    #[error("message expired before it could be sent")]
    Expired,

    /// Removed from the queue on request
    #[error("cancelled")]
    Cancelled,

    /// A chunk kept failing and the transfer was given up
    #[error("transfer {transfer_id} aborted after {attempts} failed chunk attempts")]
    TransferAborted {
        /// Wire transfer id
        transfer_id: u16,
        /// Consecutive failures of the last chunk
        attempts: u32,
    },

    /// The peer or the local side discarded the transfer
    #[error("transfer {0} closed")]
    TransferClosed(u16),

    /// An inline bulk stream received nothing for too long
    #[error("bulk stream stalled for {0:?}")]
    Stalled(Duration),

    /// The cryptographic link rejected the bytes
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// Socket level failure
    #[error("i/o error: {0}")]
    Io(String),

    /// The peer session was administratively removed
    #[error("peer session removed")]
    SessionRemoved,

    /// Flow controller refused the operation
    #[error("flow control: {0}")]
    Flow(#[from] FlowError),
}

impl TransportError {
    /// Whether trying again against the same peer is worth it
    pub fn retryable(&self) -> bool {
        match self {
            TransportError::Truncated { .. }
            | TransportError::ConnectionClosed(_)
            | TransportError::Timeout(_)
            | TransportError::Expired
            | TransportError::TransferAborted { .. }
            | TransportError::Stalled(_)
            | TransportError::Io(_) => true,
            TransportError::Protocol(_)
            | TransportError::Unreachable(_)
            | TransportError::Cancelled
            | TransportError::TransferClosed(_)
            | TransportError::Cipher(_)
            | TransportError::SessionRemoved
            | TransportError::Flow(_) => false,
        }
    }
}

/// Flow controller rejections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// A chunk of this transfer is already on its way
    #[error("transfer {0} already has a chunk in flight")]
    AlreadySendingChunk(u16),

    /// No transfer with this id
    #[error("unknown transfer id {0}")]
    UnknownTransferId(u16),

    /// Every byte of the transfer has been sent
    #[error("transfer {0} is already fully sent")]
    TransferFinished(u16),

    /// A reader for this id is already registered
    #[error("a reader for transfer {0} is already registered")]
    DuplicateReader(u16),

    /// Every wire id is in use
    #[error("no free transfer id")]
    IdsExhausted,

    /// Chunk does not continue where the transfer left off
    #[error("transfer {transfer_id}: expected offset {expected}, got {got}")]
    OffsetMismatch {
        /// Transfer id
        transfer_id: u16,
        /// Next expected offset
        expected: u64,
        /// Offset carried by the chunk
        got: u64,
    },

    /// Bulk payload larger than a transfer can describe
    #[error("bulk payload of {0} bytes is too large")]
    TooLarge(usize),
}
