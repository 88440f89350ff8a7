//! Collaborators a connection drives: the I/O engine and the cipher.

use std::fmt;

use bytes::Bytes;

use crate::error::TransportError;

/// Socket handle issued by an [`IoEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoHandle(pub u64);

impl fmt::Display for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "io-{}", self.0)
    }
}

/// Write progress callback: cumulative bytes written, and whether the write
/// is over. A finished write that did not cover every byte failed.
pub type WriteCallback = Box<dyn FnMut(usize, bool) + Send>;

/// What a read registration delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// Raw (still encrypted) bytes
    Data(Bytes),
    /// The read side ended, with an error description unless it was EOF
    Closed(Option<String>),
}

/// Read callback, invoked sequentially per handle
pub type ReadCallback = Box<dyn FnMut(ReadEvent) + Send>;

/// Asynchronous socket engine
pub trait IoEngine: Send + Sync + fmt::Debug {
    /// Write `bytes`, reporting progress at least once. At most one write
    /// per handle may be outstanding.
    fn register_for_write(
        &self,
        handle: IoHandle,
        bytes: Bytes,
        on_progress: WriteCallback,
    ) -> Result<(), TransportError>;

    /// Deliver everything read from `handle` to `on_data`
    fn register_for_read(&self, handle: IoHandle, on_data: ReadCallback)
        -> Result<(), TransportError>;

    /// Pause or resume reading
    fn set_read_interest(&self, handle: IoHandle, interested: bool);

    /// Close the socket
    fn close(&self, handle: IoHandle);
}

/// Stateful, order-dependent, length-preserving stream cipher.
///
/// `encrypt` is called in send order and `decrypt` in receive order; any
/// error is fatal to the connection.
pub trait LinkCipher: Send + fmt::Debug {
    /// Encrypt in place
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), TransportError>;

    /// Decrypt in place
    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), TransportError>;
}

/// Cipher that leaves bytes untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainLink;

impl LinkCipher for PlainLink {
    fn encrypt(&mut self, _data: &mut [u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn decrypt(&mut self, _data: &mut [u8]) -> Result<(), TransportError> {
        Ok(())
    }
}
