//! Inline bulk sub-stream for legacy links.
//!
//! When a legacy message declares a trailing bulk field, the connection keeps
//! feeding the following bytes into a [`TrailerWriter`] until the declared
//! length has passed, and the consumer reads them from the matching
//! [`TrailerReader`] on its own thread. Reads block until data arrives; a read
//! that sees nothing for the stall timeout closes the connection. Socket
//! reads pause while too much is buffered and resume once the reader catches
//! up.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::buffer::ByteQueue;
use crate::error::TransportError;

/// Callbacks into the connection that carries the stream
pub struct TrailerHooks {
    /// Pause (`false`) or resume (`true`) socket reads
    pub set_read_interest: Box<dyn Fn(bool) + Send + Sync>,
    /// Tear the connection down
    pub abort: Box<dyn Fn(TransportError) + Send + Sync>,
}

impl std::fmt::Debug for TrailerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrailerHooks")
    }
}

/// Stall timeout and buffering thresholds
#[derive(Debug, Clone, Copy)]
pub struct TrailerLimits {
    /// Longest a read waits for new bytes
    pub stall_timeout: Duration,
    /// Buffered bytes at which socket reads pause
    pub pause_at: usize,
    /// Buffered bytes at or below which socket reads resume
    pub resume_at: usize,
}

#[derive(Debug)]
struct State {
    buf: ByteQueue,
    to_receive: u64,
    to_read: u64,
    paused: bool,
    error: Option<TransportError>,
}

#[derive(Debug)]
struct Shared {
    length: u64,
    limits: TrailerLimits,
    state: Mutex<State>,
    cond: Condvar,
    hooks: TrailerHooks,
}

impl Shared {
    fn abandon(&self, error: TransportError) {
        {
            let mut state = self.state.lock();
            if state.to_read == 0 || state.error.is_some() {
                return;
            }
            state.error = Some(error.clone());
            self.cond.notify_all();
        }
        debug!(%error, "inline bulk stream abandoned");
        (self.hooks.abort)(error);
    }
}

/// Create the two ends of a stream of `length` bytes
pub fn trailer_stream(
    length: u64,
    limits: TrailerLimits,
    hooks: TrailerHooks,
) -> (TrailerWriter, TrailerReader) {
    let shared = Arc::new(Shared {
        length,
        limits,
        state: Mutex::new(State {
            buf: ByteQueue::new(),
            to_receive: length,
            to_read: length,
            paused: false,
            error: None,
        }),
        cond: Condvar::new(),
        hooks,
    });
    (
        TrailerWriter {
            shared: shared.clone(),
        },
        TrailerReader { shared },
    )
}

/// Connection side of the stream
#[derive(Debug)]
pub struct TrailerWriter {
    shared: Arc<Shared>,
}

impl TrailerWriter {
    /// Feed bytes from the accumulator. Returns how many belong to the stream.
    pub fn push(&self, data: &[u8]) -> usize {
        let shared = &self.shared;
        let (take, pause, buffered) = {
            let mut state = shared.state.lock();
            let take = state.to_receive.min(data.len() as u64) as usize;
            state.to_receive -= take as u64;
            if state.error.is_none() {
                state.buf.append(&data[..take]);
            }
            let pause = !state.paused
                && state.to_receive > 0
                && state.buf.len() >= shared.limits.pause_at;
            if pause {
                state.paused = true;
            }
            shared.cond.notify_all();
            (take, pause, state.buf.len())
        };
        if pause {
            debug!(buffered, "pausing reads for slow bulk reader");
            (shared.hooks.set_read_interest)(false);
        }
        take
    }

    /// Bytes buffered and not yet read
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buf.len()
    }

    /// Whether every declared byte has been fed
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().to_receive == 0
    }

    /// The connection died: wake the reader with `error`
    pub fn fail(&self, error: TransportError) {
        let mut state = self.shared.state.lock();
        if state.to_read > 0 && state.error.is_none() {
            state.error = Some(error);
        }
        self.shared.cond.notify_all();
    }
}

/// Consumer side of the stream.
///
/// Read it on a thread other than the connection's read path; that path
/// is what fills it.
#[derive(Debug)]
pub struct TrailerReader {
    shared: Arc<Shared>,
}

impl TrailerReader {
    /// Declared length
    pub fn len(&self) -> u64 {
        self.shared.length
    }

    /// Whether the declared length is zero
    pub fn is_empty(&self) -> bool {
        self.shared.length == 0
    }

    /// Bytes not read yet
    pub fn remaining(&self) -> u64 {
        self.shared.state.lock().to_read
    }

    /// Read into `out`, blocking until something is available.
    ///
    /// Returns `Ok(0)` at the end of the stream. Waiting longer than the
    /// stall timeout for new bytes closes the connection.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, TransportError> {
        if out.is_empty() {
            return Ok(0);
        }
        let shared = &self.shared;
        let stall = shared.limits.stall_timeout;
        let mut state = shared.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                out[..n].copy_from_slice(&state.buf.readable()[..n]);
                state.buf.consume(n);
                state.to_read -= n as u64;
                let resume = state.paused && state.buf.len() <= shared.limits.resume_at;
                if resume {
                    state.paused = false;
                }
                drop(state);
                if resume {
                    debug!("resuming reads");
                    (shared.hooks.set_read_interest)(true);
                }
                return Ok(n);
            }
            if state.to_read == 0 {
                return Ok(0);
            }
            if let Some(error) = state.error.as_ref() {
                return Err(error.clone());
            }
            if shared.cond.wait_for(&mut state, stall).timed_out()
                && state.buf.is_empty()
                && state.error.is_none()
            {
                drop(state);
                warn!(?stall, "inline bulk stream stalled, closing connection");
                let error = TransportError::Stalled(stall);
                shared.abandon(error.clone());
                return Err(error);
            }
        }
    }

    /// Read everything that is left
    pub fn read_to_end(&mut self) -> Result<Bytes, TransportError> {
        let mut out = BytesMut::with_capacity(self.remaining().min(1 << 20) as usize);
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Stop reading early. The connection cannot find the next message
    /// boundary without the rest of the stream, so it is closed.
    pub fn discontinue(self) {
        self.shared.abandon(TransportError::Cancelled);
    }
}

impl Drop for TrailerReader {
    fn drop(&mut self) {
        self.shared.abandon(TransportError::Cancelled);
    }
}
