//! Credit-based flow control for multiplexed bulk transfers.
//!
//! The [`FlowWriter`] owns every outgoing transfer of a session: it hands out
//! transfer ids, slices the payload into chunks no larger than the credit the
//! peer granted, keeps at most one chunk per transfer in flight and gives up
//! on a transfer whose chunk keeps failing. The [`FlowReader`] matches
//! incoming chunks to readers registered by the consumer and decides when to
//! grant credit back.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use link_wire::BulkChunk;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::completion::Completion;
use crate::error::{FlowError, TransportError};
use crate::pending::{MessageId, PendingRef};

/// Transfer ids wrap at this boundary
const TRANSFER_ID_SPACE: u32 = 1 << 31;

#[derive(Debug)]
struct InFlight {
    offset: u32,
    data: Bytes,
}

#[derive(Debug)]
struct OutgoingTransfer {
    data: Bytes,
    owner: PendingRef,
    active: bool,
    sent: usize,
    credit: u64,
    in_flight: Option<InFlight>,
    failures: u32,
}

/// What happened after a chunk write finished
#[derive(Debug)]
pub enum ChunkOutcome {
    /// More chunks to go
    Continue,
    /// Every byte was sent; notify the owner
    Completed(PendingRef),
    /// The chunk failed and must be queued again
    Retry(BulkChunk),
    /// The chunk failed too often; the transfer is gone
    Aborted {
        /// Message that announced the transfer
        owner: PendingRef,
        /// Consecutive failures
        attempts: u32,
    },
    /// The transfer no longer exists
    Unknown,
}

/// Outgoing side of the flow controller
#[derive(Debug)]
pub struct FlowWriter {
    next_id: u32,
    transfers: HashMap<u16, OutgoingTransfer>,
    initial_credit: u32,
    chunk_size: usize,
    max_attempts: u32,
}

impl FlowWriter {
    /// Create a writer
    pub fn new(initial_credit: u32, chunk_size: usize, max_attempts: u32) -> Self {
        Self {
            next_id: 1,
            transfers: HashMap::new(),
            initial_credit,
            chunk_size: chunk_size.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Start a transfer of `data`.
    ///
    /// `announce` builds the message that tells the peer about the transfer
    /// id; it becomes the transfer's owner and is notified when the transfer
    /// ends. The transfer sends nothing until [`FlowWriter::activate`].
    pub fn start<F>(&mut self, data: Bytes, announce: F) -> Result<PendingRef, FlowError>
    where
        F: FnOnce(u16) -> PendingRef,
    {
        if data.len() > u32::MAX as usize {
            return Err(FlowError::TooLarge(data.len()));
        }
        let transfer_id = self.allocate()?;
        let owner = announce(transfer_id);
        debug!(transfer_id, len = data.len(), owner = %owner.id(), "transfer allocated");
        self.transfers.insert(
            transfer_id,
            OutgoingTransfer {
                data,
                owner: owner.clone(),
                active: false,
                sent: 0,
                credit: 0,
                in_flight: None,
                failures: 0,
            },
        );
        Ok(owner)
    }

    fn allocate(&mut self) -> Result<u16, FlowError> {
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next_id;
            self.next_id = (self.next_id + 1) % TRANSFER_ID_SPACE;
            let wire = candidate as u16;
            if wire != 0 && !self.transfers.contains_key(&wire) {
                return Ok(wire);
            }
        }
        Err(FlowError::IdsExhausted)
    }

    /// The announcing message is on the wire: chunks may flow, starting
    /// with the initial credit in force now
    pub fn activate(&mut self, transfer_id: u16) -> bool {
        match self.transfers.get_mut(&transfer_id) {
            Some(transfer) => {
                if !transfer.active {
                    transfer.active = true;
                    transfer.credit += self.initial_credit as u64;
                }
                true
            }
            None => false,
        }
    }

    /// Credit given to transfers activated from now on
    pub fn set_initial_credit(&mut self, credit: u32) {
        self.initial_credit = credit.max(1);
    }

    /// Credit given to newly activated transfers
    pub fn initial_credit(&self) -> u32 {
        self.initial_credit
    }

    /// Drop a transfer that never started because its announcement failed
    pub fn discard(&mut self, transfer_id: u16, owner: MessageId) -> bool {
        let matches = self
            .transfers
            .get(&transfer_id)
            .is_some_and(|t| !t.active && t.owner.id() == owner);
        if matches {
            self.transfers.remove(&transfer_id);
        }
        matches
    }

    /// Transfers able to send a chunk right now
    pub fn ready(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .transfers
            .iter()
            .filter(|(_, t)| {
                t.active && t.in_flight.is_none() && t.credit > 0 && t.sent < t.data.len()
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Offset and bytes of the next chunk `transfer_id` may send, if any
    pub fn next_chunk(&self, transfer_id: u16) -> Option<(u32, Bytes)> {
        let transfer = self.transfers.get(&transfer_id)?;
        if !transfer.active || transfer.in_flight.is_some() {
            return None;
        }
        let remaining = transfer.data.len() - transfer.sent;
        let len = self
            .chunk_size
            .min(remaining)
            .min(transfer.credit.min(usize::MAX as u64) as usize);
        if len == 0 {
            return None;
        }
        let start = transfer.sent;
        Some((start as u32, transfer.data.slice(start..start + len)))
    }

    /// Put a chunk in flight
    pub fn write_chunk(
        &mut self,
        transfer_id: u16,
        offset: u32,
        data: Bytes,
    ) -> Result<BulkChunk, FlowError> {
        let transfer = self
            .transfers
            .get_mut(&transfer_id)
            .ok_or(FlowError::UnknownTransferId(transfer_id))?;
        if transfer.in_flight.is_some() {
            return Err(FlowError::AlreadySendingChunk(transfer_id));
        }
        if transfer.sent >= transfer.data.len() {
            return Err(FlowError::TransferFinished(transfer_id));
        }
        if offset as usize != transfer.sent {
            return Err(FlowError::OffsetMismatch {
                transfer_id,
                expected: transfer.sent as u64,
                got: offset as u64,
            });
        }

        transfer.credit = transfer.credit.saturating_sub(data.len() as u64);
        transfer.in_flight = Some(InFlight {
            offset,
            data: data.clone(),
        });
        trace!(transfer_id, offset, len = data.len(), "chunk in flight");
        Ok(BulkChunk {
            transfer_id,
            offset,
            data,
        })
    }

    /// Record the outcome of the in-flight chunk of `transfer_id`
    pub fn chunk_done(&mut self, transfer_id: u16, success: bool) -> ChunkOutcome {
        let Some(transfer) = self.transfers.get_mut(&transfer_id) else {
            return ChunkOutcome::Unknown;
        };
        let Some((offset, data)) = transfer
            .in_flight
            .as_ref()
            .map(|f| (f.offset, f.data.clone()))
        else {
            warn!(transfer_id, "chunk completion without a chunk in flight");
            return ChunkOutcome::Continue;
        };

        if success {
            transfer.sent += data.len();
            transfer.in_flight = None;
            transfer.failures = 0;
            if transfer.sent >= transfer.data.len() {
                if let Some(done) = self.transfers.remove(&transfer_id) {
                    debug!(transfer_id, len = done.data.len(), "transfer complete");
                    return ChunkOutcome::Completed(done.owner);
                }
            }
            return ChunkOutcome::Continue;
        }

        transfer.failures += 1;
        if transfer.failures >= self.max_attempts {
            let attempts = transfer.failures;
            warn!(transfer_id, attempts, "giving up on transfer");
            return match self.transfers.remove(&transfer_id) {
                Some(gone) => ChunkOutcome::Aborted {
                    owner: gone.owner,
                    attempts,
                },
                None => ChunkOutcome::Unknown,
            };
        }
        debug!(transfer_id, offset, failures = transfer.failures, "retrying chunk");
        ChunkOutcome::Retry(BulkChunk {
            transfer_id,
            offset,
            data,
        })
    }

    /// Add credit granted by the peer
    pub fn grant(&mut self, transfer_id: u16, credit: u32) -> bool {
        match self.transfers.get_mut(&transfer_id) {
            Some(transfer) => {
                transfer.credit += credit as u64;
                true
            }
            None => false,
        }
    }

    /// Drop a transfer the peer discarded, returning its owner
    pub fn kill(&mut self, transfer_id: u16) -> Option<PendingRef> {
        self.transfers.remove(&transfer_id).map(|t| t.owner)
    }

    /// Drop every transfer, returning the owners of those already announced
    pub fn abort_all(&mut self) -> Vec<PendingRef> {
        self.transfers
            .drain()
            .filter(|(_, t)| t.active)
            .map(|(_, t)| t.owner)
            .collect()
    }

    /// Whether any transfer is live
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Number of live transfers
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    #[cfg(test)]
    fn set_next_id(&mut self, next: u32) {
        self.next_id = next;
    }
}

/// Destination of an incoming transfer
#[derive(Debug)]
pub struct BulkSink {
    expected: u64,
    buf: Mutex<BytesMut>,
    done: Completion<Result<Bytes, TransportError>>,
}

impl BulkSink {
    /// Create a sink for `expected` bytes
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            buf: Mutex::new(BytesMut::new()),
            done: Completion::new(),
        }
    }

    /// Declared length
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Bytes received so far
    pub fn received(&self) -> usize {
        self.buf.lock().len()
    }

    fn push(&self, data: &[u8]) {
        self.buf.lock().extend_from_slice(data);
    }

    fn finish(&self) {
        let data = std::mem::take(&mut *self.buf.lock()).freeze();
        self.done.complete(Ok(data));
    }

    /// End the transfer with an error
    pub fn fail(&self, error: TransportError) {
        self.done.complete(Err(error));
    }

    /// Whether the transfer has ended
    pub fn is_done(&self) -> bool {
        self.done.is_complete()
    }

    /// Block until the transfer ends or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        self.done
            .wait_timeout(timeout)
            .unwrap_or(Err(TransportError::Timeout(timeout)))
    }
}

#[derive(Debug)]
struct IncomingTransfer {
    received: u64,
    ungranted: u64,
    sink: std::sync::Arc<BulkSink>,
}

/// What to do about a received chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Stored; grant this much credit back if set
    Accepted {
        /// Credit to grant
        grant: Option<u32>,
    },
    /// Stored and the transfer is complete
    Completed,
    /// No reader for the id; `first_report` is set the first time
    Unknown {
        /// First sighting since the id was last registered
        first_report: bool,
    },
    /// The chunk does not fit the transfer; the reader was dropped
    Rejected(FlowError),
}

/// Incoming side of the flow controller
#[derive(Debug)]
pub struct FlowReader {
    window: u32,
    readers: HashMap<u16, IncomingTransfer>,
    unknown_reported: HashSet<u16>,
}

impl FlowReader {
    /// Create a reader granting credit in halves of `window`
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(2),
            readers: HashMap::new(),
            unknown_reported: HashSet::new(),
        }
    }

    /// Change the window grants are measured against
    pub fn set_window(&mut self, window: u32) {
        self.window = window.max(2);
    }

    /// Window grants are measured against
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Register the consumer of `transfer_id`
    pub fn register(
        &mut self,
        transfer_id: u16,
        sink: std::sync::Arc<BulkSink>,
    ) -> Result<(), FlowError> {
        if self.readers.contains_key(&transfer_id) {
            return Err(FlowError::DuplicateReader(transfer_id));
        }
        self.unknown_reported.remove(&transfer_id);
        if sink.expected() == 0 {
            sink.finish();
            return Ok(());
        }
        self.readers.insert(
            transfer_id,
            IncomingTransfer {
                received: 0,
                ungranted: 0,
                sink,
            },
        );
        Ok(())
    }

    /// Route a chunk to its reader
    pub fn received(&mut self, chunk: &BulkChunk) -> ReceiveOutcome {
        let transfer_id = chunk.transfer_id;
        let Some(reader) = self.readers.get_mut(&transfer_id) else {
            let first_report = self.unknown_reported.insert(transfer_id);
            return ReceiveOutcome::Unknown { first_report };
        };

        let len = chunk.data.len() as u64;
        let error = if chunk.offset as u64 != reader.received {
            Some(FlowError::OffsetMismatch {
                transfer_id,
                expected: reader.received,
                got: chunk.offset as u64,
            })
        } else if reader.received + len > reader.sink.expected() {
            Some(FlowError::TooLarge((reader.received + len) as usize))
        } else {
            None
        };
        if let Some(error) = error {
            if let Some(reader) = self.readers.remove(&transfer_id) {
                reader.sink.fail(error.clone().into());
            }
            return ReceiveOutcome::Rejected(error);
        }

        reader.sink.push(&chunk.data);
        reader.received += len;
        reader.ungranted += len;

        if reader.received == reader.sink.expected() {
            if let Some(reader) = self.readers.remove(&transfer_id) {
                reader.sink.finish();
            }
            return ReceiveOutcome::Completed;
        }
        let grant = if reader.ungranted >= (self.window / 2) as u64 {
            let grant = reader.ungranted.min(u32::MAX as u64) as u32;
            reader.ungranted -= grant as u64;
            Some(grant)
        } else {
            None
        };
        ReceiveOutcome::Accepted { grant }
    }

    /// Drop a reader on request of the consumer
    pub fn cancel(&mut self, transfer_id: u16) -> bool {
        match self.readers.remove(&transfer_id) {
            Some(reader) => {
                reader.sink.fail(TransportError::TransferClosed(transfer_id));
                true
            }
            None => false,
        }
    }

    /// Fail every reader
    pub fn abort_all(&mut self, error: TransportError) {
        for (_, reader) in self.readers.drain() {
            reader.sink.fail(error.clone());
        }
    }

    /// Whether any reader is registered
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Number of registered readers
    pub fn len(&self) -> usize {
        self.readers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::OnComplete;
    use crate::pending::{PendingMessage, Priority};
    use link_wire::Message;
    use std::sync::Arc;
    use std::time::Instant;

    fn owner(transfer_id: u16) -> PendingRef {
        Arc::new(PendingMessage::new(
            MessageId::next(),
            Message::KillTransfer { transfer_id },
            Priority::Request,
            Instant::now() + Duration::from_secs(60),
            OnComplete::None,
        ))
    }

    fn started(writer: &mut FlowWriter, len: usize) -> u16 {
        let data = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>());
        let owner = writer.start(data, owner).unwrap();
        let Message::KillTransfer { transfer_id } = owner.message() else {
            unreachable!()
        };
        assert!(writer.activate(*transfer_id));
        *transfer_id
    }

    fn send_next(writer: &mut FlowWriter, id: u16) -> BulkChunk {
        let (offset, data) = writer.next_chunk(id).unwrap();
        writer.write_chunk(id, offset, data).unwrap()
    }

    #[test]
    fn test_chunk_retry_resets_on_success() {
        let mut writer = FlowWriter::new(1 << 20, 1000, 5);
        let id = started(&mut writer, 10_000);
        let mut delivered = BytesMut::new();
        let mut completed = false;

        for index in 0..10 {
            let chunk = send_next(&mut writer, id);
            assert_eq!(chunk.offset as usize, index * 1000);
            assert_eq!(
                writer.write_chunk(id, chunk.offset, chunk.data.clone()),
                Err(FlowError::AlreadySendingChunk(id))
            );
            // third and sixth chunks fail four times before going through
            if index == 2 || index == 5 {
                for _ in 0..4 {
                    match writer.chunk_done(id, false) {
                        ChunkOutcome::Retry(retry) => assert_eq!(retry, chunk),
                        other => panic!("unexpected {other:?}"),
                    }
                }
            }
            delivered.extend_from_slice(&chunk.data);
            match writer.chunk_done(id, true) {
                ChunkOutcome::Continue => assert!(index < 9),
                ChunkOutcome::Completed(_) => {
                    assert_eq!(index, 9);
                    completed = true;
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        assert!(completed);
        assert_eq!(delivered.len(), 10_000);
        assert!(writer.is_empty());
        assert_eq!(
            writer.write_chunk(id, 0, Bytes::new()),
            Err(FlowError::UnknownTransferId(id))
        );
    }

    #[test]
    fn test_abort_after_max_attempts() {
        let mut writer = FlowWriter::new(1 << 20, 1000, 5);
        let id = started(&mut writer, 3000);
        send_next(&mut writer, id);

        for _ in 0..4 {
            assert!(matches!(writer.chunk_done(id, false), ChunkOutcome::Retry(_)));
        }
        match writer.chunk_done(id, false) {
            ChunkOutcome::Aborted { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected {other:?}"),
        }
        assert!(writer.next_chunk(id).is_none());
        assert!(writer.ready().is_empty());
    }

    #[test]
    fn test_credit_limits_chunks() {
        let mut writer = FlowWriter::new(2500, 1000, 5);
        let id = started(&mut writer, 10_000);

        let mut sizes = Vec::new();
        while let Some((offset, data)) = writer.next_chunk(id) {
            sizes.push(data.len());
            writer.write_chunk(id, offset, data).unwrap();
            writer.chunk_done(id, true);
        }
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert!(writer.ready().is_empty());

        assert!(writer.grant(id, 1200));
        assert_eq!(writer.ready(), vec![id]);
        assert_eq!(writer.next_chunk(id).map(|(o, d)| (o, d.len())), Some((2500, 1000)));
    }

    #[test]
    fn test_credit_fixed_at_activation() {
        let mut writer = FlowWriter::new(8000, 1000, 5);
        let pending = writer.start(Bytes::from(vec![0u8; 5000]), owner).unwrap();
        let Message::KillTransfer { transfer_id } = *pending.message() else {
            unreachable!()
        };
        writer.set_initial_credit(1500);
        assert!(writer.activate(transfer_id));
        assert!(writer.activate(transfer_id));

        let mut sent = 0;
        while let Some((offset, data)) = writer.next_chunk(transfer_id) {
            sent += data.len();
            writer.write_chunk(transfer_id, offset, data).unwrap();
            writer.chunk_done(transfer_id, true);
        }
        assert_eq!(sent, 1500);
    }

    #[test]
    fn test_finished_and_inactive_transfers() {
        let mut writer = FlowWriter::new(1 << 20, 1000, 5);
        let pending = writer.start(Bytes::from_static(b"abc"), owner).unwrap();
        let Message::KillTransfer { transfer_id } = *pending.message() else {
            unreachable!()
        };
        // not announced yet
        assert!(writer.next_chunk(transfer_id).is_none());
        assert!(writer.discard(transfer_id, pending.id()));
        assert!(!writer.discard(transfer_id, pending.id()));

        let id = started(&mut writer, 3);
        let chunk = send_next(&mut writer, id);
        assert_eq!(chunk.data.len(), 3);
        assert!(matches!(writer.chunk_done(id, true), ChunkOutcome::Completed(_)));
    }

    #[test]
    fn test_ids_wrap_and_skip_live_ones() {
        let mut writer = FlowWriter::new(1 << 20, 1000, 5);
        let live = started(&mut writer, 10);
        assert_eq!(live, 1);

        writer.set_next_id(TRANSFER_ID_SPACE - 1);
        let before_wrap = started(&mut writer, 10);
        assert_eq!(before_wrap, 0xFFFF);
        // counter wrapped to 0 (reserved) then 1 (live)
        let after_wrap = started(&mut writer, 10);
        assert_eq!(after_wrap, 2);
    }

    #[test]
    fn test_reader_grants_and_completes() {
        let mut reader = FlowReader::new(1000);
        let sink = Arc::new(BulkSink::new(1200));
        reader.register(4, sink.clone()).unwrap();
        assert_eq!(
            reader.register(4, Arc::new(BulkSink::new(1))),
            Err(FlowError::DuplicateReader(4))
        );

        let chunk = |offset: u32, len: usize| BulkChunk {
            transfer_id: 4,
            offset,
            data: Bytes::from(vec![7u8; len]),
        };
        assert_eq!(
            reader.received(&chunk(0, 300)),
            ReceiveOutcome::Accepted { grant: None }
        );
        assert_eq!(
            reader.received(&chunk(300, 300)),
            ReceiveOutcome::Accepted { grant: Some(600) }
        );
        assert_eq!(reader.received(&chunk(600, 600)), ReceiveOutcome::Completed);
        assert_eq!(sink.wait(Duration::from_secs(1)).unwrap().len(), 1200);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_unknown_ids_report_once() {
        let mut reader = FlowReader::new(1000);
        let chunk = BulkChunk {
            transfer_id: 9,
            offset: 0,
            data: Bytes::from_static(b"x"),
        };
        assert_eq!(
            reader.received(&chunk),
            ReceiveOutcome::Unknown { first_report: true }
        );
        assert_eq!(
            reader.received(&chunk),
            ReceiveOutcome::Unknown {
                first_report: false
            }
        );
    }

    #[test]
    fn test_out_of_order_chunk_rejects_reader() {
        let mut reader = FlowReader::new(1000);
        let sink = Arc::new(BulkSink::new(100));
        reader.register(2, sink.clone()).unwrap();
        let outcome = reader.received(&BulkChunk {
            transfer_id: 2,
            offset: 50,
            data: Bytes::from_static(b"late"),
        });
        assert!(matches!(
            outcome,
            ReceiveOutcome::Rejected(FlowError::OffsetMismatch { expected: 0, got: 50, .. })
        ));
        assert!(sink.wait(Duration::from_millis(10)).is_err());
        assert!(!reader.cancel(2));
    }
}
