//! In-memory doubles for driving sessions and connections in tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use link_wire::{Message, PacketFramer};
use parking_lot::Mutex;

use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionId, ConnectionParams, ConnectionRegistry};
use crate::error::TransportError;
use crate::io::{IoEngine, IoHandle, PlainLink, ReadCallback, ReadEvent, WriteCallback};
use crate::queue::ExpiryWorker;
use crate::session::{BulkDownload, InboundBulk, InboundHandler, InboundMessage, PeerSession};
use crate::trailer::TrailerReader;

#[derive(Default)]
struct MockState {
    pending: HashMap<IoHandle, VecDeque<(Bytes, WriteCallback)>>,
    written: HashMap<IoHandle, Vec<Bytes>>,
    readers: HashMap<IoHandle, ReadCallback>,
    interest: HashMap<IoHandle, Vec<bool>>,
    closed: HashSet<IoHandle>,
    refuse_writes: bool,
}

/// Engine that records writes and lets the test decide when they progress
#[derive(Default)]
pub struct MockIo {
    state: Mutex<MockState>,
}

impl fmt::Debug for MockIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MockIo")
    }
}

impl MockIo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse_writes(&self, refuse: bool) {
        self.state.lock().refuse_writes = refuse;
    }

    /// Writes registered and not finished yet
    pub fn outstanding(&self, handle: IoHandle) -> usize {
        self.state.lock().pending.get(&handle).map_or(0, |q| q.len())
    }

    /// Length of the oldest unfinished write
    pub fn pending_len(&self, handle: IoHandle) -> Option<usize> {
        self.state
            .lock()
            .pending
            .get(&handle)
            .and_then(|q| q.front())
            .map(|(bytes, _)| bytes.len())
    }

    /// Report progress on the oldest unfinished write
    pub fn progress(&self, handle: IoHandle, acked: usize, finished: bool) {
        let entry = self
            .state
            .lock()
            .pending
            .get_mut(&handle)
            .and_then(|q| q.pop_front());
        let Some((bytes, mut callback)) = entry else {
            panic!("no write outstanding on {handle}");
        };
        callback(acked, finished);
        if !finished {
            self.state
                .lock()
                .pending
                .entry(handle)
                .or_default()
                .push_front((bytes, callback));
        }
    }

    /// Complete writes in full until none is left. Returns how many ran.
    pub fn flush(&self, handle: IoHandle) -> usize {
        let mut count = 0;
        while let Some(len) = self.pending_len(handle) {
            self.progress(handle, len, true);
            count += 1;
        }
        count
    }

    /// Every buffer registered for writing, in order
    pub fn written(&self, handle: IoHandle) -> Vec<Bytes> {
        self.state.lock().written.get(&handle).cloned().unwrap_or_default()
    }

    /// Decode everything written so far as multiplexed frames, without padding
    pub fn written_messages(&self, handle: IoHandle) -> Vec<Message> {
        let mut framer = PacketFramer::new(u16::MAX as usize);
        let mut out = Vec::new();
        for buf in self.written(handle) {
            for message in framer.feed(&buf).unwrap() {
                if !matches!(message, Message::Padding { .. }) {
                    out.push(message);
                }
            }
        }
        out
    }

    /// Hand a read event to the registered reader
    pub fn deliver(&self, handle: IoHandle, event: ReadEvent) {
        let reader = self.state.lock().readers.remove(&handle);
        let Some(mut reader) = reader else {
            panic!("no reader on {handle}");
        };
        reader(event);
        self.state.lock().readers.entry(handle).or_insert(reader);
    }

    pub fn interest(&self, handle: IoHandle) -> Vec<bool> {
        self.state.lock().interest.get(&handle).cloned().unwrap_or_default()
    }

    pub fn is_closed(&self, handle: IoHandle) -> bool {
        self.state.lock().closed.contains(&handle)
    }
}

impl IoEngine for MockIo {
    fn register_for_write(
        &self,
        handle: IoHandle,
        bytes: Bytes,
        on_progress: WriteCallback,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.refuse_writes || state.closed.contains(&handle) {
            return Err(TransportError::Io("refused".into()));
        }
        let queue = state.pending.entry(handle).or_default();
        assert!(queue.is_empty(), "second write registered on {handle}");
        queue.push_back((bytes.clone(), on_progress));
        state.written.entry(handle).or_default().push(bytes);
        Ok(())
    }

    fn register_for_read(&self, handle: IoHandle, on_data: ReadCallback) -> Result<(), TransportError> {
        self.state.lock().readers.insert(handle, on_data);
        Ok(())
    }

    fn set_read_interest(&self, handle: IoHandle, interested: bool) {
        self.state.lock().interest.entry(handle).or_default().push(interested);
    }

    fn close(&self, handle: IoHandle) {
        self.state.lock().closed.insert(handle);
    }
}

/// What the handler saw
#[derive(Debug)]
pub struct Received {
    pub corr_id: u64,
    pub body: Bytes,
    pub download: Option<BulkDownload>,
    pub trailer: Option<TrailerReader>,
}

/// Handler that records messages and optionally accepts offered transfers
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub accept_bulk: bool,
    pub received: Mutex<Vec<Received>>,
}

impl RecordingHandler {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            accept_bulk: true,
            ..Default::default()
        })
    }

    pub fn take(&self) -> Vec<Received> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl InboundHandler for RecordingHandler {
    fn on_message(&self, session: &Arc<PeerSession>, message: InboundMessage) {
        let (download, trailer) = match message.bulk {
            InboundBulk::Offered {
                transfer_id,
                length,
            } if self.accept_bulk => (session.receive_bulk(transfer_id, length).ok(), None),
            InboundBulk::Inline(reader) => (None, Some(reader)),
            _ => (None, None),
        };
        self.received.lock().push(Received {
            corr_id: message.corr_id,
            body: message.body,
            download,
            trailer,
        });
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A session with one attached connection over a [`MockIo`]
pub struct Harness {
    pub io: Arc<MockIo>,
    pub session: Arc<PeerSession>,
    pub conn: Arc<Connection>,
    pub handler: Arc<RecordingHandler>,
    pub registry: Arc<ConnectionRegistry>,
    _worker: ExpiryWorker,
}

impl Harness {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_handler(config, Arc::new(RecordingHandler::default()))
    }

    pub fn with_handler(config: LinkConfig, handler: Arc<RecordingHandler>) -> Self {
        let worker = ExpiryWorker::spawn().unwrap();
        let io = MockIo::new();
        let session = PeerSession::new(7, Arc::new(config), worker.handle(), handler.clone());
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = Self::connect(&io, &session, &registry);
        session.attach(conn.clone()).unwrap();
        Self {
            io,
            session,
            conn,
            handler,
            registry,
            _worker: worker,
        }
    }

    /// A fresh connection for `session`, registered but not attached
    pub fn connect(
        io: &Arc<MockIo>,
        session: &Arc<PeerSession>,
        registry: &Arc<ConnectionRegistry>,
    ) -> Arc<Connection> {
        let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(
            ConnectionParams {
                id: ConnectionId(n),
                handle: IoHandle(n),
                remote: format!("10.0.0.{n}:7000"),
                io: io.clone(),
                tx_cipher: Box::new(PlainLink),
                rx_cipher: Box::new(PlainLink),
            },
            session,
            Some(registry.clone()),
        );
        registry.insert(conn.id(), conn.clone());
        conn
    }

    pub fn handle(&self) -> IoHandle {
        self.conn.handle()
    }

    /// Feed bytes as if read from the socket
    pub fn feed(&self, bytes: impl Into<Bytes>) {
        self.io.deliver(self.handle(), ReadEvent::Data(bytes.into()));
    }

    pub fn flush(&self) -> usize {
        self.io.flush(self.handle())
    }
}
