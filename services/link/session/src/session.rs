//! Per-peer session: the send pipeline and inbound dispatch for one remote
//! identity.
//!
//! A [`PeerSession`] owns the peer's message queue, its connections and both
//! halves of the bulk flow controller. Sends try an idle connection first and
//! fall back to the queue; a connection that goes idle asks the session for
//! its next packet. Every enqueue bumps a work generation counter, and a
//! connection that found nothing to do re-checks the counter before going
//! idle, so work added concurrently is never stranded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use link_wire::{
    AppMessage, BulkChunk, BulkHeader, Capabilities, LegacyPresentation, Message,
    MuxPresentation, WirePresentation,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::completion::{Completion, OnComplete};
use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{FlowError, SendResult, TransportError};
use crate::flow::{BulkSink, ChunkOutcome, FlowReader, FlowWriter, ReceiveOutcome};
use crate::packet::{Delivery, Packet};
use crate::pending::{MessageId, PendingMessage, PendingRef, Priority};
use crate::queue::{ExpiryHandle, MessageQueue};
use crate::trailer::TrailerReader;

/// Identity of a remote node
pub type PeerId = u64;

/// How to reach a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Socket address
    pub address: String,
    /// Advertisement version; a higher one supersedes a lower one
    pub version: u64,
    /// Advertised capabilities
    pub capabilities: Capabilities,
}

/// Application message handed to [`PeerSession::send_async`]
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Correlation id
    pub corr_id: u64,
    /// Requests are subject to the peer's announced request rate
    pub request: bool,
    /// Body
    pub body: Bytes,
    /// Bulk payload sent after the message
    pub bulk: Option<Bytes>,
    /// Queue lifetime; the configured TTL when unset
    pub ttl: Option<Duration>,
}

impl OutboundMessage {
    /// A request
    pub fn request(corr_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            corr_id,
            request: true,
            body: body.into(),
            bulk: None,
            ttl: None,
        }
    }

    /// A reply or notification, never rate limited
    pub fn reply(corr_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            request: false,
            ..Self::request(corr_id, body)
        }
    }

    /// Attach a bulk payload
    pub fn with_bulk(mut self, bulk: impl Into<Bytes>) -> Self {
        self.bulk = Some(bulk.into());
        self
    }

    /// Override the queue lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Bulk data accompanying an inbound message
#[derive(Debug)]
pub enum InboundBulk {
    /// None
    None,
    /// A multiplexed transfer. Call [`PeerSession::receive_bulk`] from the
    /// handler to accept it; chunks for an id nobody registered are refused.
    Offered {
        /// Transfer id
        transfer_id: u16,
        /// Announced length
        length: u32,
    },
    /// Inline stream on a legacy connection. The connection cannot read past
    /// it, so read it to the end or discontinue it promptly.
    ///
    /// Never read it from inside [`InboundHandler::on_message`]: the handler
    /// runs on the read path that feeds the stream, so a blocking read there
    /// waits for bytes that cannot arrive until the stall timeout kills the
    /// connection. Move the reader to another thread and return.
    Inline(TrailerReader),
}

/// Application message received from a peer
#[derive(Debug)]
pub struct InboundMessage {
    /// Sender
    pub peer: PeerId,
    /// Connection it arrived on
    pub connection: ConnectionId,
    /// Correlation id
    pub corr_id: u64,
    /// Whether the sender marked it as a request
    pub request: bool,
    /// Body
    pub body: Bytes,
    /// Accompanying bulk data
    pub bulk: InboundBulk,
}

/// Receiver of inbound application traffic
pub trait InboundHandler: Send + Sync + std::fmt::Debug {
    /// Called on the connection's read path, once per message, in order.
    ///
    /// No further bytes are read from the connection until this returns.
    /// Blocking here, and above all reading an [`InboundBulk::Inline`]
    /// stream here, stalls the connection.
    fn on_message(&self, session: &Arc<PeerSession>, message: InboundMessage);
}

/// Point-in-time counters of a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Remote node
    pub peer: PeerId,
    /// Open connections
    pub connections: usize,
    /// Messages waiting in the queue
    pub queued: usize,
    /// Outgoing transfers in progress
    pub transfers_active: usize,
    /// Incoming transfers with a registered reader
    pub transfers_incoming: usize,
    /// Application messages delivered to the wire
    pub messages_sent: u64,
    /// Application messages that failed
    pub messages_failed: u64,
    /// Application messages received
    pub messages_received: u64,
    /// Bytes read from all connections
    pub bytes_in: u64,
    /// Bytes written to all connections
    pub bytes_out: u64,
    /// Outgoing transfers fully sent
    pub transfers_completed: u64,
    /// Outgoing transfers given up on
    pub transfers_aborted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    messages_received: AtomicU64,
    retired_bytes_in: AtomicU64,
    retired_bytes_out: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_aborted: AtomicU64,
}

/// Token bucket over the peer's announced request rate. Closed until the
/// first announcement arrives.
#[derive(Debug)]
struct RequestGate {
    rate: Option<u32>,
    tokens: f64,
    refilled: Instant,
}

impl RequestGate {
    fn new(now: Instant) -> Self {
        Self {
            rate: None,
            tokens: 0.0,
            refilled: now,
        }
    }

    fn set_rate(&mut self, rate: u32, now: Instant) {
        self.rate = Some(rate);
        self.tokens = rate as f64;
        self.refilled = now;
    }

    fn refill(&mut self, now: Instant) {
        if let Some(rate) = self.rate {
            let elapsed = now.saturating_duration_since(self.refilled).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
            self.refilled = now;
        }
    }

    fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }

    fn consume(&mut self, n: u32) {
        self.tokens = (self.tokens - n as f64).max(0.0);
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        if self.available(now) == 0 {
            return false;
        }
        self.consume(1);
        true
    }

    fn refund(&mut self) {
        if let Some(rate) = self.rate {
            self.tokens = (self.tokens + 1.0).min(rate as f64);
        }
    }
}

/// Receiving end of a multiplexed bulk transfer
#[derive(Debug)]
pub struct BulkDownload {
    transfer_id: u16,
    sink: Arc<BulkSink>,
    session: Weak<PeerSession>,
}

impl BulkDownload {
    /// Transfer id
    pub fn transfer_id(&self) -> u16 {
        self.transfer_id
    }

    /// Announced length
    pub fn expected(&self) -> u64 {
        self.sink.expected()
    }

    /// Bytes received so far
    pub fn received(&self) -> usize {
        self.sink.received()
    }

    /// Block until the whole payload arrived, the transfer failed or
    /// `timeout` passed
    pub fn wait(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        self.sink.wait(timeout)
    }

    /// Give up on the transfer and tell the sender to stop
    pub fn cancel(self) {
        if let Some(session) = self.session.upgrade() {
            session.cancel_bulk(self.transfer_id);
        }
    }
}

/// Everything this node knows and does about one remote peer
pub struct PeerSession {
    peer: PeerId,
    config: Arc<LinkConfig>,
    presentation: Arc<dyn WirePresentation>,
    handler: Arc<dyn InboundHandler>,
    contact: RwLock<Option<Contact>>,
    queue: MessageQueue,
    connections: RwLock<Vec<Arc<Connection>>>,
    writer: Mutex<FlowWriter>,
    reader: Mutex<FlowReader>,
    backoff: Mutex<Backoff>,
    gate: Mutex<RequestGate>,
    work_generation: AtomicU64,
    last_active: Mutex<Instant>,
    counters: Counters,
    removed: AtomicBool,
    me: Weak<PeerSession>,
}

impl PeerSession {
    /// Create the session for `peer`
    pub fn new(
        peer: PeerId,
        config: Arc<LinkConfig>,
        expiry: ExpiryHandle,
        handler: Arc<dyn InboundHandler>,
    ) -> Arc<Self> {
        let presentation: Arc<dyn WirePresentation> = if config.multiplexed {
            Arc::new(MuxPresentation::new(config.max_frame_body))
        } else {
            Arc::new(LegacyPresentation::new(config.max_frame_body))
        };
        let now = Instant::now();
        debug!(peer, multiplexed = config.multiplexed, "session created");
        Arc::new_cyclic(|me| PeerSession {
            peer,
            presentation,
            handler,
            contact: RwLock::new(None),
            queue: MessageQueue::new(expiry),
            connections: RwLock::new(Vec::new()),
            writer: Mutex::new(FlowWriter::new(
                config.initial_credit,
                config.chunk_size,
                config.max_chunk_attempts,
            )),
            reader: Mutex::new(FlowReader::new(config.initial_credit)),
            backoff: Mutex::new(Backoff::new(
                config.backoff_initial,
                config.backoff_max,
                config.unreachable_after_failures,
            )),
            gate: Mutex::new(RequestGate::new(now)),
            work_generation: AtomicU64::new(0),
            last_active: Mutex::new(now),
            counters: Counters::default(),
            removed: AtomicBool::new(false),
            me: me.clone(),
            config,
        })
    }

    /// Remote identity
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Node configuration
    pub fn config(&self) -> &Arc<LinkConfig> {
        &self.config
    }

    /// Wire presentation every connection of this session uses
    pub fn presentation(&self) -> &Arc<dyn WirePresentation> {
        &self.presentation
    }

    /// Current work generation
    pub fn work_generation(&self) -> u64 {
        self.work_generation.load(Ordering::Acquire)
    }

    /// Snapshot of the open connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    /// Messages waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether [`PeerSession::remove`] ran
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    // ----- sending -----

    /// Send `message`, reporting the outcome to `on_complete` exactly once.
    ///
    /// The message goes straight to an idle connection if there is one and
    /// is queued otherwise. With no connection at all and a peer that looks
    /// unreachable it fails right away.
    pub fn send_async(&self, message: OutboundMessage, on_complete: OnComplete) -> MessageId {
        let id = MessageId::next();
        if self.is_removed() {
            on_complete.fire(Err(TransportError::SessionRemoved));
            return id;
        }
        if self.connections.read().is_empty() && self.probably_unreachable() {
            debug!(peer = self.peer, msg_id = %id, "peer unreachable, failing send");
            self.counters.messages_failed.fetch_add(1, Ordering::Relaxed);
            on_complete.fire(Err(TransportError::Unreachable(self.peer)));
            return id;
        }
        self.touch();

        match self.prepare(id, message, on_complete) {
            Ok(msg) => self.dispatch(msg),
            Err((err, on_complete)) => {
                warn!(peer = self.peer, msg_id = %id, %err, "cannot start send");
                self.counters.messages_failed.fetch_add(1, Ordering::Relaxed);
                on_complete.fire(Err(err));
            }
        }
        id
    }

    /// Send and block the calling thread until the outcome is known or
    /// `timeout` (capped by the configuration) passes
    pub fn send_blocking(&self, message: OutboundMessage, timeout: Duration) -> SendResult {
        let completion = Arc::new(Completion::new());
        let id = self.send_async(message, OnComplete::Completion(completion.clone()));
        let wait = self.config.blocking_wait(timeout);
        match completion.wait_timeout(wait) {
            Some(result) => result,
            None => {
                if let Some(msg) = self.queue.remove(id) {
                    debug!(peer = self.peer, msg_id = %id, "blocking send timed out in queue");
                    msg.notify(Err(TransportError::Timeout(wait)));
                }
                Err(TransportError::Timeout(wait))
            }
        }
    }

    /// Withdraw a queued message. Messages already handed to a connection
    /// run their course.
    pub fn cancel(&self, id: MessageId) -> bool {
        match self.queue.remove(id) {
            Some(msg) => {
                debug!(peer = self.peer, msg_id = %id, "send cancelled");
                msg.notify(Err(TransportError::Cancelled));
                true
            }
            None => false,
        }
    }

    fn prepare(
        &self,
        id: MessageId,
        message: OutboundMessage,
        on_complete: OnComplete,
    ) -> Result<PendingRef, (TransportError, OnComplete)> {
        let priority = Priority::Request;
        let expires_at = Instant::now() + message.ttl.unwrap_or(self.config.message_ttl);
        let app = |bulk: Option<BulkHeader>| {
            Message::Application(AppMessage {
                corr_id: message.corr_id,
                request: message.request,
                body: message.body.clone(),
                bulk,
            })
        };

        let Some(data) = message.bulk.clone() else {
            let done = self.tracked(on_complete, None, id);
            return Ok(Arc::new(PendingMessage::new(
                id,
                app(None),
                priority,
                expires_at,
                done,
            )));
        };
        if data.len() > u32::MAX as usize {
            return Err((FlowError::TooLarge(data.len()).into(), on_complete));
        }
        let length = data.len() as u32;

        if !self.config.multiplexed {
            let done = self.tracked(on_complete, None, id);
            let header = BulkHeader {
                transfer_id: 0,
                length,
            };
            return Ok(Arc::new(
                PendingMessage::new(id, app(Some(header)), priority, expires_at, done)
                    .with_bulk(data),
            ));
        }

        let mut user = Some(on_complete);
        let started = self.writer.lock().start(data.clone(), |transfer_id| {
            let done = self.tracked(user.take().unwrap_or_default(), Some(transfer_id), id);
            let header = BulkHeader {
                transfer_id,
                length,
            };
            Arc::new(
                PendingMessage::new(id, app(Some(header)), priority, expires_at, done)
                    .with_bulk(data),
            )
        });
        started.map_err(|err| (err.into(), user.take().unwrap_or_default()))
    }

    /// Wrap the caller's completion with accounting, and with cleanup of a
    /// transfer whose announcement never made it out
    fn tracked(&self, user: OnComplete, transfer: Option<u16>, id: MessageId) -> OnComplete {
        let session = self.me.clone();
        OnComplete::callback(move |result: SendResult| {
            if let Some(session) = session.upgrade() {
                let counter = match result {
                    Ok(()) => &session.counters.messages_sent,
                    Err(_) => &session.counters.messages_failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                if let (Err(_), Some(transfer_id)) = (&result, transfer) {
                    if session.writer.lock().discard(transfer_id, id) {
                        debug!(peer = session.peer, transfer_id, "transfer dropped before it started");
                    }
                }
            }
            user.fire(result);
        })
    }

    fn dispatch(&self, msg: PendingRef) {
        let gated = msg.is_request();
        if gated && !self.gate.lock().try_acquire(Instant::now()) {
            trace!(peer = self.peer, msg_id = %msg.id(), "request waits for rate budget");
            self.enqueue(msg);
            return;
        }

        let mut msg = msg;
        for conn in self.connections() {
            if !conn.is_idle() {
                continue;
            }
            match conn.try_send(msg) {
                Ok(()) => return,
                Err(back) => msg = back,
            }
        }
        if gated {
            self.gate.lock().refund();
        }
        self.enqueue(msg);
    }

    fn enqueue(&self, msg: PendingRef) {
        if self.is_removed() {
            msg.notify(Err(TransportError::SessionRemoved));
            return;
        }
        trace!(peer = self.peer, msg_id = %msg.id(), priority = ?msg.priority(), "queued");
        self.queue.enqueue(msg);
        self.work_generation.fetch_add(1, Ordering::AcqRel);
        self.wake();
    }

    /// Queue a session-level control message
    pub fn send_control(&self, message: Message) {
        self.enqueue(PendingMessage::control(message, self.config.message_ttl));
    }

    /// Ask every idle connection to look for work
    pub fn wake(&self) {
        for conn in self.connections() {
            conn.pump();
        }
    }

    /// Wake connections if anything is queued
    pub fn wake_if_pending(&self) {
        if !self.queue.is_empty() {
            self.work_generation.fetch_add(1, Ordering::AcqRel);
            self.wake();
        }
    }

    /// Next packet for a connection that went idle, led by its own
    /// `control` messages
    pub fn next_packet(&self, control: Vec<PendingRef>) -> Option<Packet> {
        let mut control = control;
        loop {
            let picked = self.pick_batch();
            if picked.is_empty() && control.is_empty() {
                return None;
            }
            if let Some(packet) = self.build_packet(std::mem::take(&mut control), picked) {
                return Some(packet);
            }
        }
    }

    fn pick_batch(&self) -> Vec<PendingRef> {
        let mut budget = self.gate.lock().available(Instant::now());
        let picked = self.queue.pick_for_packet(
            self.config.max_packet_size,
            self.config.multiplexed,
            self.presentation.as_ref(),
            |msg| {
                if !msg.is_request() {
                    return true;
                }
                if budget == 0 {
                    return false;
                }
                budget -= 1;
                true
            },
        );
        let requests = picked.iter().filter(|m| m.is_request()).count();
        if requests > 0 {
            self.gate.lock().consume(requests as u32);
        }
        picked
    }

    /// Serialize messages into a packet. Messages that cannot be encoded
    /// fail on the spot; `None` if nothing is left.
    pub fn build_packet(&self, control: Vec<PendingRef>, picked: Vec<PendingRef>) -> Option<Packet> {
        let (packet, rejected) = Packet::build(
            control,
            picked,
            self.presentation.as_ref(),
            self.config.pad_boundary,
        );
        for (msg, err) in rejected {
            warn!(peer = self.peer, msg_id = %msg.id(), %err, "message cannot be encoded");
            msg.notify(Err(err.into()));
        }
        (!packet.is_empty()).then_some(packet)
    }

    /// Outcomes reported by a connection's packet
    pub fn deliver(&self, deliveries: Vec<Delivery>) {
        let mut started = false;
        for delivery in deliveries {
            match delivery {
                Delivery::Sent(msg) => {
                    msg.notify(Ok(()));
                }
                Delivery::StartBulk(msg) => {
                    let Some(header) = msg.message().bulk_header() else {
                        msg.notify(Ok(()));
                        continue;
                    };
                    if self.writer.lock().activate(header.transfer_id) {
                        debug!(peer = self.peer, transfer_id = header.transfer_id, "transfer announced");
                        started = true;
                    } else {
                        debug!(peer = self.peer, transfer_id = header.transfer_id, "announced transfer already gone");
                    }
                }
                Delivery::Failed(msg, err) => {
                    debug!(peer = self.peer, msg_id = %msg.id(), %err, "message failed");
                    msg.notify(Err(err));
                }
            }
        }
        if started {
            self.pump_transfers();
        }
    }

    // ----- bulk transfers -----

    /// Put the next chunk of every transfer that may send in the queue
    fn pump_transfers(&self) {
        let chunks: Vec<BulkChunk> = {
            let mut writer = self.writer.lock();
            let mut chunks = Vec::new();
            for transfer_id in writer.ready() {
                let Some((offset, data)) = writer.next_chunk(transfer_id) else {
                    continue;
                };
                match writer.write_chunk(transfer_id, offset, data) {
                    Ok(chunk) => chunks.push(chunk),
                    Err(err) => warn!(peer = self.peer, transfer_id, %err, "chunk not started"),
                }
            }
            chunks
        };
        for chunk in chunks {
            self.enqueue(self.chunk_message(chunk));
        }
    }

    fn chunk_message(&self, chunk: BulkChunk) -> PendingRef {
        let transfer_id = chunk.transfer_id;
        let session = self.me.clone();
        Arc::new(PendingMessage::new(
            MessageId::next(),
            Message::BulkChunk(chunk),
            Priority::BulkChunk,
            Instant::now() + self.config.message_ttl,
            OnComplete::callback(move |result| {
                if let Some(session) = session.upgrade() {
                    session.on_chunk_result(transfer_id, result);
                }
            }),
        ))
    }

    fn on_chunk_result(&self, transfer_id: u16, result: SendResult) {
        if let Err(err) = &result {
            debug!(peer = self.peer, transfer_id, %err, "chunk failed");
        }
        let outcome = self.writer.lock().chunk_done(transfer_id, result.is_ok());
        match outcome {
            ChunkOutcome::Continue => self.pump_transfers(),
            ChunkOutcome::Completed(owner) => {
                self.counters.transfers_completed.fetch_add(1, Ordering::Relaxed);
                info!(peer = self.peer, transfer_id, "transfer complete");
                owner.notify(Ok(()));
                self.pump_transfers();
            }
            ChunkOutcome::Retry(chunk) => {
                if !self.is_removed() {
                    self.enqueue(self.chunk_message(chunk));
                }
            }
            ChunkOutcome::Aborted { owner, attempts } => {
                self.counters.transfers_aborted.fetch_add(1, Ordering::Relaxed);
                // the receiver holds a reader for this id until told otherwise
                self.send_control(Message::KillTransfer { transfer_id });
                owner.notify(Err(TransportError::TransferAborted {
                    transfer_id,
                    attempts,
                }));
            }
            ChunkOutcome::Unknown => {
                trace!(peer = self.peer, transfer_id, "chunk result for a closed transfer");
            }
        }
    }

    /// Agree the bulk credit window with the peer's advertised one.
    ///
    /// Both sides settle on the smaller window, so the receiver's grant
    /// threshold never exceeds the credit the sender starts with. A peer
    /// that advertises nothing leaves the local window in place.
    pub fn set_peer_window(&self, peer_window: u32) {
        let window = match peer_window {
            0 => self.config.initial_credit,
            w => w.min(self.config.initial_credit),
        };
        self.writer.lock().set_initial_credit(window);
        self.reader.lock().set_window(window);
        debug!(peer = self.peer, peer_window, window, "bulk window agreed");
    }

    /// Accept an offered transfer. Must be called before its first chunk
    /// arrives, which in practice means from [`InboundHandler::on_message`].
    pub fn receive_bulk(&self, transfer_id: u16, length: u32) -> Result<BulkDownload, TransportError> {
        let sink = Arc::new(BulkSink::new(length as u64));
        self.reader.lock().register(transfer_id, sink.clone())?;
        debug!(peer = self.peer, transfer_id, length, "receiving transfer");
        Ok(BulkDownload {
            transfer_id,
            sink,
            session: self.me.clone(),
        })
    }

    /// Drop an incoming transfer and tell the sender
    pub fn cancel_bulk(&self, transfer_id: u16) -> bool {
        let cancelled = self.reader.lock().cancel(transfer_id);
        if cancelled {
            debug!(peer = self.peer, transfer_id, "incoming transfer cancelled");
            self.send_control(Message::KillTransfer { transfer_id });
        }
        cancelled
    }

    fn on_chunk(&self, chunk: BulkChunk) {
        let transfer_id = chunk.transfer_id;
        let outcome = self.reader.lock().received(&chunk);
        match outcome {
            ReceiveOutcome::Accepted { grant: Some(credit) } => {
                trace!(peer = self.peer, transfer_id, credit, "granting credit");
                self.send_control(Message::FlowCredit {
                    transfer_id,
                    credit,
                });
            }
            ReceiveOutcome::Accepted { grant: None } => {}
            ReceiveOutcome::Completed => {
                debug!(peer = self.peer, transfer_id, "incoming transfer complete");
            }
            ReceiveOutcome::Unknown { first_report } => {
                if first_report {
                    warn!(peer = self.peer, transfer_id, "chunk for unknown transfer, asking peer to drop it");
                    self.send_control(Message::KillTransfer { transfer_id });
                } else {
                    trace!(peer = self.peer, transfer_id, "dropping chunk for unknown transfer");
                }
            }
            ReceiveOutcome::Rejected(err) => {
                warn!(peer = self.peer, transfer_id, %err, "bad chunk, dropping transfer");
                self.send_control(Message::KillTransfer { transfer_id });
            }
        }
    }

    // ----- inbound -----

    /// A message decoded by `conn`
    pub fn handle_inbound(
        &self,
        conn: &Arc<Connection>,
        message: Message,
        trailer: Option<TrailerReader>,
    ) {
        trace!(peer = self.peer, conn = %conn.id(), kind = ?message.message_type(), "inbound");
        match message {
            Message::Application(app) => self.on_application(conn, app, trailer),
            Message::BulkChunk(chunk) => self.on_chunk(chunk),
            Message::FlowCredit {
                transfer_id,
                credit,
            } => {
                if self.writer.lock().grant(transfer_id, credit) {
                    self.pump_transfers();
                } else {
                    debug!(peer = self.peer, transfer_id, "credit for unknown transfer");
                }
            }
            Message::RateAnnouncement { requests_per_sec } => {
                info!(peer = self.peer, requests_per_sec, "peer announced request rate");
                self.gate.lock().set_rate(requests_per_sec, Instant::now());
                self.wake_if_pending();
            }
            Message::KillTransfer { transfer_id } => {
                // a kill names the id in both directions
                let owner = self.writer.lock().kill(transfer_id);
                let reader = self.reader.lock().cancel(transfer_id);
                if reader {
                    info!(peer = self.peer, transfer_id, "peer abandoned incoming transfer");
                }
                match owner {
                    Some(owner) => {
                        info!(peer = self.peer, transfer_id, "peer dropped transfer");
                        owner.notify(Err(TransportError::TransferClosed(transfer_id)));
                    }
                    None if !reader => {
                        debug!(peer = self.peer, transfer_id, "kill for unknown transfer")
                    }
                    None => {}
                }
            }
            Message::Goodbye { reason } => {
                info!(peer = self.peer, conn = %conn.id(), reason, "peer said goodbye");
                conn.close_recv();
            }
            Message::Hello(_) => {
                warn!(peer = self.peer, conn = %conn.id(), "unexpected hello after handshake");
            }
            Message::Padding { .. } => {}
        }
    }

    fn on_application(&self, conn: &Arc<Connection>, app: AppMessage, trailer: Option<TrailerReader>) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
        let bulk = match (trailer, app.bulk) {
            (Some(reader), _) => InboundBulk::Inline(reader),
            (None, Some(header)) if self.config.multiplexed => InboundBulk::Offered {
                transfer_id: header.transfer_id,
                length: header.length,
            },
            _ => InboundBulk::None,
        };
        let message = InboundMessage {
            peer: self.peer,
            connection: conn.id(),
            corr_id: app.corr_id,
            request: app.request,
            body: app.body,
            bulk,
        };
        if let Some(me) = self.me.upgrade() {
            self.handler.on_message(&me, message);
        }
    }

    // ----- connections and reachability -----

    /// Take ownership of a handshaken connection and start it
    pub fn attach(&self, conn: Arc<Connection>) -> Result<(), TransportError> {
        {
            let mut connections = self.connections.write();
            if self.is_removed() {
                drop(connections);
                conn.terminate("session removed");
                return Err(TransportError::SessionRemoved);
            }
            connections.push(conn.clone());
        }
        self.backoff.lock().reset();
        self.touch();
        info!(peer = self.peer, conn = %conn.id(), remote = conn.remote(), mode = ?conn.mode(), "connection attached");

        if let Err(err) = conn.start() {
            conn.terminate(format!("cannot start reading: {err}"));
            return Err(err);
        }
        self.announce_rate();
        conn.pump();
        Ok(())
    }

    /// Unregister a terminated connection. Returns false if it was not
    /// registered.
    pub fn connection_terminated(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut connections = self.connections.write();
            connections
                .iter()
                .position(|c| c.id() == id)
                .map(|pos| connections.swap_remove(pos))
        };
        match removed {
            Some(conn) => {
                self.counters
                    .retired_bytes_in
                    .fetch_add(conn.bytes_in(), Ordering::Relaxed);
                self.counters
                    .retired_bytes_out
                    .fetch_add(conn.bytes_out(), Ordering::Relaxed);
                self.touch();
                debug!(peer = self.peer, conn = %id, "connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Tell the peer how many requests per second we accept
    pub fn announce_rate(&self) {
        self.send_control(Message::RateAnnouncement {
            requests_per_sec: self.config.request_rate,
        });
    }

    /// Record a failed outbound connect, returning the backoff delay
    pub fn record_connect_failure(&self) -> Duration {
        self.backoff.lock().record_failure(Instant::now())
    }

    /// Whether a new outbound connect may start now
    pub fn may_connect(&self) -> bool {
        self.backoff.lock().may_retry(Instant::now())
    }

    /// No usable contact, or too many failed connects in a row
    pub fn probably_unreachable(&self) -> bool {
        self.contact.read().is_none() || self.backoff.lock().is_unreachable()
    }

    /// Current contact
    pub fn contact(&self) -> Option<Contact> {
        self.contact.read().clone()
    }

    /// Store `contact` unless a newer one is already known
    pub fn update_contact(&self, contact: Contact) -> bool {
        let mut current = self.contact.write();
        let newer = current
            .as_ref()
            .map_or(true, |known| contact.version > known.version);
        if newer {
            debug!(peer = self.peer, address = %contact.address, version = contact.version, "contact updated");
            *current = Some(contact);
        }
        newer
    }

    // ----- lifecycle -----

    /// Fail queued messages past their expiry
    pub fn expire(&self, now: Instant) -> usize {
        self.queue.expire_all(now)
    }

    /// No connections, no queued work, no transfers, and idle for longer
    /// than the eviction delay
    pub fn is_evictable(&self, now: Instant) -> bool {
        self.connections.read().is_empty()
            && self.queue.is_empty()
            && self.writer.lock().is_empty()
            && self.reader.lock().is_empty()
            && now.saturating_duration_since(*self.last_active.lock()) >= self.config.idle_eviction
    }

    /// Say goodbye on every connection
    pub fn close(&self) {
        for conn in self.connections() {
            conn.goodbye();
        }
    }

    /// Tear the session down: terminate its connections and fail everything
    /// still pending. Returns false if it was already removed.
    pub fn remove(&self, reason: &str) -> bool {
        if self.removed.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(peer = self.peer, reason, "removing session");

        for conn in self.connections() {
            conn.terminate(reason);
        }
        let owners = self.writer.lock().abort_all();
        for msg in self.queue.drain() {
            msg.notify(Err(TransportError::SessionRemoved));
        }
        for owner in owners {
            owner.notify(Err(TransportError::SessionRemoved));
        }
        self.reader.lock().abort_all(TransportError::SessionRemoved);
        true
    }

    /// Counter snapshot
    pub fn stats(&self) -> SessionStats {
        let connections = self.connections();
        let live_in: u64 = connections.iter().map(|c| c.bytes_in()).sum();
        let live_out: u64 = connections.iter().map(|c| c.bytes_out()).sum();
        let c = &self.counters;
        SessionStats {
            peer: self.peer,
            connections: connections.len(),
            queued: self.queue.len(),
            transfers_active: self.writer.lock().len(),
            transfers_incoming: self.reader.lock().len(),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_failed: c.messages_failed.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            bytes_in: c.retired_bytes_in.load(Ordering::Relaxed) + live_in,
            bytes_out: c.retired_bytes_out.load(Ordering::Relaxed) + live_out,
            transfers_completed: c.transfers_completed.load(Ordering::Relaxed),
            transfers_aborted: c.transfers_aborted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer)
            .field("connections", &self.connections.read().len())
            .field("queued", &self.queue.len())
            .field("removed", &self.is_removed())
            .finish()
    }
}
