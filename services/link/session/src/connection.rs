//! One physical link to a peer.
//!
//! A connection owns a socket handle, at most one outbound [`Packet`] in
//! flight, and the inbound framing state. On the send side it asks its
//! session for work whenever it goes idle; on the receive side it turns
//! decrypted bytes into messages with the multiplexed [`PacketFramer`] or the
//! legacy single-message parser with its inline bulk sub-stream.
//!
//! Direction flags only ever go from open to closed. Once both directions
//! are closed the connection terminates, and termination runs exactly once
//! however many paths ask for it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use link_wire::{Message, PacketFramer, Parsed, WirePresentation, GOODBYE_NORMAL};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::buffer::ByteQueue;
use crate::completion::OnComplete;
use crate::config::LinkConfig;
use crate::error::TransportError;
use crate::io::{IoEngine, IoHandle, LinkCipher, ReadEvent};
use crate::packet::Packet;
use crate::pending::{MessageId, PendingMessage, PendingRef, Priority};
use crate::registry::Registry;
use crate::session::PeerSession;
use crate::trailer::{trailer_stream, TrailerHooks, TrailerLimits, TrailerReader, TrailerWriter};

/// Every live connection of a node
pub type ConnectionRegistry = Registry<ConnectionId, Arc<Connection>>;

/// Node-wide connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How inbound bytes are framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Length-prefixed frames, bulk data as chunks
    Multiplexed,
    /// One message at a time with inline bulk data
    Legacy,
}

/// Flag that can be set once and never cleared
#[derive(Debug, Default)]
pub struct OneWayFlag(AtomicBool);

impl OneWayFlag {
    /// An unset flag
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Whether the flag is set
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Set the flag. Returns true if this call performed the transition.
    pub fn set(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug)]
enum SendSlot {
    Idle,
    Assembling,
    Sending(Packet),
}

/// A decoded inbound message, with its inline bulk stream if it has one
type Inbound = (Message, Option<TrailerReader>);

struct RecvState {
    cipher: Box<dyn LinkCipher>,
    framer: PacketFramer,
    accumulator: ByteQueue,
    trailer: Option<TrailerWriter>,
}

/// What a new connection is made of
pub struct ConnectionParams {
    /// Node-wide id
    pub id: ConnectionId,
    /// Socket handle in `io`
    pub handle: IoHandle,
    /// Remote address, for logs
    pub remote: String,
    /// Engine the handle belongs to
    pub io: Arc<dyn IoEngine>,
    /// Cipher for outbound bytes
    pub tx_cipher: Box<dyn LinkCipher>,
    /// Cipher for inbound bytes
    pub rx_cipher: Box<dyn LinkCipher>,
}

/// One socket to a peer
pub struct Connection {
    id: ConnectionId,
    peer: u64,
    handle: IoHandle,
    remote: String,
    mode: FramingMode,
    io: Arc<dyn IoEngine>,
    presentation: Arc<dyn WirePresentation>,
    config: Arc<LinkConfig>,
    session: Weak<PeerSession>,
    registry: Option<Arc<ConnectionRegistry>>,
    slot: Mutex<SendSlot>,
    control: Mutex<Vec<PendingRef>>,
    tx_cipher: Mutex<Box<dyn LinkCipher>>,
    recv: Mutex<RecvState>,
    send_closed: OneWayFlag,
    recv_closed: OneWayFlag,
    terminated: OneWayFlag,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    me: Weak<Connection>,
}

impl Connection {
    /// Build a connection for `session`. Reading starts with [`Connection::start`].
    pub fn new(
        params: ConnectionParams,
        session: &Arc<PeerSession>,
        registry: Option<Arc<ConnectionRegistry>>,
    ) -> Arc<Self> {
        let config = session.config().clone();
        let mode = if config.multiplexed {
            FramingMode::Multiplexed
        } else {
            FramingMode::Legacy
        };
        Arc::new_cyclic(|me| Connection {
            id: params.id,
            peer: session.peer(),
            handle: params.handle,
            remote: params.remote,
            mode,
            io: params.io,
            presentation: session.presentation().clone(),
            session: Arc::downgrade(session),
            registry,
            slot: Mutex::new(SendSlot::Idle),
            control: Mutex::new(Vec::new()),
            tx_cipher: Mutex::new(params.tx_cipher),
            recv: Mutex::new(RecvState {
                cipher: params.rx_cipher,
                framer: PacketFramer::new(config.max_frame_body),
                accumulator: ByteQueue::new(),
                trailer: None,
            }),
            send_closed: OneWayFlag::new(),
            recv_closed: OneWayFlag::new(),
            terminated: OneWayFlag::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            me: me.clone(),
            config,
        })
    }

    /// Register for reads
    pub fn start(&self) -> Result<(), TransportError> {
        let me = self.me.clone();
        self.io.register_for_read(
            self.handle,
            Box::new(move |event| {
                if let Some(conn) = me.upgrade() {
                    conn.on_read(event);
                }
            }),
        )
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Socket handle
    pub fn handle(&self) -> IoHandle {
        self.handle
    }

    /// Remote address
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Framing in use
    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Whether nothing is being sent and sending is still possible
    pub fn is_idle(&self) -> bool {
        !self.send_closed.is_set() && matches!(*self.slot.lock(), SendSlot::Idle)
    }

    /// Whether the send direction is closed
    pub fn is_send_closed(&self) -> bool {
        self.send_closed.is_set()
    }

    /// Whether the receive direction is closed
    pub fn is_recv_closed(&self) -> bool {
        self.recv_closed.is_set()
    }

    /// Whether the connection has been terminated
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_set()
    }

    /// Bytes read from the socket
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes fully written to the socket
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    fn claim(&self) -> bool {
        let mut slot = self.slot.lock();
        if self.send_closed.is_set() || !matches!(*slot, SendSlot::Idle) {
            return false;
        }
        *slot = SendSlot::Assembling;
        true
    }

    fn release(&self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, SendSlot::Assembling) {
            *slot = SendSlot::Idle;
        }
    }

    /// Send `msg` right away if the connection is idle; hand it back if not
    pub fn try_send(&self, msg: PendingRef) -> Result<(), PendingRef> {
        let Some(session) = self.session.upgrade() else {
            return Err(msg);
        };
        if !self.claim() {
            return Err(msg);
        }
        let control = std::mem::take(&mut *self.control.lock());
        trace!(conn = %self.id, msg_id = %msg.id(), "direct handoff");
        match session.build_packet(control, vec![msg]) {
            Some(packet) => self.send_packet(&session, packet),
            None => self.release(),
        }
        Ok(())
    }

    /// Look for work and send it if this connection is idle.
    ///
    /// Work found missing is re-checked whenever the session's work
    /// generation moved while we were looking, so an enqueue racing with
    /// this call is never left behind.
    pub fn pump(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        loop {
            if !self.claim() {
                return;
            }
            let generation = session.work_generation();
            let control = std::mem::take(&mut *self.control.lock());
            match session.next_packet(control) {
                Some(packet) => {
                    self.send_packet(&session, packet);
                    return;
                }
                None => {
                    self.release();
                    if session.work_generation() == generation && self.control.lock().is_empty() {
                        return;
                    }
                }
            }
        }
    }

    /// Queue a connection-level control message ahead of session traffic
    pub fn send_control(&self, message: Message, on_complete: OnComplete) {
        let msg = Arc::new(PendingMessage::new(
            MessageId::next(),
            message,
            Priority::Control,
            std::time::Instant::now() + self.config.message_ttl,
            on_complete,
        ));
        self.control.lock().push(msg);
        self.pump();
    }

    /// Tell the peer we are done sending, then close the send direction
    pub fn goodbye(&self) {
        let me = self.me.clone();
        self.send_control(
            Message::Goodbye {
                reason: GOODBYE_NORMAL,
            },
            OnComplete::callback(move |_| {
                if let Some(conn) = me.upgrade() {
                    conn.close_send();
                }
            }),
        );
    }

    fn send_packet(&self, session: &Arc<PeerSession>, mut packet: Packet) {
        let mut bytes = BytesMut::from(&packet.bytes()[..]);
        if let Err(err) = self.tx_cipher.lock().encrypt(&mut bytes) {
            warn!(conn = %self.id, %err, "encryption failed");
            session.deliver(packet.fail_remaining(err.clone()));
            self.release();
            self.terminate(err.to_string());
            return;
        }

        trace!(conn = %self.id, bytes = bytes.len(), messages = packet.message_count(), "sending packet");
        *self.slot.lock() = SendSlot::Sending(packet);

        let me = self.me.clone();
        let registered = self.io.register_for_write(
            self.handle,
            bytes.freeze(),
            Box::new(move |acked, finished| {
                if let Some(conn) = me.upgrade() {
                    conn.on_write_progress(acked, finished);
                }
            }),
        );
        if let Err(err) = registered {
            warn!(conn = %self.id, %err, "write registration failed");
            self.abort_send(err);
        }
    }

    fn abort_send(&self, error: TransportError) {
        let packet = {
            let mut slot = self.slot.lock();
            self.send_closed.set();
            match std::mem::replace(&mut *slot, SendSlot::Idle) {
                SendSlot::Sending(packet) => Some(packet),
                _ => None,
            }
        };
        if let (Some(mut packet), Some(session)) = (packet, self.session.upgrade()) {
            session.deliver(packet.fail_remaining(error));
        }
        self.job_done(false);
    }

    /// Progress report for the packet in flight
    pub fn on_write_progress(&self, acked: usize, finished: bool) {
        let (deliveries, outcome) = {
            let mut slot = self.slot.lock();
            let SendSlot::Sending(packet) = &mut *slot else {
                if !self.terminated.is_set() {
                    warn!(conn = %self.id, acked, "write progress with no packet in flight");
                }
                return;
            };
            let deliveries = packet.on_write_progress(acked, finished);
            if !finished {
                (deliveries, None)
            } else {
                let complete = packet.is_complete();
                let len = packet.len();
                if !complete {
                    self.send_closed.set();
                }
                *slot = SendSlot::Idle;
                (deliveries, Some((complete, len)))
            }
        };

        if let Some(session) = self.session.upgrade() {
            session.deliver(deliveries);
        }
        if let Some((complete, len)) = outcome {
            if complete {
                self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
            }
            self.job_done(complete);
        }
    }

    /// The packet in flight is done; look for more work or wind down
    fn job_done(&self, success: bool) {
        if success {
            self.pump();
            self.terminate_if_closed();
            return;
        }
        warn!(conn = %self.id, peer = self.peer, "write failed, send direction closed");
        if self.recv_closed.is_set() {
            self.terminate("write failed");
        } else if let Some(session) = self.session.upgrade() {
            session.wake();
        }
    }

    /// Stop sending on this connection
    pub fn close_send(&self) {
        if self.send_closed.set() {
            debug!(conn = %self.id, "send direction closed");
        }
        self.terminate_if_closed();
    }

    /// Stop receiving on this connection
    pub fn close_recv(&self) {
        if self.recv_closed.set() {
            debug!(conn = %self.id, "receive direction closed");
        }
        self.terminate_if_closed();
    }

    /// Terminate once both directions are closed and no packet is in flight.
    ///
    /// A packet still being written is left to finish; the check runs again
    /// when its write is done.
    fn terminate_if_closed(&self) {
        if self.send_closed.is_set()
            && self.recv_closed.is_set()
            && !self.terminated.is_set()
            && !self.is_sending()
        {
            self.terminate("both directions closed");
        }
    }

    fn is_sending(&self) -> bool {
        matches!(*self.slot.lock(), SendSlot::Sending(_))
    }

    /// Read event from the engine
    pub fn on_read(&self, event: ReadEvent) {
        let data = match event {
            ReadEvent::Data(data) => data,
            ReadEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "closed by peer".to_string());
                self.terminate(reason);
                return;
            }
        };
        if self.recv_closed.is_set() {
            trace!(conn = %self.id, len = data.len(), "dropping bytes after receive close");
            return;
        }
        self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);

        let (inbound, failure) = self.process(data);
        if let Some(session) = self.session.upgrade() {
            if let Some(me) = self.me.upgrade() {
                for (message, trailer) in inbound {
                    session.handle_inbound(&me, message, trailer);
                }
            }
        }
        if let Some(err) = failure {
            warn!(conn = %self.id, peer = self.peer, %err, "closing connection on bad input");
            self.terminate(err.to_string());
        }
    }

    fn process(&self, data: Bytes) -> (Vec<Inbound>, Option<TransportError>) {
        let mut recv = self.recv.lock();
        let mut data = BytesMut::from(&data[..]);
        if let Err(err) = recv.cipher.decrypt(&mut data) {
            return (Vec::new(), Some(err));
        }

        match self.mode {
            FramingMode::Multiplexed => match recv.framer.feed(&data) {
                Ok(messages) => (messages.into_iter().map(|m| (m, None)).collect(), None),
                Err(err) => (Vec::new(), Some(err.into())),
            },
            FramingMode::Legacy => {
                recv.accumulator.append(&data);
                self.parse_legacy(&mut recv)
            }
        }
    }

    fn parse_legacy(&self, recv: &mut RecvState) -> (Vec<Inbound>, Option<TransportError>) {
        let mut out = Vec::new();
        loop {
            if let Some(trailer) = recv.trailer.as_ref() {
                let fed = trailer.push(recv.accumulator.readable());
                recv.accumulator.consume(fed);
                if !trailer.is_complete() {
                    break;
                }
                recv.trailer = None;
            }
            if recv.accumulator.is_empty() {
                break;
            }
            match self.presentation.parse(recv.accumulator.readable()) {
                Ok(Parsed::NeedMore { skipped }) => {
                    recv.accumulator.consume(skipped);
                    break;
                }
                Ok(Parsed::Message {
                    message,
                    consumed,
                    trailer_len,
                }) => {
                    recv.accumulator.consume(consumed);
                    if trailer_len > 0 {
                        let (writer, reader) = trailer_stream(trailer_len, self.trailer_limits(), self.trailer_hooks());
                        recv.trailer = Some(writer);
                        out.push((message, Some(reader)));
                    } else {
                        out.push((message, None));
                    }
                }
                Err(err) => return (out, Some(err.into())),
            }
        }
        (out, None)
    }

    fn trailer_limits(&self) -> TrailerLimits {
        TrailerLimits {
            stall_timeout: self.config.trailer_stall_timeout,
            pause_at: self.config.trailer_pause_threshold,
            resume_at: self.config.trailer_resume_threshold,
        }
    }

    fn trailer_hooks(&self) -> TrailerHooks {
        let io = self.io.clone();
        let handle = self.handle;
        let me = self.me.clone();
        TrailerHooks {
            set_read_interest: Box::new(move |on| io.set_read_interest(handle, on)),
            abort: Box::new(move |err| {
                if let Some(conn) = me.upgrade() {
                    conn.terminate(format!("inline bulk stream: {err}"));
                }
            }),
        }
    }

    /// Tear the connection down. Returns false if it was already terminated.
    ///
    /// Closes the socket, fails the packet in flight, wakes any inline bulk
    /// reader and unregisters the connection from its session and from the
    /// node registry.
    pub fn terminate(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if !self.terminated.set() {
            debug!(conn = %self.id, %reason, "already terminated");
            return false;
        }
        self.send_closed.set();
        self.recv_closed.set();
        info!(conn = %self.id, peer = self.peer, remote = %self.remote, %reason, "connection terminated");

        self.io.close(self.handle);

        let packet = match std::mem::replace(&mut *self.slot.lock(), SendSlot::Idle) {
            SendSlot::Sending(packet) => Some(packet),
            _ => None,
        };
        let control = std::mem::take(&mut *self.control.lock());
        let trailer = self.recv.lock().trailer.take();
        let error = TransportError::ConnectionClosed(reason);
        if let Some(trailer) = trailer {
            trailer.fail(error.clone());
        }

        if let Some(registry) = &self.registry {
            registry.remove_if_present(&self.id);
        }
        let session = self.session.upgrade();
        if let Some(session) = &session {
            session.connection_terminated(self.id);
            if let Some(mut packet) = packet {
                session.deliver(packet.fail_remaining(error.clone()));
            }
            for msg in control {
                msg.notify(Err(error.clone()));
            }
            session.wake();
        }
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("mode", &self.mode)
            .field("send_closed", &self.send_closed.is_set())
            .field("recv_closed", &self.recv_closed.is_set())
            .field("terminated", &self.terminated.is_set())
            .finish()
    }
}
