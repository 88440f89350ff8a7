//! Node-wide registry of peer sessions and the TCP glue that feeds them.
//!
//! The [`LinkManager`] creates sessions on demand, turns handshaken sockets
//! into attached connections, dials peers that have queued work, and runs the
//! periodic maintenance pass (queue expiry, idle session eviction).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::completion::OnComplete;
use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionId, ConnectionParams, ConnectionRegistry};
use crate::error::{SendResult, TransportError};
use crate::handshake::handshake;
use crate::io::{IoEngine, IoHandle, PlainLink};
use crate::pending::MessageId;
use crate::queue::ExpiryWorker;
use crate::registry::Registry;
use crate::session::{Contact, InboundHandler, OutboundMessage, PeerId, PeerSession, SessionStats};
use crate::transport::{connect_tcp, TokioIoEngine};

/// Pause after a failed accept
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Queued messages failed for expiry
    pub expired: usize,
    /// Idle sessions dropped
    pub evicted: usize,
    /// Outbound connects started
    pub dials: usize,
}

/// Owner of every peer session of this node
pub struct LinkManager {
    config: Arc<LinkConfig>,
    handler: Arc<dyn InboundHandler>,
    runtime: Handle,
    engine: Arc<TokioIoEngine>,
    peers: Registry<PeerId, Arc<PeerSession>>,
    connections: Arc<ConnectionRegistry>,
    dialing: Registry<PeerId, ()>,
    next_connection: AtomicU64,
    expiry: ExpiryWorker,
    shutdown_tx: watch::Sender<bool>,
    me: Weak<LinkManager>,
}

impl fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkManager")
            .field("node_id", &self.config.node_id)
            .field("peers", &self.peers.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl LinkManager {
    /// Create a manager whose sockets and dials run on `runtime`
    pub fn new(
        config: LinkConfig,
        handler: Arc<dyn InboundHandler>,
        runtime: Handle,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate().context("invalid link configuration")?;
        let expiry = ExpiryWorker::spawn().context("starting expiry worker")?;
        let engine = TokioIoEngine::new(runtime.clone());
        let (shutdown_tx, _) = watch::channel(false);
        info!(
            node_id = config.node_id,
            multiplexed = config.multiplexed,
            "link manager created"
        );
        Ok(Arc::new_cyclic(|me| LinkManager {
            config: Arc::new(config),
            handler,
            runtime,
            engine,
            peers: Registry::new(),
            connections: Arc::new(ConnectionRegistry::new()),
            dialing: Registry::new(),
            next_connection: AtomicU64::new(1),
            expiry,
            shutdown_tx,
            me: me.clone(),
        }))
    }

    /// Shared configuration
    pub fn config(&self) -> &Arc<LinkConfig> {
        &self.config
    }

    /// Socket engine used for TCP connections
    pub fn engine(&self) -> &Arc<TokioIoEngine> {
        &self.engine
    }

    /// The session for `peer`, created if needed
    pub fn session(&self, peer: PeerId) -> Arc<PeerSession> {
        let (session, created) = self.peers.get_or_insert_with(peer, || {
            PeerSession::new(
                peer,
                self.config.clone(),
                self.expiry.handle(),
                self.handler.clone(),
            )
        });
        if created {
            info!(peer, "peer session added");
        }
        session
    }

    /// Existing session for `peer`
    pub fn lookup(&self, peer: PeerId) -> Option<Arc<PeerSession>> {
        self.peers.lookup(&peer)
    }

    /// Snapshot of all sessions
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.peers.values()
    }

    /// Live connection by id
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lookup(&id)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Record how to reach `peer`. Returns false if a newer contact was known.
    pub fn set_contact(&self, peer: PeerId, contact: Contact) -> bool {
        self.session(peer).update_contact(contact)
    }

    /// Send to `peer`, dialing it if it has no connection
    pub fn send_async(
        &self,
        peer: PeerId,
        message: OutboundMessage,
        on_complete: OnComplete,
    ) -> MessageId {
        let session = self.session(peer);
        let id = session.send_async(message, on_complete);
        self.ensure_connected(&session);
        id
    }

    /// Send to `peer` and wait for the outcome. Blocks the calling thread,
    /// so never call it from a runtime worker.
    pub fn send_blocking(
        &self,
        peer: PeerId,
        message: OutboundMessage,
        timeout: Duration,
    ) -> SendResult {
        let session = self.session(peer);
        if session.connections().is_empty() {
            self.ensure_connected(&session);
        }
        session.send_blocking(message, timeout)
    }

    /// Turn a registered socket into a connection of `peer` and start it
    pub fn attach_connection(
        &self,
        peer: PeerId,
        handle: IoHandle,
        remote: String,
        io: Arc<dyn IoEngine>,
    ) -> Result<Arc<Connection>, TransportError> {
        let session = self.session(peer);
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let conn = Connection::new(
            ConnectionParams {
                id,
                handle,
                remote,
                io,
                tx_cipher: Box::new(PlainLink),
                rx_cipher: Box::new(PlainLink),
            },
            &session,
            Some(self.connections.clone()),
        );
        self.connections.insert(id, conn.clone());
        session.attach(conn.clone())?;
        Ok(conn)
    }

    /// Handshake on an accepted socket and attach it
    pub async fn accept(&self, mut stream: TcpStream) -> anyhow::Result<Arc<Connection>> {
        let remote = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let hello = handshake(&mut stream, &self.config)
            .await
            .with_context(|| format!("handshake with {remote}"))?;
        self.session(hello.node_id).set_peer_window(hello.bulk_window);
        let handle = self.engine.register(stream);
        let conn = self.attach_connection(hello.node_id, handle, remote, self.engine.clone())?;
        Ok(conn)
    }

    /// Dial `peer` at its known contact
    pub async fn connect(&self, peer: PeerId) -> anyhow::Result<Arc<Connection>> {
        let session = self.session(peer);
        let Some(contact) = session.contact() else {
            bail!("no contact known for peer {peer}");
        };
        let addr: SocketAddr = contact
            .address
            .parse()
            .with_context(|| format!("bad address {} for peer {peer}", contact.address))?;

        let attempt = async {
            let mut stream = connect_tcp(addr)
                .await
                .with_context(|| format!("connecting to {addr}"))?;
            let hello = handshake(&mut stream, &self.config)
                .await
                .with_context(|| format!("handshake with {addr}"))?;
            if hello.node_id != peer {
                bail!("{addr} answered as node {}, expected {peer}", hello.node_id);
            }
            Ok::<_, anyhow::Error>((stream, hello))
        };
        match attempt.await {
            Ok((stream, hello)) => {
                session.set_peer_window(hello.bulk_window);
                let handle = self.engine.register(stream);
                let conn =
                    self.attach_connection(peer, handle, addr.to_string(), self.engine.clone())?;
                Ok(conn)
            }
            Err(err) => {
                let delay = session.record_connect_failure();
                warn!(peer, %addr, error = %err, retry_in = ?delay, "connect failed");
                Err(err)
            }
        }
    }

    /// Dial `peer` in the background unless it is connected, already being
    /// dialed, or backing off. Returns whether a dial started.
    fn ensure_connected(&self, session: &Arc<PeerSession>) -> bool {
        let peer = session.peer();
        if *self.shutdown_tx.borrow()
            || session.is_removed()
            || !session.connections().is_empty()
            || session.contact().is_none()
            || !session.may_connect()
        {
            return false;
        }
        let (_, started) = self.dialing.get_or_insert_with(peer, || ());
        if !started {
            return false;
        }
        let Some(manager) = self.me.upgrade() else {
            self.dialing.remove_if_present(&peer);
            return false;
        };
        self.runtime.spawn(async move {
            match manager.connect(peer).await {
                Ok(conn) => debug!(peer, conn = %conn.id(), "dial succeeded"),
                Err(err) => debug!(peer, error = %err, "dial failed"),
            }
            manager.dialing.remove_if_present(&peer);
        });
        true
    }

    /// Accept connections until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "accepting peer connections");
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!(error = %err, "accept failed");
                            tokio::time::sleep(ACCEPT_RETRY).await;
                            continue;
                        }
                    };
                    let Some(manager) = self.me.upgrade() else {
                        break;
                    };
                    self.runtime.spawn(async move {
                        match manager.accept(stream).await {
                            Ok(conn) => debug!(%addr, conn = %conn.id(), "inbound connection attached"),
                            Err(err) => warn!(%addr, error = %err, "inbound connection rejected"),
                        }
                    });
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
        info!("stopped accepting peer connections");
        Ok(())
    }

    /// Tear down the session of `peer`
    pub fn remove_peer(&self, peer: PeerId, reason: &str) -> bool {
        match self.peers.remove_if_present(&peer) {
            Some(session) => session.remove(reason),
            None => false,
        }
    }

    /// Expire queued messages, redial peers with queued work and drop
    /// sessions idle past the eviction delay
    pub fn run_maintenance(&self, now: Instant) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for session in self.sessions() {
            report.expired += session.expire(now);
            session.wake_if_pending();
            if session.queue_len() > 0 && self.ensure_connected(&session) {
                report.dials += 1;
            }
            let peer = session.peer();
            if let Some(evicted) = self.peers.remove_if(&peer, |s| s.is_evictable(now)) {
                evicted.remove("idle");
                report.evicted += 1;
            }
        }
        if report.expired > 0 || report.evicted > 0 {
            debug!(?report, "maintenance pass");
        }
        report
    }

    /// Run maintenance every configured interval until shutdown
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let me = self.me.clone();
        let period = self.config.maintenance_interval;
        let mut shutdown = self.shutdown_tx.subscribe();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = me.upgrade() else {
                            break;
                        };
                        manager.run_maintenance(Instant::now());
                    }
                    _ = stopped(&mut shutdown) => break,
                }
            }
            debug!("maintenance stopped");
        })
    }

    /// Counters of every session
    pub fn stats(&self) -> Vec<SessionStats> {
        let mut stats: Vec<_> = self.sessions().iter().map(|s| s.stats()).collect();
        stats.sort_by_key(|s| s.peer);
        stats
    }

    /// Say goodbye on every connection
    pub fn close_all(&self) {
        for session in self.sessions() {
            session.close();
        }
    }

    /// Stop accepting and dialing, and remove every session
    pub fn shutdown(&self, reason: &str) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(reason, peers = self.peers.len(), "link manager shutting down");
        for session in self.sessions() {
            if self.peers.remove_if_present(&session.peer()).is_some() {
                session.remove(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BulkDownload, InboundBulk, InboundMessage};
    use crate::testing::{MockIo, RecordingHandler};
    use crate::transport::listen_tcp;
    use bytes::Bytes;
    use link_wire::Capabilities;
    use tokio::sync::{mpsc, oneshot};

    #[derive(Debug)]
    struct ChannelHandler {
        tx: mpsc::UnboundedSender<(PeerId, Bytes)>,
    }

    impl InboundHandler for ChannelHandler {
        fn on_message(&self, session: &Arc<PeerSession>, message: InboundMessage) {
            let _ = self.tx.send((session.peer(), message.body));
        }
    }

    fn node(node_id: u64) -> (Arc<LinkManager>, mpsc::UnboundedReceiver<(PeerId, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = LinkConfig {
            node_id,
            ..Default::default()
        };
        let manager =
            LinkManager::new(config, Arc::new(ChannelHandler { tx }), Handle::current()).unwrap();
        (manager, rx)
    }

    fn contact(addr: SocketAddr) -> Contact {
        Contact {
            address: addr.to_string(),
            version: 1,
            capabilities: Capabilities::MULTIPLEX,
        }
    }

    fn completion() -> (OnComplete, oneshot::Receiver<SendResult>) {
        let (tx, rx) = oneshot::channel();
        (
            OnComplete::callback(move |result| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_dials_and_delivers() {
        let (server, mut server_rx) = node(1);
        let (client, mut client_rx) = node(2);
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        assert!(client.set_contact(1, contact(addr)));
        let (on_complete, done) = completion();
        client.send_async(1, OutboundMessage::request(10, "ping"), on_complete);
        assert_eq!(done.await.unwrap(), Ok(()));
        assert_eq!(server_rx.recv().await.unwrap(), (2, Bytes::from_static(b"ping")));

        let (on_complete, done) = completion();
        server.send_async(2, OutboundMessage::reply(10, "pong"), on_complete);
        assert_eq!(done.await.unwrap(), Ok(()));
        assert_eq!(client_rx.recv().await.unwrap(), (1, Bytes::from_static(b"pong")));

        assert_eq!(client.connection_count(), 1);
        assert_eq!(client.stats()[0].messages_sent, 1);

        server.shutdown("test over");
        client.shutdown("test over");
        serving.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_to_wrong_node_backs_off() {
        let (server, _server_rx) = node(1);
        let (client, _client_rx) = node(2);
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await });
        }

        client.set_contact(3, contact(addr));
        assert!(client.connect(3).await.is_err());
        let session = client.lookup(3).unwrap();
        assert!(session.connections().is_empty());
        assert!(!session.may_connect());
        assert!(client.connect(9).await.is_err());

        server.shutdown("test over");
        client.shutdown("test over");
    }

    #[tokio::test]
    async fn test_maintenance_evicts_idle_sessions() {
        let config = LinkConfig {
            idle_eviction: Duration::ZERO,
            ..Default::default()
        };
        let manager =
            LinkManager::new(config, Arc::new(RecordingHandler::default()), Handle::current())
                .unwrap();
        let idle = manager.session(5);
        let io = MockIo::new();
        let busy = manager
            .attach_connection(6, IoHandle(1), "10.0.0.6:7000".into(), io.clone())
            .unwrap();

        let report = manager.run_maintenance(Instant::now());
        assert_eq!(report.evicted, 1);
        assert!(idle.is_removed());
        assert!(manager.lookup(5).is_none());
        assert!(manager.lookup(6).is_some());

        busy.terminate("gone");
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.run_maintenance(Instant::now()).evicted, 1);
        manager.shutdown("test over");
    }

    #[tokio::test]
    async fn test_remove_peer_terminates_connections() {
        let manager = LinkManager::new(
            LinkConfig::default(),
            Arc::new(RecordingHandler::default()),
            Handle::current(),
        )
        .unwrap();
        let io = MockIo::new();
        let conn = manager
            .attach_connection(4, IoHandle(1), "10.0.0.4:7000".into(), io.clone())
            .unwrap();
        assert_eq!(manager.connection_count(), 1);

        assert!(manager.remove_peer(4, "operator"));
        assert!(conn.is_terminated());
        assert!(io.is_closed(IoHandle(1)));
        assert_eq!(manager.connection_count(), 0);
        assert!(!manager.remove_peer(4, "again"));

        let fresh = manager.session(4);
        assert!(!fresh.is_removed());
        manager.shutdown("test over");
    }

    #[derive(Debug)]
    struct AcceptingHandler {
        tx: mpsc::UnboundedSender<BulkDownload>,
    }

    impl InboundHandler for AcceptingHandler {
        fn on_message(&self, session: &Arc<PeerSession>, message: InboundMessage) {
            if let InboundBulk::Offered {
                transfer_id,
                length,
            } = message.bulk
            {
                if let Ok(download) = session.receive_bulk(transfer_id, length) {
                    let _ = self.tx.send(download);
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bulk_windows_agreed_at_handshake() {
        let (tx, mut downloads) = mpsc::unbounded_channel();
        let server = LinkManager::new(
            LinkConfig {
                node_id: 1,
                ..Default::default()
            },
            Arc::new(AcceptingHandler { tx }),
            Handle::current(),
        )
        .unwrap();
        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        let client = LinkManager::new(
            LinkConfig {
                node_id: 2,
                chunk_size: 2048,
                initial_credit: 4096,
                ..Default::default()
            },
            Arc::new(ChannelHandler { tx: client_tx }),
            Handle::current(),
        )
        .unwrap();
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await });
        }

        client.set_contact(1, contact(addr));
        let payload: Bytes = (0..100_000u32).map(|i| (i % 97) as u8).collect::<Vec<_>>().into();
        let (on_complete, done) = completion();
        client.send_async(
            1,
            OutboundMessage::reply(3, "blob").with_bulk(payload.clone()),
            on_complete,
        );

        let download = tokio::time::timeout(Duration::from_secs(10), downloads.recv())
            .await
            .unwrap()
            .unwrap();
        let received = tokio::task::spawn_blocking(move || download.wait(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(received, Ok(payload));
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(10), done).await.unwrap().unwrap(),
            Ok(())
        );

        server.shutdown("test over");
        client.shutdown("test over");
    }
}
