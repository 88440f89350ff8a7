//! Peer link node binary.
//!
//! Accepts peer connections, dials configured peers, and optionally sends a
//! message (with a file as bulk payload) to every peer it dials. Inbound
//! requests are acknowledged with a reply; inbound bulk data is drained and
//! its size logged.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use link_session::{
    listen_tcp, Contact, InboundBulk, InboundHandler, InboundMessage, LinkManager, OnComplete,
    OutboundMessage, PeerSession,
};
use link_wire::Capabilities;
use std::{net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{NodeConfig, PeerEntry};
use logging::LinkLogFormatter;

/// How long a handler thread waits for an accepted bulk transfer
const BULK_WAIT: Duration = Duration::from_secs(5 * 60);

/// Time given to goodbyes before connections are torn down
const GOODBYE_GRACE: Duration = Duration::from_millis(200);

/// `ID@ADDR` peer designation
#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerArg(PeerEntry);

impl FromStr for PeerArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, address) = s
            .split_once('@')
            .ok_or_else(|| format!("expected ID@ADDR, got {s:?}"))?;
        let id = id.parse().map_err(|e| format!("bad node id {id:?}: {e}"))?;
        let address = address
            .parse()
            .map_err(|e| format!("bad address {address:?}: {e}"))?;
        Ok(PeerArg(PeerEntry { id, address }))
    }
}

/// Peer link node
#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about = "Peer link node")]
struct Args {
    /// Node ID (overrides the config file)
    #[arg(long)]
    node_id: Option<u64>,

    /// Listen address, e.g. 0.0.0.0:9000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer to dial, e.g. 2@127.0.0.1:9000 (repeatable)
    #[arg(long)]
    connect: Vec<PeerArg>,

    /// Send this text as a request to every dialed peer
    #[arg(long)]
    message: Option<String>,

    /// Attach this file as bulk payload to the message
    #[arg(long, requires = "message")]
    send_file: Option<PathBuf>,

    /// Use legacy framing
    #[arg(long)]
    legacy: bool,

    /// Send timeout, e.g. 30s
    #[arg(long, default_value = "30s")]
    send_timeout: humantime::Duration,

    /// Interval between stats log lines, e.g. 30s
    #[arg(long, default_value = "30s")]
    stats_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "link.yaml")]
    config: PathBuf,
}

/// Logs inbound traffic, acknowledges requests and drains bulk data
#[derive(Debug)]
struct NodeHandler;

impl InboundHandler for NodeHandler {
    fn on_message(&self, session: &Arc<PeerSession>, message: InboundMessage) {
        info!(
            component = "inbound",
            peer = message.peer,
            conn = %message.connection,
            corr_id = message.corr_id,
            len = message.body.len(),
            "{}",
            String::from_utf8_lossy(&message.body)
        );

        match message.bulk {
            InboundBulk::None => {}
            InboundBulk::Offered { transfer_id, length } => {
                match session.receive_bulk(transfer_id, length) {
                    Ok(download) => drain(format!("transfer {transfer_id}"), move || {
                        download.wait(BULK_WAIT)
                    }),
                    Err(err) => warn!(component = "inbound", transfer_id, %err, "cannot accept transfer"),
                }
            }
            InboundBulk::Inline(mut reader) => {
                drain("inline stream".to_string(), move || reader.read_to_end())
            }
        }

        if message.request {
            let reply = OutboundMessage::reply(message.corr_id, Bytes::from_static(b"ack"));
            let peer = message.peer;
            session.send_async(
                reply,
                OnComplete::callback(move |result| {
                    if let Err(err) = result {
                        warn!(component = "inbound", peer, %err, "reply failed");
                    }
                }),
            );
        }
    }
}

/// Wait for bulk data off the read path
fn drain<F>(what: String, wait: F)
where
    F: FnOnce() -> Result<Bytes, link_session::TransportError> + Send + 'static,
{
    let spawned = std::thread::Builder::new()
        .name("link-bulk".to_string())
        .spawn(move || match wait() {
            Ok(data) => info!(component = "inbound", len = data.len(), "{what} complete"),
            Err(err) => warn!(component = "inbound", %err, "{what} failed"),
        });
    if let Err(err) = spawned {
        warn!(component = "inbound", %err, "cannot start bulk reader");
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("peerlink={}", args.log_level).parse()?)
        .add_directive(format!("link_session={}", args.log_level).parse()?)
        .add_directive(format!("link_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .event_format(LinkLogFormatter::new("link"))
        .init();

    info!("Starting peer link node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    if args.node_id.is_some() {
        node_config.node_id = args.node_id;
    }
    if args.listen.is_some() {
        node_config.listen = args.listen;
    }
    if args.legacy {
        node_config.legacy = Some(true);
    }
    node_config
        .peers
        .extend(args.connect.iter().map(|peer| peer.0.clone()));
    let link_config = node_config.to_link_config()?;

    info!(
        "Link config: node_id={}, multiplexed={}, chunk_size={}, initial_credit={}, message_ttl={:?}",
        link_config.node_id,
        link_config.multiplexed,
        link_config.chunk_size,
        link_config.initial_credit,
        link_config.message_ttl
    );

    let manager = LinkManager::new(
        link_config,
        Arc::new(NodeHandler),
        tokio::runtime::Handle::current(),
    )?;
    let maintenance = manager.spawn_maintenance();

    let server = match node_config.listen {
        Some(addr) => {
            let listener = listen_tcp(addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            let manager = manager.clone();
            Some(tokio::spawn(async move { manager.serve(listener).await }))
        }
        None => None,
    };

    let capabilities = if manager.config().multiplexed {
        Capabilities::MULTIPLEX | Capabilities::BULK_CREDIT
    } else {
        Capabilities::empty()
    };
    for peer in &node_config.peers {
        manager.set_contact(
            peer.id,
            Contact {
                address: peer.address.to_string(),
                version: 1,
                capabilities,
            },
        );
    }

    if let Some(text) = args.message.clone() {
        let bulk = match &args.send_file {
            Some(path) => Some(Bytes::from(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
            )),
            None => None,
        };
        let timeout = Duration::from(args.send_timeout);
        for (n, peer) in node_config.peers.iter().enumerate() {
            let mut message = OutboundMessage::request(n as u64 + 1, text.clone());
            if let Some(bulk) = &bulk {
                message = message.with_bulk(bulk.clone());
            }
            let manager = manager.clone();
            let peer = peer.id;
            tokio::task::spawn_blocking(move || {
                match manager.send_blocking(peer, message, timeout) {
                    Ok(()) => info!(component = "outbound", peer, "message delivered to socket"),
                    Err(err) => warn!(component = "outbound", peer, %err, "send failed"),
                }
            });
        }
    }

    info!("Link node started. Waiting for events...");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;
    let mut stats_ticker = tokio::time::interval(Duration::from(args.stats_interval));
    stats_ticker.tick().await;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal, shutting down");
                break;
            }
            _ = stats_ticker.tick() => {
                for stats in manager.stats() {
                    info!(
                        component = "stats",
                        peer = stats.peer,
                        connections = stats.connections,
                        queued = stats.queued,
                        sent = stats.messages_sent,
                        failed = stats.messages_failed,
                        received = stats.messages_received,
                        transfers_out = stats.transfers_active,
                        transfers_in = stats.transfers_incoming,
                        bytes_in = stats.bytes_in,
                        bytes_out = stats.bytes_out,
                        "session stats"
                    );
                }
            }
        }
    }

    manager.close_all();
    tokio::time::sleep(GOODBYE_GRACE).await;
    manager.shutdown("node stopping");
    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("listener failed: {err:#}"),
            Err(err) => warn!("listener task failed: {err}"),
        }
    }
    if let Err(err) = maintenance.await {
        debug!("maintenance task failed: {err}");
    }

    info!("Link node stopped");
    Ok(())
}
