//! Peer sessions, connections and bulk flow control for peer links.
//!
//! This crate moves application messages between nodes over one or more
//! TCP connections per peer. Messages are queued per peer by priority,
//! batched into packets, and tracked until every byte is acknowledged by the
//! socket. Large payloads travel either as credit-controlled chunked
//! transfers on multiplexed connections or as inline trailers on legacy ones.
//!
//! ## Features
//!
//! - **Send pipeline**: direct handoff to idle connections, priority queue
//!   with expiry, packet assembly with padding
//! - **Connection state machine**: one write in flight, half-close on short
//!   writes, idempotent termination
//! - **Bulk transfers**: sender credit and receiver window, kill on either
//!   side, retry budget per chunk
//! - **Inline trailers**: bounded buffering with read pausing and a stall
//!   timeout
//! - **Reachability**: reconnect backoff, fail-fast for unreachable peers,
//!   request rate announcements
//! - **TCP transport**: tokio socket engine, HELLO handshake, node-wide
//!   [`LinkManager`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use link_session::{
//!     Contact, InboundHandler, InboundMessage, LinkConfig, LinkManager, OutboundMessage,
//!     PeerSession,
//! };
//! use link_wire::Capabilities;
//!
//! #[derive(Debug)]
//! struct Printer;
//!
//! impl InboundHandler for Printer {
//!     fn on_message(&self, session: &Arc<PeerSession>, message: InboundMessage) {
//!         println!("{} bytes from node {}", message.body.len(), session.peer());
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = LinkConfig { node_id: 1001, ..Default::default() };
//! let manager = LinkManager::new(config, Arc::new(Printer), tokio::runtime::Handle::current())?;
//! manager.spawn_maintenance();
//!
//! manager.set_contact(
//!     1002,
//!     Contact {
//!         address: "127.0.0.1:9000".into(),
//!         version: 1,
//!         capabilities: Capabilities::MULTIPLEX,
//!     },
//! );
//! let sender = manager.clone();
//! tokio::task::spawn_blocking(move || {
//!     sender.send_blocking(1002, OutboundMessage::request(1, "hello"), Duration::from_secs(5))
//! })
//! .await??;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod buffer;
pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod handshake;
pub mod io;
pub mod manager;
pub mod packet;
pub mod pending;
pub mod queue;
pub mod registry;
pub mod session;
pub mod trailer;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use completion::{Completion, OnComplete};
pub use config::LinkConfig;
pub use connection::{Connection, ConnectionId, FramingMode};
pub use error::{FlowError, SendResult, TransportError};
pub use handshake::{handshake, local_hello, negotiate, recv_hello, send_hello};
pub use io::{IoEngine, IoHandle, LinkCipher, PlainLink, ReadEvent};
pub use manager::{LinkManager, MaintenanceReport};
pub use pending::{MessageId, Priority};
pub use session::{
    BulkDownload, Contact, InboundBulk, InboundHandler, InboundMessage, OutboundMessage, PeerId,
    PeerSession, SessionStats,
};
pub use trailer::TrailerReader;
pub use transport::{connect_tcp, listen_tcp, TokioIoEngine};
