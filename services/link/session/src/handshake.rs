//! HELLO exchange run on a fresh socket before it becomes a [`Connection`].
//!
//! The HELLO always uses the multiplexed frame encoding, whatever framing the
//! link uses afterwards, so both sides can read it before they agree on one.
//!
//! [`Connection`]: crate::connection::Connection

use anyhow::{bail, Context};
use bytes::BytesMut;
use link_wire::{encode_message, Capabilities, Hello, Message, PacketFramer, WIRE_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::config::LinkConfig;

/// Largest HELLO frame body accepted
const MAX_HELLO_BODY: usize = 64;

/// The HELLO this node sends
pub fn local_hello(config: &LinkConfig) -> Hello {
    if config.multiplexed {
        let capabilities =
            Capabilities::RATE_LIMIT | Capabilities::MULTIPLEX | Capabilities::BULK_CREDIT;
        Hello::new(config.node_id, capabilities).with_bulk_window(config.initial_credit)
    } else {
        Hello::new(config.node_id, Capabilities::RATE_LIMIT)
    }
}

/// Send a HELLO frame
pub async fn send_hello<W: AsyncWrite + Unpin>(writer: &mut W, hello: Hello) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    encode_message(&Message::Hello(hello), &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    debug!(node_id = hello.node_id, capabilities = ?hello.capabilities, "sent hello");
    Ok(())
}

/// Read exactly one HELLO frame, nothing past it
pub async fn recv_hello<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Hello> {
    let mut prefix = [0u8; 2];
    reader
        .read_exact(&mut prefix)
        .await
        .context("reading hello length")?;
    let total = u16::from_be_bytes(prefix) as usize;
    if total > MAX_HELLO_BODY {
        bail!("hello frame of {total} bytes is too large");
    }
    let mut body = vec![0u8; total];
    reader
        .read_exact(&mut body)
        .await
        .context("reading hello body")?;
    trace!(len = total, "read hello frame");

    let mut framer = PacketFramer::new(MAX_HELLO_BODY);
    let mut decoded = framer.feed(&prefix)?;
    decoded.extend(framer.feed(&body)?);
    match decoded.into_iter().next() {
        Some(Message::Hello(hello)) => Ok(hello),
        Some(other) => bail!("expected hello, got {:?}", other.message_type()),
        None => bail!("incomplete hello frame"),
    }
}

/// Check a remote HELLO against ours. Returns the remote node id.
pub fn negotiate(local: &Hello, remote: &Hello) -> anyhow::Result<u64> {
    if remote.version != WIRE_VERSION {
        bail!(
            "node {} speaks wire version {}, we speak {}",
            remote.node_id,
            remote.version,
            WIRE_VERSION
        );
    }
    if remote.multiplexed() != local.multiplexed() {
        bail!(
            "node {} uses {} framing, we use {}",
            remote.node_id,
            framing_name(remote),
            framing_name(local)
        );
    }
    if remote.node_id == local.node_id {
        bail!("connected to ourselves (node {})", local.node_id);
    }
    Ok(remote.node_id)
}

fn framing_name(hello: &Hello) -> &'static str {
    if hello.multiplexed() {
        "multiplexed"
    } else {
        "legacy"
    }
}

/// Run the whole exchange on `stream`: send ours, read theirs, negotiate.
/// Returns the accepted remote HELLO.
pub async fn handshake<S>(stream: &mut S, config: &LinkConfig) -> anyhow::Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = local_hello(config);
    send_hello(stream, local).await?;
    let remote = recv_hello(stream).await?;
    negotiate(&local, &remote)?;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(node_id: u64, multiplexed: bool) -> LinkConfig {
        LinkConfig {
            node_id,
            multiplexed,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let small = LinkConfig {
            initial_credit: 4096,
            ..config(2, true)
        };
        let big = config(1, true);
        let (left, right) = tokio::join!(
            handshake(&mut a, &big),
            handshake(&mut b, &small)
        );
        let left = left.unwrap();
        assert_eq!(left.node_id, 2);
        assert_eq!(left.bulk_window, 4096);
        let right = right.unwrap();
        assert_eq!(right.node_id, 1);
        assert_eq!(right.bulk_window, LinkConfig::default().initial_credit);
    }

    #[tokio::test]
    async fn test_recv_hello_leaves_following_bytes() {
        let (mut a, mut b) = tokio::io::duplex(256);
        send_hello(&mut a, local_hello(&config(5, false))).await.unwrap();
        a.write_all(b"next").await.unwrap();

        let hello = recv_hello(&mut b).await.unwrap();
        assert_eq!(hello.node_id, 5);
        assert!(!hello.multiplexed());
        let mut rest = [0u8; 4];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"next");
    }

    #[test]
    fn test_negotiate_rejects_mismatches() {
        let mux = local_hello(&config(1, true));
        let legacy = local_hello(&config(2, false));
        assert!(negotiate(&mux, &legacy).is_err());

        let mut old = local_hello(&config(3, true));
        old.version = WIRE_VERSION + 1;
        assert!(negotiate(&mux, &old).is_err());

        assert!(negotiate(&mux, &local_hello(&config(1, true))).is_err());
        assert_eq!(negotiate(&mux, &local_hello(&config(4, true))).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_eof_during_hello_is_an_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(recv_hello(&mut b).await.is_err());
    }
}
