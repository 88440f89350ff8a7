//! Outbound packets and write-progress attribution.
//!
//! A [`Packet`] is the concatenation of resolved messages written to a
//! connection as one unit. The I/O engine reports cumulative progress one or
//! more times; [`Packet::on_write_progress`] turns each report into the
//! terminal deliveries of every message it newly covers.

use bytes::{Bytes, BytesMut};
use link_wire::{encode_message, padding_for, PresentationKind, WireError, WirePresentation};
use tracing::{trace, warn};

use crate::error::TransportError;
use crate::pending::PendingRef;

/// Terminal outcome of one message inside a packet
#[derive(Debug)]
pub enum Delivery {
    /// Fully written
    Sent(PendingRef),
    /// Fully written, and its bulk payload now has to be streamed as chunks
    StartBulk(PendingRef),
    /// Not fully written
    Failed(PendingRef, TransportError),
}

#[derive(Debug)]
struct Entry {
    msg: PendingRef,
    start: usize,
    end: usize,
}

/// One batch of resolved messages in a single buffer
#[derive(Debug)]
pub struct Packet {
    bytes: Bytes,
    entries: Vec<Entry>,
    multiplexed: bool,
    acked: usize,
    next: usize,
}

impl Packet {
    /// Resolve `control` then `picked` against `presentation` into one buffer.
    ///
    /// Multiplexed packets are padded to a multiple of `pad_boundary` with
    /// filler messages. Messages that cannot be encoded are returned beside
    /// the packet and are not part of it.
    pub fn build(
        control: Vec<PendingRef>,
        picked: Vec<PendingRef>,
        presentation: &dyn WirePresentation,
        pad_boundary: usize,
    ) -> (Packet, Vec<(PendingRef, WireError)>) {
        let multiplexed = presentation.kind() == PresentationKind::Multiplexed;
        let mut buf = BytesMut::new();
        let mut entries = Vec::with_capacity(control.len() + picked.len());
        let mut rejected = Vec::new();

        for msg in control.into_iter().chain(picked) {
            match msg.resolve(presentation) {
                Ok(bytes) => {
                    let start = buf.len();
                    buf.extend_from_slice(&bytes);
                    entries.push(Entry {
                        msg,
                        start,
                        end: buf.len(),
                    });
                }
                Err(err) => rejected.push((msg, err)),
            }
        }

        if multiplexed && !entries.is_empty() {
            for padding in padding_for(buf.len(), pad_boundary, presentation.max_body()) {
                if let Err(err) = encode_message(&padding, &mut buf) {
                    warn!(%err, "skipping packet padding");
                    break;
                }
            }
        }

        trace!(
            messages = entries.len(),
            bytes = buf.len(),
            multiplexed,
            "built packet"
        );
        (
            Packet {
                bytes: buf.freeze(),
                entries,
                multiplexed,
                acked: 0,
                next: 0,
            },
            rejected,
        )
    }

    /// The bytes to write
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Total packet length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the packet carries no message
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of messages
    pub fn message_count(&self) -> usize {
        self.entries.len()
    }

    /// Bytes acknowledged so far
    pub fn acked(&self) -> usize {
        self.acked
    }

    /// Whether every byte has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.acked == self.bytes.len()
    }

    /// Attribute cumulative write progress to the messages.
    ///
    /// `acked` counts bytes of this packet written so far. Every message
    /// that ends at or before `acked` is delivered exactly once. When
    /// `finished` is set the write is over: a message only partly covered
    /// fails with the number of its bytes that made it, and so does every
    /// message behind it.
    pub fn on_write_progress(&mut self, acked: usize, finished: bool) -> Vec<Delivery> {
        let mut acked = acked;
        if acked < self.acked {
            warn!(acked, previous = self.acked, "write progress went backwards");
            acked = self.acked;
        }
        if acked > self.bytes.len() {
            warn!(acked, len = self.bytes.len(), "write progress past packet end");
            acked = self.bytes.len();
        }
        self.acked = acked;

        let mut deliveries = Vec::new();
        while let Some(entry) = self.entries.get(self.next) {
            if entry.end <= acked {
                let msg = entry.msg.clone();
                if self.multiplexed && msg.carries_bulk() {
                    deliveries.push(Delivery::StartBulk(msg));
                } else {
                    deliveries.push(Delivery::Sent(msg));
                }
                self.next += 1;
                continue;
            }
            if finished {
                let total = entry.end - entry.start;
                let sent = acked.saturating_sub(entry.start);
                deliveries.push(Delivery::Failed(
                    entry.msg.clone(),
                    TransportError::Truncated { sent, total },
                ));
                self.next += 1;
                continue;
            }
            break;
        }
        deliveries
    }

    /// Fail every message not yet delivered
    pub fn fail_remaining(&mut self, error: TransportError) -> Vec<Delivery> {
        let rest = self.entries[self.next..]
            .iter()
            .map(|entry| Delivery::Failed(entry.msg.clone(), error.clone()))
            .collect();
        self.next = self.entries.len();
        rest
    }

    /// Whether every message has had its delivery produced
    pub fn is_settled(&self) -> bool {
        self.next == self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::OnComplete;
    use crate::pending::{MessageId, PendingMessage, Priority};
    use link_wire::{AppMessage, LegacyPresentation, Message, MuxPresentation, FRAME_HEADER_LEN};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn sized(wire_len: usize) -> PendingRef {
        let body = vec![1u8; wire_len - FRAME_HEADER_LEN - 9];
        Arc::new(PendingMessage::new(
            MessageId::next(),
            Message::Application(AppMessage {
                corr_id: 9,
                request: false,
                body: Bytes::from(body),
                bulk: None,
            }),
            Priority::Request,
            Instant::now() + Duration::from_secs(60),
            OnComplete::None,
        ))
    }

    fn describe(deliveries: &[Delivery]) -> Vec<String> {
        deliveries
            .iter()
            .map(|d| match d {
                Delivery::Sent(m) => format!("sent {}", m.id()),
                Delivery::StartBulk(m) => format!("bulk {}", m.id()),
                Delivery::Failed(m, err) => format!("failed {}: {err}", m.id()),
            })
            .collect()
    }

    #[test]
    fn test_finished_mid_message_fails_the_rest() {
        let a = sized(1000);
        let b = sized(1000);
        let (mut packet, rejected) =
            Packet::build(vec![], vec![a.clone(), b.clone()], &MuxPresentation::default(), 0);
        assert!(rejected.is_empty());
        assert_eq!(packet.len(), 2000);

        let deliveries = packet.on_write_progress(1500, true);
        assert_eq!(
            describe(&deliveries),
            vec![
                format!("sent {}", a.id()),
                format!("failed {}: sent 500 of 1000 bytes", b.id()),
            ]
        );
        assert!(packet.is_settled());
        assert!(packet.on_write_progress(2000, true).is_empty());
    }

    #[test]
    fn test_partial_progress_spanning_messages() {
        let msgs: Vec<_> = (0..3).map(|_| sized(100)).collect();
        let (mut packet, _) = Packet::build(vec![], msgs.clone(), &MuxPresentation::default(), 0);

        assert!(packet.on_write_progress(99, false).is_empty());
        assert_eq!(packet.on_write_progress(250, false).len(), 2);
        // repeated report adds nothing
        assert!(packet.on_write_progress(250, false).is_empty());
        let last = packet.on_write_progress(300, true);
        assert_eq!(describe(&last), vec![format!("sent {}", msgs[2].id())]);
        assert!(packet.is_complete());
    }

    #[test]
    fn test_every_message_delivered_once_for_any_split() {
        let lens = [40usize, 300, 17, 999, 64];
        for step in [1usize, 7, 100, 5000] {
            let msgs: Vec<_> = lens.iter().map(|l| sized(*l)).collect();
            let (mut packet, _) =
                Packet::build(vec![], msgs.clone(), &MuxPresentation::default(), 0);
            let mut seen = Vec::new();
            let mut acked = 0;
            while acked < packet.len() {
                acked = (acked + step).min(packet.len());
                let finished = acked == packet.len();
                for delivery in packet.on_write_progress(acked, finished) {
                    match delivery {
                        Delivery::Sent(m) => seen.push(m.id()),
                        other => panic!("unexpected {other:?}"),
                    }
                }
            }
            assert_eq!(seen, msgs.iter().map(|m| m.id()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_padding_to_boundary() {
        let (packet, _) = Packet::build(vec![], vec![sized(100)], &MuxPresentation::default(), 64);
        assert_eq!(packet.len(), 128);
        let (packet, _) = Packet::build(vec![], vec![sized(100)], &LegacyPresentation::default(), 64);
        // legacy packets are never padded
        assert_eq!(packet.len(), 107);
    }

    #[test]
    fn test_control_goes_first_and_fail_remaining() {
        let control = PendingMessage::control(
            Message::FlowCredit {
                transfer_id: 1,
                credit: 10,
            },
            Duration::from_secs(1),
        );
        let data = sized(100);
        let (mut packet, _) = Packet::build(
            vec![control.clone()],
            vec![data.clone()],
            &MuxPresentation::default(),
            0,
        );
        let first = packet.on_write_progress(10, false);
        assert_eq!(describe(&first), vec![format!("sent {}", control.id())]);

        let failed = packet.fail_remaining(TransportError::ConnectionClosed("reset".into()));
        assert_eq!(
            describe(&failed),
            vec![format!("failed {}: connection closed: reset", data.id())]
        );
    }
}
