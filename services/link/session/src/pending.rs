//! Units of outbound work.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use link_wire::{Message, PresentationKind, WirePresentation, WireError};
use parking_lot::Mutex;

use crate::completion::{OnComplete, OnceNotifier};
use crate::error::SendResult;

/// Shared handle to a pending message
pub type PendingRef = Arc<PendingMessage>;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one logical send, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Send priority, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Flow credit, rate announcements, transfer kills
    Control = 0,
    /// Application traffic
    Request = 1,
    /// Chunks of multiplexed bulk transfers
    BulkChunk = 2,
}

impl Priority {
    /// Every class, highest first
    pub const ALL: [Priority; 3] = [Priority::Control, Priority::Request, Priority::BulkChunk];

    /// Bucket index
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
struct Resolved {
    kind: PresentationKind,
    bytes: Bytes,
}

/// A message waiting to be sent, together with whoever waits for its outcome
pub struct PendingMessage {
    id: MessageId,
    message: Message,
    bulk: Option<Bytes>,
    priority: Priority,
    expires_at: Instant,
    resolved: Mutex<Option<Resolved>>,
    notifier: OnceNotifier,
}

impl PendingMessage {
    /// Wrap a message
    pub fn new(
        id: MessageId,
        message: Message,
        priority: Priority,
        expires_at: Instant,
        on_complete: OnComplete,
    ) -> Self {
        Self {
            id,
            message,
            bulk: None,
            priority,
            expires_at,
            resolved: Mutex::new(None),
            notifier: OnceNotifier::new(on_complete),
        }
    }

    /// Attach the bulk payload announced by the message's bulk header
    pub fn with_bulk(mut self, data: Bytes) -> Self {
        self.bulk = Some(data);
        self
    }

    /// A fire-and-forget control message
    pub fn control(message: Message, ttl: Duration) -> PendingRef {
        Arc::new(Self::new(
            MessageId::next(),
            message,
            Priority::Control,
            Instant::now() + ttl,
            OnComplete::None,
        ))
    }

    /// Identity
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The logical message
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Priority class
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether request gating applies
    pub fn is_request(&self) -> bool {
        self.message.is_request()
    }

    /// Whether a bulk payload rides along with this message
    pub fn carries_bulk(&self) -> bool {
        self.bulk.is_some()
    }

    /// The bulk payload, if any
    pub fn bulk(&self) -> Option<&Bytes> {
        self.bulk.as_ref()
    }

    /// Absolute expiry
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the message has outlived its expiry
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Byte form of the message for `presentation`.
    ///
    /// Inline presentations include the bulk payload after the message. The
    /// result is cached per presentation kind.
    pub fn resolve(&self, presentation: &dyn WirePresentation) -> Result<Bytes, WireError> {
        let mut cache = self.resolved.lock();
        if let Some(resolved) = cache.as_ref() {
            if resolved.kind == presentation.kind() {
                return Ok(resolved.bytes.clone());
            }
        }

        let inline = if presentation.inline_bulk() {
            self.bulk.as_ref()
        } else {
            None
        };
        let mut buf = BytesMut::with_capacity(
            presentation.encoded_len(&self.message) + inline.map_or(0, |b| b.len()),
        );
        presentation.encode(&self.message, &mut buf)?;
        if let Some(data) = inline {
            buf.extend_from_slice(data);
        }

        let bytes = buf.freeze();
        *cache = Some(Resolved {
            kind: presentation.kind(),
            bytes: bytes.clone(),
        });
        Ok(bytes)
    }

    /// Final wire length for `presentation`
    pub fn wire_len(&self, presentation: &dyn WirePresentation) -> Result<usize, WireError> {
        self.resolve(presentation).map(|b| b.len())
    }

    /// Report the outcome. Returns false if it was already reported.
    pub fn notify(&self, result: SendResult) -> bool {
        self.notifier.notify(result)
    }

    /// Whether the outcome has been reported
    pub fn is_done(&self) -> bool {
        self.notifier.is_notified()
    }
}

impl fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMessage")
            .field("id", &self.id)
            .field("type", &self.message.message_type())
            .field("priority", &self.priority)
            .field("bulk", &self.bulk.as_ref().map(|b| b.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_wire::{AppMessage, BulkHeader, LegacyPresentation, MuxPresentation};

    fn with_trailer() -> PendingMessage {
        let message = Message::Application(AppMessage {
            corr_id: 3,
            request: false,
            body: Bytes::from_static(b"file"),
            bulk: Some(BulkHeader {
                transfer_id: 0,
                length: 100,
            }),
        });
        PendingMessage::new(
            MessageId::next(),
            message,
            Priority::Request,
            Instant::now() + Duration::from_secs(1),
            OnComplete::None,
        )
        .with_bulk(Bytes::from(vec![9u8; 100]))
    }

    #[test]
    fn test_legacy_resolution_includes_trailer() {
        let pending = with_trailer();
        let legacy = LegacyPresentation::default();
        let mux = MuxPresentation::default();

        let inline = pending.wire_len(&legacy).unwrap();
        let framed = pending.wire_len(&mux).unwrap();
        assert_eq!(inline, legacy.encoded_len(pending.message()) + 100);
        assert_eq!(framed, mux.encoded_len(pending.message()));
        // cache follows the presentation asked for
        assert_eq!(pending.wire_len(&legacy).unwrap(), inline);
    }

    #[test]
    fn test_priorities_order_highest_first() {
        assert!(Priority::Control < Priority::Request);
        assert!(Priority::Request < Priority::BulkChunk);
        assert_eq!(
            Priority::ALL.map(Priority::index),
            [0, 1, 2]
        );
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = MessageId::next();
        let b = MessageId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
