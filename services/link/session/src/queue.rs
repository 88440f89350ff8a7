//! Per-peer priority queue of pending messages.
//!
//! Messages wait in one FIFO bucket per [`Priority`]. A connection asking for
//! work takes a batch with [`MessageQueue::pick_for_packet`] under the queue
//! lock. Failures discovered while holding the lock (expiry, unencodable
//! messages) are handed to the [`ExpiryWorker`] so no completion callback ever
//! runs with the queue locked.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use link_wire::WirePresentation;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::pending::{MessageId, PendingRef, Priority};

enum ExpiryJob {
    Fail(PendingRef, TransportError),
    Stop,
}

/// Sends failed messages to the expiry worker
#[derive(Clone, Debug)]
pub struct ExpiryHandle {
    tx: mpsc::UnboundedSender<ExpiryJob>,
}

impl std::fmt::Debug for ExpiryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpiryJob::Fail(msg, err) => write!(f, "Fail({}, {err})", msg.id()),
            ExpiryJob::Stop => f.write_str("Stop"),
        }
    }
}

impl ExpiryHandle {
    /// Fail `msg` with `error` on the worker thread
    pub fn fail(&self, msg: PendingRef, error: TransportError) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(ExpiryJob::Fail(msg, error)) {
            // worker already gone, nothing left to protect against
            if let ExpiryJob::Fail(msg, error) = job {
                warn!(msg_id = %msg.id(), "expiry worker stopped, notifying inline");
                msg.notify(Err(error));
            }
        }
    }
}

/// Dedicated thread that delivers expiry and rejection failures
#[derive(Debug)]
pub struct ExpiryWorker {
    tx: mpsc::UnboundedSender<ExpiryJob>,
    thread: Option<JoinHandle<()>>,
}

impl ExpiryWorker {
    /// Start the worker thread
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name("link-expiry".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    match job {
                        ExpiryJob::Fail(msg, error) => {
                            trace!(msg_id = %msg.id(), %error, "delivering queued failure");
                            msg.notify(Err(error));
                        }
                        ExpiryJob::Stop => break,
                    }
                }
                debug!("expiry worker exiting");
            })?;
        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    /// Handle for queues to submit failures
    pub fn handle(&self) -> ExpiryHandle {
        ExpiryHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop the worker after it delivered everything already submitted
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(ExpiryJob::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("expiry worker panicked");
            }
        }
    }
}

impl Drop for ExpiryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
struct Buckets {
    by_priority: [VecDeque<PendingRef>; 3],
}

impl Buckets {
    fn len(&self) -> usize {
        self.by_priority.iter().map(VecDeque::len).sum()
    }
}

/// Priority-bucketed queue of pending messages
#[derive(Debug)]
pub struct MessageQueue {
    buckets: Mutex<Buckets>,
    expiry: ExpiryHandle,
}

impl MessageQueue {
    /// Create an empty queue that reports failures through `expiry`
    pub fn new(expiry: ExpiryHandle) -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            expiry,
        }
    }

    /// Append to the bucket of the message's priority
    pub fn enqueue(&self, msg: PendingRef) {
        let mut buckets = self.buckets.lock();
        trace!(msg_id = %msg.id(), priority = ?msg.priority(), "enqueue");
        buckets.by_priority[msg.priority().index()].push_back(msg);
    }

    /// Put messages back at the front of their buckets, keeping their order
    pub fn push_front_all(&self, msgs: Vec<PendingRef>) {
        let mut buckets = self.buckets.lock();
        for msg in msgs.into_iter().rev() {
            buckets.by_priority[msg.priority().index()].push_front(msg);
        }
    }

    /// Take the next batch of messages for one packet.
    ///
    /// Buckets are drained highest priority first. The batch stops before the
    /// message that would push it over `max_bytes`, but always holds at least
    /// one message. Unless `multiplexed`, it also stops right after a message
    /// carrying inline bulk data. Messages for which `eligible` is false are
    /// skipped and stay queued in their original order. Messages past their
    /// expiry are never picked; they go to the expiry worker instead.
    pub fn pick_for_packet<F>(
        &self,
        max_bytes: usize,
        multiplexed: bool,
        presentation: &dyn WirePresentation,
        mut eligible: F,
    ) -> Vec<PendingRef>
    where
        F: FnMut(&PendingRef) -> bool,
    {
        let mut buckets = self.buckets.lock();
        let mut picked = Vec::new();
        let mut total = 0usize;
        let mut skipped: [Vec<PendingRef>; 3] = Default::default();
        let now = Instant::now();

        'buckets: for priority in Priority::ALL {
            let bucket = &mut buckets.by_priority[priority.index()];
            while let Some(msg) = bucket.pop_front() {
                if msg.is_done() {
                    continue;
                }
                if msg.is_expired(now) {
                    trace!(msg_id = %msg.id(), "expired before it was picked");
                    self.expiry.fail(msg, TransportError::Expired);
                    continue;
                }
                if !eligible(&msg) {
                    skipped[priority.index()].push(msg);
                    continue;
                }
                let len = match msg.wire_len(presentation) {
                    Ok(len) => len,
                    Err(err) => {
                        warn!(msg_id = %msg.id(), %err, "dropping unencodable message");
                        self.expiry.fail(msg, err.into());
                        continue;
                    }
                };
                if !picked.is_empty() && total + len > max_bytes {
                    bucket.push_front(msg);
                    break 'buckets;
                }
                total += len;
                let stop = !multiplexed && msg.carries_bulk();
                picked.push(msg);
                if stop {
                    break 'buckets;
                }
            }
        }

        for (index, skipped) in skipped.into_iter().enumerate() {
            for msg in skipped.into_iter().rev() {
                buckets.by_priority[index].push_front(msg);
            }
        }

        trace!(picked = picked.len(), bytes = total, "picked for packet");
        picked
    }

    /// Remove a queued message by id
    pub fn remove(&self, id: MessageId) -> Option<PendingRef> {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.by_priority.iter_mut() {
            if let Some(pos) = bucket.iter().position(|m| m.id() == id) {
                return bucket.remove(pos);
            }
        }
        None
    }

    /// Hand every expired message to the expiry worker. Returns how many.
    pub fn expire_all(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        {
            let mut buckets = self.buckets.lock();
            for bucket in buckets.by_priority.iter_mut() {
                bucket.retain(|msg| {
                    if msg.is_expired(now) {
                        expired.push(msg.clone());
                        false
                    } else {
                        true
                    }
                });
            }
        }
        let count = expired.len();
        for msg in expired {
            self.expiry.fail(msg, TransportError::Expired);
        }
        if count > 0 {
            debug!(count, "expired queued messages");
        }
        count
    }

    /// Take everything out of the queue
    pub fn drain(&self) -> Vec<PendingRef> {
        let mut buckets = self.buckets.lock();
        buckets
            .by_priority
            .iter_mut()
            .flat_map(|bucket| bucket.drain(..))
            .collect()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{Completion, OnComplete};
    use crate::pending::PendingMessage;
    use bytes::Bytes;
    use link_wire::{AppMessage, LegacyPresentation, Message, MuxPresentation, FRAME_HEADER_LEN};
    use std::sync::Arc;
    use std::time::Duration;

    // app message whose multiplexed encoding is exactly `wire_len` bytes
    fn sized(priority: Priority, wire_len: usize, request: bool) -> PendingRef {
        let body = vec![0u8; wire_len - FRAME_HEADER_LEN - 9];
        let message = Message::Application(AppMessage {
            corr_id: 1,
            request,
            body: Bytes::from(body),
            bulk: None,
        });
        Arc::new(PendingMessage::new(
            MessageId::next(),
            message,
            priority,
            Instant::now() + Duration::from_secs(60),
            OnComplete::None,
        ))
    }

    fn queue() -> (ExpiryWorker, MessageQueue) {
        let worker = ExpiryWorker::spawn().unwrap();
        let queue = MessageQueue::new(worker.handle());
        (worker, queue)
    }

    fn ids(msgs: &[PendingRef]) -> Vec<MessageId> {
        msgs.iter().map(|m| m.id()).collect()
    }

    #[test]
    fn test_pick_respects_priority_and_cap() {
        let (_worker, queue) = queue();
        let mux = MuxPresentation::default();
        let low1 = sized(Priority::BulkChunk, 400, false);
        let high = sized(Priority::Control, 400, false);
        let low2 = sized(Priority::BulkChunk, 400, false);
        queue.enqueue(low1.clone());
        queue.enqueue(high.clone());
        queue.enqueue(low2.clone());

        let picked = queue.pick_for_packet(1000, true, &mux, |_| true);
        assert_eq!(ids(&picked), vec![high.id(), low1.id()]);
        assert_eq!(queue.len(), 1);

        let rest = queue.pick_for_packet(1000, true, &mux, |_| true);
        assert_eq!(ids(&rest), vec![low2.id()]);
    }

    #[test]
    fn test_oversized_singleton_is_still_picked() {
        let (_worker, queue) = queue();
        let mux = MuxPresentation::default();
        let big = sized(Priority::Request, 5000, false);
        let small = sized(Priority::Request, 100, false);
        queue.enqueue(big.clone());
        queue.enqueue(small.clone());

        let picked = queue.pick_for_packet(1000, true, &mux, |_| true);
        assert_eq!(ids(&picked), vec![big.id()]);
        assert_eq!(ids(&queue.pick_for_packet(1000, true, &mux, |_| true)), vec![small.id()]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let (_worker, queue) = queue();
        let mux = MuxPresentation::default();
        let msgs: Vec<_> = (0..5).map(|_| sized(Priority::Request, 50, false)).collect();
        for msg in &msgs {
            queue.enqueue(msg.clone());
        }
        let picked = queue.pick_for_packet(10_000, true, &mux, |_| true);
        assert_eq!(ids(&picked), ids(&msgs));
    }

    #[test]
    fn test_ineligible_messages_keep_their_place() {
        let (_worker, queue) = queue();
        let mux = MuxPresentation::default();
        let req1 = sized(Priority::Request, 50, true);
        let reply = sized(Priority::Request, 50, false);
        let req2 = sized(Priority::Request, 50, true);
        for msg in [&req1, &reply, &req2] {
            queue.enqueue(msg.clone());
        }

        let picked = queue.pick_for_packet(10_000, true, &mux, |m| !m.is_request());
        assert_eq!(ids(&picked), vec![reply.id()]);

        let later = queue.pick_for_packet(10_000, true, &mux, |_| true);
        assert_eq!(ids(&later), vec![req1.id(), req2.id()]);
    }

    #[test]
    fn test_legacy_stops_after_inline_bulk() {
        let (_worker, queue) = queue();
        let legacy = LegacyPresentation::default();
        let first = sized(Priority::Request, 50, false);
        let message = Message::Application(AppMessage {
            corr_id: 2,
            request: false,
            body: Bytes::new(),
            bulk: Some(link_wire::BulkHeader {
                transfer_id: 0,
                length: 10,
            }),
        });
        let with_bulk = Arc::new(
            PendingMessage::new(
                MessageId::next(),
                message,
                Priority::Request,
                Instant::now() + Duration::from_secs(60),
                OnComplete::None,
            )
            .with_bulk(Bytes::from_static(b"0123456789")),
        );
        let after = sized(Priority::Request, 50, false);
        for msg in [&first, &with_bulk, &after] {
            queue.enqueue(msg.clone());
        }

        let picked = queue.pick_for_packet(10_000, false, &legacy, |_| true);
        assert_eq!(ids(&picked), vec![first.id(), with_bulk.id()]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_expired_messages_are_not_picked() {
        let (_worker, queue) = queue();
        let mux = MuxPresentation::default();
        let done = Arc::new(Completion::new());
        let stale = Arc::new(PendingMessage::new(
            MessageId::next(),
            Message::Goodbye { reason: 0 },
            Priority::Control,
            Instant::now(),
            OnComplete::Completion(done.clone()),
        ));
        let fresh = sized(Priority::Request, 50, false);
        queue.enqueue(stale);
        queue.enqueue(fresh.clone());

        let picked = queue.pick_for_packet(10_000, true, &mux, |_| true);
        assert_eq!(ids(&picked), vec![fresh.id()]);
        assert!(queue.is_empty());
        assert_eq!(
            done.wait_timeout(Duration::from_secs(5)),
            Some(Err(TransportError::Expired))
        );
    }

    #[test]
    fn test_remove_and_expire() {
        let (_worker, queue) = queue();
        let keep = sized(Priority::Request, 50, false);
        let done = Arc::new(Completion::new());
        let stale = Arc::new(PendingMessage::new(
            MessageId::next(),
            Message::Goodbye { reason: 0 },
            Priority::Control,
            Instant::now(),
            OnComplete::Completion(done.clone()),
        ));
        let cancelled = sized(Priority::Request, 50, false);
        queue.enqueue(keep.clone());
        queue.enqueue(stale);
        queue.enqueue(cancelled.clone());

        assert_eq!(queue.remove(cancelled.id()).map(|m| m.id()), Some(cancelled.id()));
        assert!(queue.remove(cancelled.id()).is_none());

        assert_eq!(queue.expire_all(Instant::now()), 1);
        assert_eq!(
            done.wait_timeout(Duration::from_secs(5)),
            Some(Err(TransportError::Expired))
        );
        assert_eq!(ids(&queue.drain()), vec![keep.id()]);
        assert!(queue.is_empty());
    }
}
