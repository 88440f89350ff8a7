//! One-shot completion signals.
//!
//! A [`Completion`] is a single-assignment slot a thread can block on with a
//! deadline. [`OnComplete`] is how a sender asks to be told about the outcome
//! of a send, and [`OnceNotifier`] guarantees that outcome is delivered at
//! most once no matter how many paths race to report it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::SendResult;

#[derive(Debug)]
enum Slot<T> {
    Empty,
    Ready(T),
    Taken,
}

/// Single-assignment value a thread can wait for
#[derive(Debug)]
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Create an unset completion
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            cond: Condvar::new(),
        }
    }

    /// Set the value. Returns false if a value was already set.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Ready(value);
        self.cond.notify_all();
        true
    }

    /// Whether a value has been set
    pub fn is_complete(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Empty)
    }

    /// Block until the value is set or `timeout` passes, then take it.
    ///
    /// Returns `None` on timeout or if another waiter already took the value.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Empty) {
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Some(value),
            Slot::Empty => {
                *slot = Slot::Empty;
                None
            }
            Slot::Taken => None,
        }
    }
}

/// How the originator of a send learns its outcome
#[derive(Default)]
pub enum OnComplete {
    /// Nobody is listening
    #[default]
    None,
    /// Invoke a callback
    Callback(Box<dyn FnOnce(SendResult) + Send>),
    /// Fill a completion someone may be blocked on
    Completion(Arc<Completion<SendResult>>),
}

impl OnComplete {
    /// Wrap a closure
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        OnComplete::Callback(Box::new(f))
    }

    /// Deliver the outcome
    pub fn fire(self, result: SendResult) {
        match self {
            OnComplete::None => {}
            OnComplete::Callback(f) => f(result),
            OnComplete::Completion(c) => {
                c.complete(result);
            }
        }
    }
}

impl fmt::Debug for OnComplete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnComplete::None => f.write_str("OnComplete::None"),
            OnComplete::Callback(_) => f.write_str("OnComplete::Callback(..)"),
            OnComplete::Completion(_) => f.write_str("OnComplete::Completion(..)"),
        }
    }
}

/// Delivers an [`OnComplete`] at most once
#[derive(Debug)]
pub struct OnceNotifier {
    target: Mutex<Option<OnComplete>>,
}

impl OnceNotifier {
    /// Wrap a target
    pub fn new(target: OnComplete) -> Self {
        Self {
            target: Mutex::new(Some(target)),
        }
    }

    /// Deliver `result` if nothing was delivered yet. Returns whether this
    /// call delivered it. The target runs without any lock held.
    pub fn notify(&self, result: SendResult) -> bool {
        let target = self.target.lock().take();
        match target {
            Some(target) => {
                target.fire(result);
                true
            }
            None => false,
        }
    }

    /// Whether the outcome was already delivered
    pub fn is_notified(&self) -> bool {
        self.target.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_wait_sees_value_from_other_thread() {
        let completion = Arc::new(Completion::new());
        let setter = completion.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.complete(7u32)
        });

        assert_eq!(completion.wait_timeout(Duration::from_secs(5)), Some(7));
        assert!(handle.join().unwrap());
        assert!(!completion.complete(8));
    }

    #[test]
    fn test_wait_times_out() {
        let completion: Completion<u32> = Completion::new();
        assert_eq!(completion.wait_timeout(Duration::from_millis(10)), None);
        assert!(!completion.is_complete());
        assert!(completion.complete(1));
        assert_eq!(completion.wait_timeout(Duration::from_millis(10)), Some(1));
        assert_eq!(completion.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_notifier_delivers_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let notifier = OnceNotifier::new(OnComplete::callback(move |result| {
            assert!(result.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(notifier.notify(Ok(())));
        assert!(!notifier.notify(Err(TransportError::Cancelled)));
        assert!(notifier.is_notified());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
