//! Transfer completion events
//!
//! An asynchronous copy returns a [`TransferEvent`] immediately. The caller
//! must not assume the bytes have landed until the event reports completion.
//! Events are cheaply cloneable and can be waited on from any thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct EventInner {
    done: Mutex<bool>,
    cv: Condvar,
}

/// Completion token for an in-flight transfer
///
/// # Example
/// ```
/// use jitmem_transport::TransferEvent;
///
/// let event = TransferEvent::pending();
/// assert!(!event.is_complete());
/// event.complete();
/// event.wait();
/// assert!(event.is_complete());
/// ```
#[derive(Clone)]
pub struct TransferEvent {
    inner: Arc<EventInner>,
}

impl TransferEvent {
    /// Create an event that has not yet completed
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(EventInner { done: Mutex::new(false), cv: Condvar::new() }),
        }
    }

    /// Create an already-completed event
    ///
    /// Used by transports that perform "asynchronous" copies eagerly, such as
    /// [`MirrorTransport`](crate::MirrorTransport).
    pub fn completed() -> Self {
        let event = Self::pending();
        event.complete();
        event
    }

    /// Mark the transfer as complete, waking all waiters
    pub fn complete(&self) {
        let mut done = self.inner.done.lock();
        *done = true;
        self.inner.cv.notify_all();
    }

    /// Check completion without blocking
    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Block until the transfer completes
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cv.wait(&mut done);
        }
    }

    /// Block until the transfer completes or the timeout elapses
    ///
    /// Returns `true` if the transfer completed within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock();
        if *done {
            return true;
        }
        self.inner.cv.wait_for(&mut done, timeout);
        *done
    }
}

impl std::fmt::Debug for TransferEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEvent")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pending_then_complete() {
        let event = TransferEvent::pending();
        assert!(!event.is_complete());
        event.complete();
        assert!(event.is_complete());
    }

    #[test]
    fn test_completed_constructor() {
        let event = TransferEvent::completed();
        assert!(event.is_complete());
        event.wait(); // must not block
    }

    #[test]
    fn test_wait_across_threads() {
        let event = TransferEvent::pending();
        let waiter = event.clone();

        let handle = thread::spawn(move || {
            waiter.wait();
            waiter.is_complete()
        });

        thread::sleep(Duration::from_millis(20));
        event.complete();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = TransferEvent::pending();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        event.complete();
        assert!(event.wait_timeout(Duration::from_millis(10)));
    }
}
