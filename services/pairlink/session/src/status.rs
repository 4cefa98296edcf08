//! Status fan-out to the UI collaborator.
//!
//! The publisher holds at most one subscriber per channel (connectivity,
//! errors, retry status). There is no buffering: a subscriber registered late
//! misses earlier events. A panicking subscriber is logged and otherwise
//! ignored so publishing can never take the session down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{trace, warn};

/// Reconnect progress as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStatus {
    /// Retry attempts made for the current outage
    pub attempt: u32,
    /// Milliseconds until the next attempt, when one is pending
    pub next_retry_ms: Option<u64>,
    /// Whether the reconnect cycle is running (a retry pending or an attempt
    /// waiting for the peer)
    pub retrying: bool,
}

impl RetryStatus {
    /// Status reported when no retry is pending
    pub fn idle(attempt: u32) -> Self {
        Self {
            attempt,
            next_retry_ms: None,
            retrying: false,
        }
    }

    /// Status reported while a reopened channel waits for the peer
    pub fn awaiting_peer(attempt: u32) -> Self {
        Self {
            attempt,
            next_retry_ms: None,
            retrying: true,
        }
    }
}

type Subscriber<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Single-subscriber-per-channel status fan-out
#[derive(Default)]
pub struct StatusPublisher {
    connectivity: Mutex<Option<Subscriber<bool>>>,
    errors: Mutex<Option<Subscriber<String>>>,
    retry: Mutex<Option<Subscriber<RetryStatus>>>,
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher").finish_non_exhaustive()
    }
}

impl StatusPublisher {
    /// Create a publisher with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the connectivity subscriber
    pub fn on_connectivity(&self, subscriber: impl Fn(bool) + Send + Sync + 'static) {
        replace(&self.connectivity, Some(Arc::new(subscriber)));
    }

    /// Replace the error subscriber
    pub fn on_error(&self, subscriber: impl Fn(String) + Send + Sync + 'static) {
        replace(&self.errors, Some(Arc::new(subscriber)));
    }

    /// Replace the retry-status subscriber
    pub fn on_retry_status(&self, subscriber: impl Fn(RetryStatus) + Send + Sync + 'static) {
        replace(&self.retry, Some(Arc::new(subscriber)));
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        replace(&self.connectivity, None);
        replace(&self.errors, None);
        replace(&self.retry, None);
    }

    /// Announce a connectivity change
    pub fn connectivity(&self, connected: bool) {
        deliver(&self.connectivity, "connectivity", connected);
    }

    /// Announce an error message
    pub fn error(&self, message: String) {
        deliver(&self.errors, "error", message);
    }

    /// Announce retry progress
    pub fn retry_status(&self, status: RetryStatus) {
        deliver(&self.retry, "retry", status);
    }
}

fn replace<T>(slot: &Mutex<Option<Subscriber<T>>>, subscriber: Option<Subscriber<T>>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = subscriber;
}

fn deliver<T>(slot: &Mutex<Option<Subscriber<T>>>, channel: &str, value: T) {
    // Clone out of the lock so a subscriber may re-subscribe from its callback
    let subscriber = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
    let Some(subscriber) = subscriber else {
        trace!("No {} subscriber", channel);
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| subscriber(value))).is_err() {
        warn!("{} subscriber panicked; event dropped", channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_late_subscriber_misses_events() {
        let publisher = StatusPublisher::new();
        publisher.connectivity(true);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        publisher.on_connectivity(move |up| sink.lock().unwrap().push(up));

        publisher.connectivity(false);
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_single_subscriber_is_replaced() {
        let publisher = StatusPublisher::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let counter = first.clone();
        publisher.on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        publisher.on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        publisher.error("boom".to_string());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        publisher.clear();
        publisher.error("ignored".to_string());
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let publisher = StatusPublisher::new();
        publisher.on_retry_status(|_| panic!("subscriber bug"));
        publisher.retry_status(RetryStatus::idle(0));

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        publisher.on_retry_status(move |status| *sink.lock().unwrap() = Some(status));
        publisher.retry_status(RetryStatus {
            attempt: 2,
            next_retry_ms: Some(1500),
            retrying: true,
        });
        assert_eq!(seen.lock().unwrap().unwrap().next_retry_ms, Some(1500));
    }
}
