//! Synchronous one-to-many notification channels.
//!
//! Subscribers are invoked on the publishing thread, in subscription order.
//! A panicking subscriber is logged and skipped; it never unwinds into the
//! publisher, which is usually an instrumented network call.

use crate::request::{RequestCompleteEvent, RequestStartEvent};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::warn;

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscribers<T> {
    next_id: u64,
    entries: Vec<(u64, Subscriber<T>)>,
}

/// A multi-subscriber notification channel.
///
/// Clones share the same subscriber list.
pub struct Observable<T> {
    inner: Arc<Mutex<Subscribers<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Observable<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers a subscriber. It stays registered until
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut subscribers = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.entries.push((id, Arc::new(f)));

        let weak: Weak<Mutex<Subscribers<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entries
                        .retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Delivers `event` to every current subscriber.
    pub fn notify(&self, event: &T) {
        // Snapshot so subscribers may (un)subscribe while being notified.
        let snapshot: Vec<Subscriber<T>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();

        for subscriber in snapshot {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                warn!("observable subscriber panicked; event skipped for this subscriber");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

/// Handle returned by [`Observable::subscribe`].
///
/// Dropping the handle keeps the subscriber registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// The start/complete channel pair published by request instrumentation.
#[derive(Clone, Default)]
pub struct RequestObservables {
    pub start: Observable<RequestStartEvent>,
    pub complete: Observable<RequestCompleteEvent>,
}

impl RequestObservables {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_all_subscribers_notified_in_order() {
        let observable = Observable::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let seen = Arc::clone(&seen);
            let _ = observable.subscribe(move |value: &u32| {
                seen.lock().unwrap().push((tag, *value));
            });
        }

        observable.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let observable = Observable::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let subscription = observable.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observable.notify(&1);
        subscription.unsubscribe();
        observable.notify(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(observable.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let observable = Observable::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _ = observable.subscribe(|_| panic!("subscriber fault"));
        let counter = Arc::clone(&count);
        let _ = observable.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observable.notify(&1);
        observable.notify(&2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let observable = Observable::<u32>::new();
        let clone = observable.clone();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let _ = clone.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observable.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
