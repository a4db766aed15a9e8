//! Reactive value containers for application code layered on top of streams.
//!
//! A [`Writable`] holds one value and notifies every subscriber whenever the
//! value is replaced. Subscribers are invoked once immediately with the current
//! value, then on every change, until their [`Subscription`] is dropped or
//! cancelled.
//!
//! Callbacks run synchronously on the thread calling [`Writable::set`], after
//! the internal lock has been released, so a callback may freely read or even
//! write the same container.
//!
//! ```rust
//! use store::Writable;
//! use std::sync::{Arc, Mutex};
//!
//! let room = Writable::new(Vec::<String>::new());
//! let seen = Arc::new(Mutex::new(0));
//! let counter = Arc::clone(&seen);
//! let subscription = room.subscribe(move |users| {
//!     *counter.lock().unwrap() = users.len();
//! });
//!
//! room.update(|users| users.push("tabby".to_string()));
//! assert_eq!(*seen.lock().unwrap(), 1);
//! subscription.cancel();
//! ```

use log::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: T,
    subscribers: Vec<(u64, Callback<T>)>,
}

/// A shareable value with change notification. Cloning yields another handle
/// to the same value.
pub struct Writable<T> {
    inner: Arc<Mutex<Inner<T>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Writable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Writable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value,
                subscribers: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        let (snapshot, subscribers) = {
            let mut inner = self.lock();
            inner.value = value;
            (inner.value.clone(), Self::callbacks(&inner))
        };
        Self::notify(&snapshot, &subscribers);
    }

    /// Mutate the value in place and notify subscribers.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        let (snapshot, subscribers) = {
            let mut inner = self.lock();
            f(&mut inner.value);
            (inner.value.clone(), Self::callbacks(&inner))
        };
        Self::notify(&snapshot, &subscribers);
    }

    /// Register `callback`, calling it right away with the current value.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        let snapshot = {
            let mut inner = self.lock();
            inner.subscribers.push((id, Arc::clone(&callback)));
            inner.value.clone()
        };
        callback(&snapshot);

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.subscribers.retain(|(sub_id, _)| *sub_id != id);
                }
            })),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // A panicking subscriber never runs under the lock, so poisoning only
        // means some caller panicked mid-update; the value is still usable.
        self.inner.lock().unwrap_or_else(|e| {
            warn!("Writable lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn callbacks(inner: &Inner<T>) -> Vec<Callback<T>> {
        inner
            .subscribers
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    fn notify(value: &T, subscribers: &[Callback<T>]) {
        for callback in subscribers {
            callback(value);
        }
    }
}

/// Handle returned by [`Writable::subscribe`]. The callback stays registered
/// until this is dropped or [`Subscription::cancel`] is called.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn cancel(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_receives_current_value_then_changes() {
        let store = Writable::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(move |v| sink.lock().unwrap().push(*v));

        store.set(2);
        store.update(|v| *v += 1);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(store.get(), 3);
    }

    #[test]
    fn test_dropping_subscription_stops_notifications() {
        let store = Writable::new(String::new());
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let sub = store.subscribe(move |_| *sink.lock().unwrap() += 1);
        assert_eq!(store.subscriber_count(), 1);

        drop(sub);
        store.set("after".to_string());

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_write_to_the_same_store() {
        let store = Writable::new(0u32);
        let handle = store.clone();
        let _sub = store.subscribe(move |v| {
            if *v == 1 {
                handle.set(2);
            }
        });

        store.set(1);
        assert_eq!(store.get(), 2);
    }

    #[test]
    fn test_subscription_outliving_store_is_harmless() {
        let store = Writable::new(0u8);
        let sub = store.subscribe(|_| {});
        drop(store);
        sub.cancel();
    }
}
