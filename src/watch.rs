use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{channel, Receiver, Sender},
    Arc, RwLock, Weak,
};
use std::thread;

use crate::store::FleetSnapshot;

/// Delivered to subscribers every time the store's revision advances. The
/// snapshot is immutable and safe to hold across renders.
#[derive(Clone, Debug)]
pub struct StoreUpdate {
    pub revision: u64,
    pub snapshot: FleetSnapshot,
}

struct Entry<E> {
    id: u64,
    tx: Sender<E>,
}

/// Event fan-out to any number of subscribers. Dead channels are lazily
/// cleaned up on the next notify; live subscriptions are removed
/// synchronously through their [`Subscription`] handle.
pub struct Fanout<E: Clone + Send + 'static> {
    entries: Arc<RwLock<Vec<Entry<E>>>>,
    next_id: Arc<AtomicU64>,
}

impl<E: Clone + Send + 'static> Clone for Fanout<E> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for Fanout<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> Fanout<E> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers a subscriber and returns the handle plus the receiving end.
    pub fn subscribe(&self) -> (Subscription<E>, Receiver<E>) {
        let (tx, rx) = channel();
        let id = self.register(tx);
        (self.handle(id), rx)
    }

    /// Registers a subscriber and synchronously delivers `initial` into its
    /// channel before returning, so there is no window in which an event can
    /// be missed between reading current state and subscribing.
    pub fn subscribe_seeded(&self, initial: E) -> (Subscription<E>, Receiver<E>) {
        let (tx, rx) = channel();
        let _ = tx.send(initial);
        let id = self.register(tx);
        (self.handle(id), rx)
    }

    /// Runs `callback` for every event on a dedicated thread. The thread
    /// exits once the subscription is dropped or unsubscribed.
    pub fn observe(&self, callback: impl FnMut(E) + Send + 'static) -> Subscription<E> {
        let (subscription, rx) = self.subscribe();
        Self::spawn_observer(rx, callback);
        subscription
    }

    /// Like [`Fanout::observe`] but the callback first receives `initial`.
    pub fn observe_seeded(
        &self,
        initial: E,
        callback: impl FnMut(E) + Send + 'static,
    ) -> Subscription<E> {
        let (subscription, rx) = self.subscribe_seeded(initial);
        Self::spawn_observer(rx, callback);
        subscription
    }

    fn spawn_observer(rx: Receiver<E>, mut callback: impl FnMut(E) + Send + 'static) {
        thread::spawn(move || {
            rx.iter().for_each(|event| callback(event));
        });
    }

    pub fn notify(&self, event: E) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|entry| entry.tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    fn register(&self, tx: Sender<E>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.write() {
            entries.push(Entry { id, tx });
        }
        id
    }

    fn handle(&self, id: u64) -> Subscription<E> {
        Subscription {
            id,
            entries: Arc::downgrade(&self.entries),
        }
    }
}

/// Removes the subscriber from the fan-out when unsubscribed or dropped.
/// Removal is synchronous: after `unsubscribe` returns, no further events
/// are delivered.
pub struct Subscription<E> {
    id: u64,
    entries: Weak<RwLock<Vec<Entry<E>>>>,
}

impl<E> Subscription<E> {
    pub fn unsubscribe(&self) {
        if let Some(entries) = self.entries.upgrade() {
            if let Ok(mut entries) = entries.write() {
                entries.retain(|entry| entry.id != self.id);
            }
        }
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn single_subscriber_receives_events() {
        let fanout = Fanout::<String>::new();
        let (_subscription, rx) = fanout.subscribe();

        fanout.notify("hello".to_string());
        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received, "hello");
    }

    #[test]
    fn every_subscriber_receives_every_event() {
        let fanout = Fanout::<i32>::new();
        let (_s1, rx1) = fanout.subscribe();
        let (_s2, rx2) = fanout.subscribe();
        let (_s3, rx3) = fanout.subscribe();

        fanout.notify(42);

        assert_eq!(rx1.recv_timeout(Duration::from_millis(100)).unwrap(), 42);
        assert_eq!(rx2.recv_timeout(Duration::from_millis(100)).unwrap(), 42);
        assert_eq!(rx3.recv_timeout(Duration::from_millis(100)).unwrap(), 42);
    }

    #[test]
    fn seeded_subscription_sees_initial_before_later_events() {
        let fanout = Fanout::<i32>::new();
        let (_subscription, rx) = fanout.subscribe_seeded(1);
        fanout.notify(2);

        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), 2);
    }

    #[test]
    fn unsubscribe_is_synchronous() {
        let fanout = Fanout::<i32>::new();
        let (subscription, rx) = fanout.subscribe();

        fanout.notify(1);
        subscription.unsubscribe();
        fanout.notify(2);

        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn dropped_handle_unsubscribes() {
        let fanout = Fanout::<i32>::new();
        {
            let (_subscription, _rx) = fanout.subscribe();
            assert_eq!(fanout.subscriber_count(), 1);
        }
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn dead_receiver_is_cleaned_up_on_notify() {
        let fanout = Fanout::<String>::new();
        let (subscription, rx) = fanout.subscribe();
        drop(rx);
        // The handle is still alive, but the channel is closed.
        fanout.notify("cleanup".to_string());
        assert_eq!(fanout.subscriber_count(), 0);
        drop(subscription);
    }

    #[test]
    fn observer_callback_sees_seed_then_events() {
        let fanout = Fanout::<i32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _subscription = fanout.observe_seeded(0, move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        // Give the observer thread time to start.
        thread::sleep(Duration::from_millis(10));
        fanout.notify(1);
        fanout.notify(2);
        thread::sleep(Duration::from_millis(50));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![0, 1, 2]);
    }

    #[test]
    fn notify_without_subscribers_is_a_noop() {
        let fanout = Fanout::<String>::new();
        fanout.notify("nobody listening".to_string());
    }
}
