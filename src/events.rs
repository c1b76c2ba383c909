//! Thread-safe observer list
//!
//! [`EventBus`] fans events out to callback listeners and to channel
//! subscribers. Subscription changes and emission may happen from any
//! thread. A panicking listener is logged and skipped; it never affects the
//! emitter or the other listeners.

use crate::error::panic_message;
use crate::sync::{lock, read, write};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Identifies a subscription for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked for every emitted event
pub trait Listener<E>: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &E);
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

/// Broadcast hub for events of type `E`
pub struct EventBus<E> {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn Listener<E>>)>>,
    channels: Mutex<Vec<Sender<E>>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback listener
    pub fn subscribe(&self, listener: impl Listener<E> + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        write(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Remove a callback listener; false if it was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Subscribe through a channel.
    ///
    /// The subscription ends when the receiver is dropped.
    pub fn channel(&self) -> Receiver<E> {
        let (sender, receiver) = unbounded();
        lock(&self.channels).push(sender);
        receiver
    }

    /// Number of active subscriptions of either kind
    pub fn subscriber_count(&self) -> usize {
        read(&self.listeners).len() + lock(&self.channels).len()
    }

    /// Deliver an event to every subscriber
    pub fn emit(&self, event: &E) {
        // Snapshot so listeners may (un)subscribe from inside a callback
        let listeners: Vec<Arc<dyn Listener<E>>> =
            read(&self.listeners).iter().map(|(_, l)| Arc::clone(l)).collect();

        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                tracing::error!("Event listener panicked: {}", panic_message(payload.as_ref()));
            }
        }

        lock(&self.channels).retain(|sender| sender.send(event.clone()).is_ok());
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callbacks_receive_events() {
        let bus = EventBus::<u32>::new();
        let sum = Arc::new(AtomicUsize::new(0));
        let s = sum.clone();
        bus.subscribe(move |e: &u32| {
            s.fetch_add(*e as usize, Ordering::SeqCst);
        });

        bus.emit(&3);
        bus.emit(&4);
        assert_eq!(sum.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.subscribe(move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_subscribers_pruned_on_drop() {
        let bus = EventBus::<String>::new();
        let rx = bus.channel();
        let dropped = bus.channel();
        drop(dropped);

        bus.emit(&"hello".to_string());
        assert_eq!(rx.try_recv().unwrap(), "hello");
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_: &u32| panic!("listener bug"));
        let h = hits.clone();
        bus.subscribe(move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&9);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
