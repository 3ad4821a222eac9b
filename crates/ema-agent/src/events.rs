//! Typed publish/subscribe with replay.
//!
//! Each bus owns the full event log for its lifetime (bounded by session
//! length): new subscribers receive a replay of everything emitted so far,
//! then incremental deliveries in registration order. A panicking subscriber
//! is logged and never blocks the emitter or other subscribers.
//!
//! Callbacks must not call back into the bus they are registered on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::error;

pub type SubscriberId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct SubscriberEntry<E> {
    id: SubscriberId,
    once: bool,
    callback: Callback<E>,
}

struct Inner<E> {
    next_id: SubscriberId,
    subscribers: Vec<SubscriberEntry<E>>,
    log: Vec<E>,
}

pub struct EventBus<E> {
    inner: Mutex<Inner<E>>,
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                subscribers: Vec::new(),
                log: Vec::new(),
            }),
        }
    }

    /// Register a subscriber. Past events are replayed to it immediately.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(callback, false)
    }

    /// Register a subscriber that is removed after its first delivery.
    /// Replayed events count: a non-empty log fires it during subscription.
    pub fn once<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(callback, true)
    }

    fn register<F>(&self, callback: F, once: bool) -> SubscriberId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let callback: Callback<E> = Arc::new(callback);
        let (id, replay) = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            let fires_on_replay = once && !inner.log.is_empty();
            if !fires_on_replay {
                inner.subscribers.push(SubscriberEntry {
                    id,
                    once,
                    callback: callback.clone(),
                });
            }
            let replay: Vec<E> = if once {
                inner.log.first().cloned().into_iter().collect()
            } else {
                inner.log.clone()
            };
            (id, replay)
        };
        for event in &replay {
            dispatch(&callback, event);
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|s| s.id != id);
    }

    /// Emit an event to all subscribers in registration order.
    pub fn emit(&self, event: E) {
        let callbacks: Vec<Callback<E>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.log.push(event.clone());
            let callbacks = inner
                .subscribers
                .iter()
                .map(|s| s.callback.clone())
                .collect();
            inner.subscribers.retain(|s| !s.once);
            callbacks
        };
        for callback in &callbacks {
            dispatch(callback, &event);
        }
    }

    /// Snapshot of every event emitted so far.
    pub fn history(&self) -> Vec<E> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

fn dispatch<E>(callback: &Callback<E>, event: &E) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        error!("Event subscriber panicked; continuing with remaining subscribers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&u32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: &u32| sink.lock().unwrap().push(*e))
    }

    #[test]
    fn delivers_in_emission_order() {
        let bus = EventBus::new();
        let (seen, callback) = collector();
        bus.subscribe(callback);
        bus.emit(1);
        bus.emit(2);
        bus.emit(3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn replays_past_events_on_subscribe() {
        let bus = EventBus::new();
        bus.emit(1);
        bus.emit(2);
        let (seen, callback) = collector();
        bus.subscribe(callback);
        bus.emit(3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (seen, callback) = collector();
        let id = bus.subscribe(callback);
        bus.emit(1);
        bus.unsubscribe(id);
        bus.emit(2);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn once_fires_a_single_time() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        bus.once(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(1);
        bus.emit(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        bus.subscribe(|_: &u32| panic!("bad subscriber"));
        let (seen, callback) = collector();
        bus.subscribe(callback);
        bus.emit(7);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn history_snapshots_the_log() {
        let bus = EventBus::new();
        bus.emit(1);
        bus.emit(2);
        assert_eq!(bus.history(), vec![1, 2]);
    }
}
