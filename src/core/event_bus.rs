//! Pub/Sub event bus for cache notifications.
//!
//! - `subscribe::<E>()` registers a callback, invoked synchronously on the
//!   emitting thread. Callbacks must be cheap and thread-safe; the populator's
//!   callback only forwards the image id into a channel.
//! - Every emitted event is also queued for `poll()`, so a UI loop can batch
//!   refreshes without subscribing.
//!
//! Callback order: FIFO within one event type. No ordering across types.

use log::warn;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Queue bound; oldest half is dropped when reached
const MAX_QUEUE_SIZE: usize = 1000;

/// Marker trait for events
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type Subscribers = Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>;

pub type BoxedEvent = Box<dyn Event>;

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Subscribers,
    queue: Arc<Mutex<Vec<BoxedEvent>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_types", &self.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type E
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Invoke callbacks, then queue the event for `poll()`
    pub fn emit<E: Event>(&self, event: E) {
        dispatch(&self.subscribers, &self.queue, event);
    }

    /// Take all events queued since the last poll
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Emitter handle for components that only publish
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            subscribers: Arc::clone(&self.subscribers),
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Publish-only handle. A default-constructed emitter is a no-op.
#[derive(Clone, Default)]
pub struct EventEmitter {
    subscribers: Subscribers,
    queue: Arc<Mutex<Vec<BoxedEvent>>>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn emit<E: Event>(&self, event: E) {
        dispatch(&self.subscribers, &self.queue, event);
    }
}

fn dispatch<E: Event>(subscribers: &Subscribers, queue: &Mutex<Vec<BoxedEvent>>, event: E) {
    // Clone the callback list so a callback may subscribe/emit without deadlocking
    let callbacks: Vec<Callback> = subscribers
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&TypeId::of::<E>())
        .cloned()
        .unwrap_or_default();
    for cb in &callbacks {
        cb(&event);
    }

    let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
    if queue.len() >= MAX_QUEUE_SIZE {
        let evict_count = queue.len() / 2;
        warn!("EventBus queue full ({} events), evicting oldest {}", queue.len(), evict_count);
        queue.drain(0..evict_count);
    }
    queue.push(Box::new(event));
}

/// Downcast a polled event.
///
/// Deref to `dyn Event` first: calling `as_any()` on the Box itself would hit
/// the blanket impl for `Box<dyn Event>` and the downcast would always fail.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}
