//! Generic subscriber bus used by every component that emits events:
//! `subscribe(listener) -> unsubscribe`, per-component rather than a
//! single global emitter bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A handle returned by [`Subscribers::subscribe`]; dropping it does
/// **not** unsubscribe — call [`SubscriptionHandle::unsubscribe`]
/// (or [`Subscribers::unsubscribe`]) explicitly: subscribe returns an
/// unsubscribe handle rather than relying on RAII removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

struct Entry<E> {
    id: u64,
    listener: Listener<E>,
}

/// Bounded FIFO-evicting subscriber list plus a synchronous emit.
///
/// Delivery is synchronous with respect to the operation that caused
/// it: `emit` calls every listener in subscription order
/// before returning.
pub struct Subscribers<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Entry<E>>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push(Entry {
            id,
            listener: Arc::new(listener),
        });
        SubscriptionHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|entry| entry.id != handle.0);
    }

    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

/// Fixed-capacity FIFO ring used for violation/alert/evaluation logs
/// ("Ring buffers ... enforce FIFO eviction once their
/// capacity is reached").
#[derive(Debug, Clone)]
pub struct Ring<T> {
    capacity: usize,
    items: std::collections::VecDeque<T>,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}
