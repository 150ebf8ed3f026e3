//! Typed publish/subscribe.
//!
//! Two ways to listen:
//! - `on(kind, callback)` registers a callback for one event kind (or all of
//!   them with `on_any`) and returns a [`Subscription`] to remove it again.
//! - `subscribe()` hands out a tokio broadcast receiver of every event.
//!
//! Callbacks run synchronously on the emitting task, outside the registry
//! lock, so a callback may unsubscribe itself or others.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast;

/// An event that knows its own kind.
pub trait Event: Clone + Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E: Event> {
    by_kind: HashMap<E::Kind, Vec<(u64, Listener<E>)>>,
    any: Vec<(u64, Listener<E>)>,
}

impl<E: Event> Registry<E> {
    fn remove(&mut self, key: Option<E::Kind>, id: u64) {
        match key {
            Some(kind) => {
                if let Some(list) = self.by_kind.get_mut(&kind) {
                    list.retain(|(lid, _)| *lid != id);
                    if list.is_empty() {
                        self.by_kind.remove(&kind);
                    }
                }
            }
            None => self.any.retain(|(lid, _)| *lid != id),
        }
    }
}

const BROADCAST_CAPACITY: usize = 1024;

/// Callback registry + broadcast channel for one event type.
pub struct EventEmitter<E: Event> {
    registry: Arc<Mutex<Registry<E>>>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<E>,
}

impl<E: Event> EventEmitter<E> {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry: Arc::new(Mutex::new(Registry {
                by_kind: HashMap::new(),
                any: Vec::new(),
            })),
            next_id: AtomicU64::new(1),
            broadcast,
        }
    }

    /// Register a callback for one kind of event.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(callback))
    }

    /// Register a callback for every event.
    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    fn register(&self, kind: Option<E::Kind>, listener: Listener<E>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = lock(&self.registry);
            match kind {
                Some(kind) => registry.by_kind.entry(kind).or_default().push((id, listener)),
                None => registry.any.push((id, listener)),
            }
        }

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).remove(kind, id);
                }
            })),
        }
    }

    /// Receiver of every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.broadcast.subscribe()
    }

    /// Deliver an event to matching callbacks and broadcast receivers.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = {
            let registry = lock(&self.registry);
            registry
                .by_kind
                .get(&event.kind())
                .into_iter()
                .flatten()
                .chain(registry.any.iter())
                .map(|(_, l)| Arc::clone(l))
                .collect()
        };
        for listener in listeners {
            listener(event);
        }
        // no receivers is fine
        let _ = self.broadcast.send(event.clone());
    }

    /// Callbacks registered for `kind` (not counting `on_any`).
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        lock(&self.registry)
            .by_kind
            .get(&kind)
            .map_or(0, |list| list.len())
    }
}

impl<E: Event> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

// A panicking listener must not take the emitter down with it.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by `on`/`on_any`.
///
/// Dropping it keeps the callback registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
