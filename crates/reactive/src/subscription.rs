//! Listener and weak-reference registries.
//!
//! Callbacks are never invoked while a registry is borrowed: callers take a
//! `snapshot()` under their own lock, release it, then call the listeners.
//! A listener may therefore add or remove listeners (or mutate the data it
//! observes) from inside its callback.

use std::sync::{Arc, Weak};

/// Identifies a registered listener or weak entry.
pub type ListenerId = u64;

enum Entry<F: ?Sized> {
    Strong(Arc<F>),
    Weak(Weak<F>),
}

impl<F: ?Sized> Entry<F> {
    fn upgrade(&self) -> Option<Arc<F>> {
        match self {
            Entry::Strong(callback) => Some(Arc::clone(callback)),
            Entry::Weak(callback) => callback.upgrade(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Entry::Strong(_) => true,
            Entry::Weak(callback) => callback.strong_count() > 0,
        }
    }
}

/// Change listeners of one observable, in registration order.
///
/// `F` is usually a `dyn Fn(..) + Send + Sync` type.
pub struct ListenerRegistry<F: ?Sized> {
    entries: Vec<(ListenerId, Entry<F>)>,
    next_id: ListenerId,
}

impl<F: ?Sized> Default for ListenerRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> ListenerRegistry<F> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    fn next(&mut self) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Registers a listener that stays until removed.
    pub fn subscribe(&mut self, callback: Arc<F>) -> ListenerId {
        let id = self.next();
        self.entries.push((id, Entry::Strong(callback)));
        id
    }

    /// Registers a listener that is dropped from the registry once the
    /// caller releases every strong reference to it.
    pub fn subscribe_weak(&mut self, callback: &Arc<F>) -> ListenerId {
        let id = self.next();
        self.entries.push((id, Entry::Weak(Arc::downgrade(callback))));
        id
    }

    /// Removes a listener. Returns true if it was registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Returns the live listeners in registration order and drops dead weak
    /// entries.
    pub fn snapshot(&mut self) -> Vec<Arc<F>> {
        self.sweep();
        self.entries.iter().filter_map(|(_, e)| e.upgrade()).collect()
    }

    /// Drops weak entries whose listener is gone.
    pub fn sweep(&mut self) {
        self.entries.retain(|(_, entry)| entry.is_alive());
    }

    /// Returns the number of registered listeners, counting weak entries
    /// that have not been swept yet.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every listener.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Weak references to values that must be revisited after every version
/// advance. Entries never keep their value alive.
pub struct WeakRegistry<T> {
    entries: Vec<(ListenerId, Weak<T>)>,
    next_id: ListenerId,
}

impl<T> Default for WeakRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WeakRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Registers a value. Registering the same allocation twice is a no-op
    /// and returns the existing id.
    pub fn register(&mut self, value: &Arc<T>) -> ListenerId {
        if let Some((id, _)) = self
            .entries
            .iter()
            .find(|(_, weak)| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(value)))
        {
            return *id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, Arc::downgrade(value)));
        id
    }

    /// Removes an entry. Returns true if it was registered.
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Returns the value registered under `id` if it is still alive.
    pub fn get(&self, id: ListenerId) -> Option<Arc<T>> {
        self.entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Drops entries whose value is gone and returns the live ones.
    pub fn live(&mut self) -> Vec<(ListenerId, Arc<T>)> {
        self.sweep();
        self.entries
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|value| (*id, value)))
            .collect()
    }

    /// Drops entries whose value is gone.
    pub fn sweep(&mut self) {
        self.entries.retain(|(_, weak)| weak.strong_count() > 0);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
