//! Client-side cache of proxies for remote objects.
//!
//! The cache never keeps a proxy alive: entries hold weak references, and a
//! proxy's [`RemoteRef`] removes its own entry and tells the peer to drop a
//! reference when the last user lets go.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::trace;

use crate::client::Client;
use crate::handles::ObjectId;

struct Entry<P: ?Sized> {
    generation: u64,
    proxy: Weak<P>,
}

struct CacheState<P: ?Sized> {
    entries: HashMap<ObjectId, Entry<P>>,
    next_generation: u64,
}

/// Non-owning map from remote object id to the proxy standing for it.
///
/// Each insertion gets a fresh generation, so the death of a replaced proxy
/// cannot evict its successor.
pub struct ProxyCache<P: ?Sized> {
    state: Mutex<CacheState<P>>,
}

impl<P: ?Sized> ProxyCache<P> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_generation: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live proxy for `id`, if any. A dead entry is evicted.
    pub fn get(&self, id: ObjectId) -> Option<Arc<P>> {
        let mut state = self.lock();
        let proxy = state.entries.get(&id)?.proxy.upgrade();
        if proxy.is_none() {
            trace!(id, "evicting dead proxy");
            state.entries.remove(&id);
        }
        proxy
    }

    /// Cache `proxy` under `id`, replacing any previous entry. Returns the
    /// entry's generation.
    pub fn insert(&self, id: ObjectId, proxy: &Arc<P>) -> u64 {
        let mut state = self.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(
            id,
            Entry {
                generation,
                proxy: Arc::downgrade(proxy),
            },
        );
        generation
    }

    /// Return the live proxy for `id`, or build one with `make` and cache it.
    ///
    /// `make` receives the generation of the new entry and runs with the
    /// cache locked, so it must not call back into this cache.
    pub fn get_or_insert_with(&self, id: ObjectId, make: impl FnOnce(u64) -> Arc<P>) -> Arc<P> {
        let mut state = self.lock();
        if let Some(proxy) = state.entries.get(&id).and_then(|entry| entry.proxy.upgrade()) {
            return proxy;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let proxy = make(generation);
        state.entries.insert(
            id,
            Entry {
                generation,
                proxy: Arc::downgrade(&proxy),
            },
        );
        proxy
    }

    /// Remove the entry for `id` if it still belongs to `generation`.
    pub fn invalidate(&self, id: ObjectId, generation: u64) -> bool {
        let mut state = self.lock();
        match state.entries.get(&id) {
            Some(entry) if entry.generation == generation => {
                state.entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Drop every dead entry; returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.proxy.strong_count() > 0);
        before - state.entries.len()
    }

    /// Number of entries, dead ones included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: ?Sized> Default for ProxyCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ?Sized> fmt::Debug for ProxyCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCache")
            .field("entries", &self.len())
            .finish()
    }
}

/// Ownership of one remote reference, embedded in a proxy.
///
/// Dropping it evicts the proxy's cache entry and sends `DECREF` for the
/// object. Obtain one through
/// [`Client::proxy_or_insert_with`](crate::Client::proxy_or_insert_with).
pub struct RemoteRef {
    id: ObjectId,
    generation: u64,
    client: Arc<Client>,
}

impl RemoteRef {
    pub(crate) fn new(client: Arc<Client>, id: ObjectId, generation: u64) -> Self {
        Self {
            id,
            generation,
            client,
        }
    }

    /// Remote id of the object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Client the object is reached through.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRef")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for RemoteRef {
    fn drop(&mut self) {
        self.client.release_proxy(self.id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_proxy_is_returned_while_alive() {
        let cache = ProxyCache::new();
        let proxy = Arc::new(String::from("counter#4"));
        cache.insert(4, &proxy);

        let hit = cache.get(4).unwrap();
        assert!(Arc::ptr_eq(&hit, &proxy));
    }

    #[test]
    fn miss_after_last_holder_drops() {
        let cache = ProxyCache::new();
        let proxy = Arc::new(5u32);
        cache.insert(9, &proxy);
        drop(proxy);

        assert!(cache.get(9).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_generation_does_not_evict_replacement() {
        let cache = ProxyCache::new();
        let old = Arc::new(1u8);
        let old_generation = cache.insert(3, &old);
        let new = Arc::new(2u8);
        let new_generation = cache.insert(3, &new);
        assert_ne!(old_generation, new_generation);

        assert!(!cache.invalidate(3, old_generation));
        assert_eq!(cache.get(3).as_deref(), Some(&2));
        assert!(cache.invalidate(3, new_generation));
        assert!(cache.get(3).is_none());
    }

    #[test]
    fn get_or_insert_with_builds_once() {
        let cache = ProxyCache::new();
        let mut built = 0;
        let first = cache.get_or_insert_with(1, |_| {
            built += 1;
            Arc::new(String::from("a"))
        });
        let second = cache.get_or_insert_with(1, |_| {
            built += 1;
            Arc::new(String::from("b"))
        });

        assert_eq!(built, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn purge_drops_dead_entries_only() {
        let cache = ProxyCache::new();
        let alive = Arc::new(1i64);
        cache.insert(1, &alive);
        cache.insert(2, &Arc::new(2i64));

        assert_eq!(cache.purge(), 1);
        assert_eq!(cache.len(), 1);
    }
}
