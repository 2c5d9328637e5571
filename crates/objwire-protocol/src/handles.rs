//! Reference-counted table of objects exposed to a peer.
//!
//! The peer only ever sees an [`ObjectId`]. An object keeps the same id for
//! as long as it is alive, even across release and re-exposure, and ids are
//! never reused for a different object.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

use crate::error::{Result, RpcError};

/// Wire id of an exposed object.
pub type ObjectId = i64;

/// The id that stands for "no object".
pub const NULL_OBJECT_ID: ObjectId = -1;

struct Cell<T: ?Sized> {
    refcount: i64,
    object: Arc<T>,
}

struct Identity<T: ?Sized> {
    id: ObjectId,
    object: Weak<T>,
}

struct TableState<T: ?Sized> {
    cells: HashMap<ObjectId, Cell<T>>,
    // Keyed by allocation address. The weak reference keeps the address
    // from being reused while the entry exists.
    identities: HashMap<usize, Identity<T>>,
    last_id: ObjectId,
}

/// Maps ids to live objects and counts the peer's references to each.
///
/// All operations are serialized by one lock. Object destructors never run
/// while it is held.
pub struct HandleTable<T: ?Sized> {
    state: Mutex<TableState<T>>,
}

fn identity_key<T: ?Sized>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object).cast::<()>() as usize
}

impl<T: ?Sized> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                cells: HashMap::new(),
                identities: HashMap::new(),
                last_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expose `object` and return its id.
    ///
    /// Storing an object that is already exposed returns the same id and
    /// leaves its count unchanged; only [`incref`](Self::incref) and
    /// [`decref`](Self::decref) move counts. Storing one that was released
    /// but is still alive re-exposes it under its old id with a count of 1.
    pub fn store(&self, object: &Arc<T>) -> ObjectId {
        let key = identity_key(object);
        let mut state = self.lock();

        let id = match state.identities.get(&key) {
            Some(identity) if identity.object.strong_count() > 0 => identity.id,
            _ => {
                state.last_id += 1;
                let id = state.last_id;
                state.identities.insert(
                    key,
                    Identity {
                        id,
                        object: Arc::downgrade(object),
                    },
                );
                id
            }
        };

        state.cells.entry(id).or_insert_with(|| {
            debug!(id, "object exposed");
            Cell {
                refcount: 1,
                object: Arc::clone(object),
            }
        });
        id
    }

    /// Resolve `id` to its object.
    ///
    /// [`NULL_OBJECT_ID`] resolves to `None`; any other id that is not
    /// currently exposed is [`RpcError::ObjectNotFound`].
    pub fn load(&self, id: ObjectId) -> Result<Option<Arc<T>>> {
        if id == NULL_OBJECT_ID {
            return Ok(None);
        }
        let state = self.lock();
        match state.cells.get(&id) {
            Some(cell) => Ok(Some(Arc::clone(&cell.object))),
            None => Err(RpcError::ObjectNotFound(id)),
        }
    }

    /// Like [`load`](Self::load), but a null id is also an error.
    pub fn get(&self, id: ObjectId) -> Result<Arc<T>> {
        self.load(id)?.ok_or(RpcError::ObjectNotFound(id))
    }

    /// Add one reference. Unknown ids are ignored.
    pub fn incref(&self, id: ObjectId) {
        let mut state = self.lock();
        if let Some(cell) = state.cells.get_mut(&id) {
            cell.refcount += 1;
            trace!(id, refcount = cell.refcount, "incref");
        }
    }

    /// Drop one reference, releasing the object when none remain. Unknown
    /// ids are ignored.
    pub fn decref(&self, id: ObjectId) {
        let released = {
            let mut state = self.lock();
            match state.cells.get_mut(&id) {
                Some(cell) => {
                    cell.refcount -= 1;
                    trace!(id, refcount = cell.refcount, "decref");
                    if cell.refcount <= 0 {
                        state.cells.remove(&id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        let Some(cell) = released else {
            return;
        };
        debug!(id, "object released");
        let key = identity_key(&cell.object);
        drop(cell);

        // Forget the identity once nobody else holds the object either.
        let mut state = self.lock();
        let dead = state
            .identities
            .get(&key)
            .is_some_and(|identity| identity.id == id && identity.object.strong_count() == 0);
        if dead {
            state.identities.remove(&key);
        }
    }

    /// Current reference count of `id`, if exposed.
    pub fn refcount(&self, id: ObjectId) -> Option<i64> {
        self.lock().cells.get(&id).map(|cell| cell.refcount)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.lock().cells.contains_key(&id)
    }

    /// Number of exposed objects.
    pub fn len(&self) -> usize {
        self.lock().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every object regardless of counts.
    pub fn clear(&self) {
        let cells = std::mem::take(&mut self.lock().cells);
        if !cells.is_empty() {
            debug!(count = cells.len(), "releasing all exposed objects");
        }
        drop(cells);
        self.lock()
            .identities
            .retain(|_, identity| identity.object.strong_count() > 0);
    }
}

impl<T: ?Sized> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("HandleTable")
            .field("exposed", &state.cells.len())
            .field("known", &state.identities.len())
            .field("last_id", &state.last_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn store_twice_returns_same_id_and_keeps_count() {
        let table = HandleTable::new();
        let object = Arc::new(String::from("counter"));

        let first = table.store(&object);
        let second = table.store(&object);

        assert_eq!(first, second);
        assert_eq!(table.refcount(first), Some(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_objects_get_distinct_ids() {
        let table = HandleTable::new();
        let a = Arc::new(1u32);
        let b = Arc::new(1u32);

        assert_ne!(table.store(&a), table.store(&b));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn decref_to_zero_releases() {
        let table = HandleTable::new();
        let object = Arc::new(5u8);
        let id = table.store(&object);

        table.incref(id);
        table.decref(id);
        assert_eq!(table.refcount(id), Some(1));

        table.decref(id);
        assert!(!table.contains(id));
        assert!(matches!(table.load(id), Err(RpcError::ObjectNotFound(found)) if found == id));
    }

    #[test]
    fn null_id_loads_as_none() {
        let table: HandleTable<u8> = HandleTable::new();
        assert!(table.load(NULL_OBJECT_ID).unwrap().is_none());
        assert!(table.get(NULL_OBJECT_ID).is_err());
        assert!(table.load(99).is_err());
    }

    #[test]
    fn released_but_alive_object_keeps_its_id() {
        let table = HandleTable::new();
        let object = Arc::new(String::from("kept alive locally"));
        let id = table.store(&object);
        table.decref(id);
        assert!(!table.contains(id));

        assert_eq!(table.store(&object), id);
        assert_eq!(table.refcount(id), Some(1));
    }

    #[test]
    fn dead_objects_never_share_ids() {
        let table = HandleTable::new();
        let first = table.store(&Arc::new(1u64));
        table.decref(first);
        let second = table.store(&Arc::new(2u64));
        assert_ne!(first, second);
    }

    #[test]
    fn unknown_ids_are_ignored_by_refcounting() {
        let table: HandleTable<u8> = HandleTable::new();
        table.incref(42);
        table.decref(42);
        assert!(table.is_empty());
    }

    #[test]
    fn table_holds_the_only_strong_reference() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let table = HandleTable::new();
        let id = table.store(&Arc::new(Tracked(Arc::clone(&drops))));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        table.decref(id);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trait_objects_are_identified_by_allocation() {
        let table: HandleTable<dyn Any + Send + Sync> = HandleTable::new();
        let object: Arc<dyn Any + Send + Sync> = Arc::new(7i32);
        let id = table.store(&object);
        assert_eq!(table.store(&Arc::clone(&object)), id);

        let loaded = table.get(id).unwrap();
        assert_eq!(loaded.downcast_ref::<i32>(), Some(&7));
    }

    #[test]
    fn concurrent_increfs_are_not_lost() {
        let table = Arc::new(HandleTable::new());
        let id = table.store(&Arc::new(0u8));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..250 {
                        table.incref(id);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(table.refcount(id), Some(1001));
    }

    #[test]
    fn clear_releases_everything() {
        let table = HandleTable::new();
        let a = table.store(&Arc::new(1u8));
        let b = table.store(&Arc::new(2u8));
        table.incref(b);

        table.clear();
        assert!(table.is_empty());
        assert!(table.load(a).is_err());
    }
}
