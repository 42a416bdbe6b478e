//! Ephemeral result cache — the hand-off mailbox between fan-out workers
//! and the consumer waiting on them.
//!
//! Two namespaces keyed by request id:
//! - **arrays**: pre-sized, write-once slots. [`allocate`](EphemeralCache::allocate)
//!   returns a [`SlotHandle`] carrying a generation; once the key is freed and
//!   reallocated, old handles are rejected.
//! - **objects**: single keyed values.
//!
//! The map is behind a mutex, but a slot write only holds it long enough to
//! look up the array; the write itself goes to a `OnceLock` that belongs to
//! exactly one worker index. Nothing expires: the consumer frees its entry
//! with [`take_array`](EphemeralCache::take_array) or
//! [`delete`](EphemeralCache::delete).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::CacheError;

/// Reference to an allocated slot array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    key: String,
    generation: u64,
    len: usize,
}

impl SlotHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct ArrayEntry<T> {
    generation: u64,
    slots: Arc<Vec<OnceLock<T>>>,
}

struct CacheInner<T> {
    arrays: HashMap<String, ArrayEntry<T>>,
    objects: HashMap<String, T>,
    next_generation: u64,
}

pub struct EphemeralCache<T> {
    inner: Mutex<CacheInner<T>>,
}

impl<T> Default for EphemeralCache<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                arrays: HashMap::new(),
                objects: HashMap::new(),
                next_generation: 1,
            }),
        }
    }
}

impl<T> EphemeralCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Array namespace ─────────────────────────────────────────────────────

    /// Allocate `len` empty slots under `key`.
    pub fn allocate(&self, key: &str, len: usize) -> Result<SlotHandle, CacheError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.arrays.contains_key(key) {
            return Err(CacheError::AlreadyAllocated(key.to_string()));
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let slots = (0..len).map(|_| OnceLock::new()).collect::<Vec<_>>();
        inner.arrays.insert(
            key.to_string(),
            ArrayEntry { generation, slots: Arc::new(slots) },
        );
        Ok(SlotHandle { key: key.to_string(), generation, len })
    }

    /// Current handle for `key`, if allocated.
    pub fn handle(&self, key: &str) -> Option<SlotHandle> {
        let inner = self.inner.lock().unwrap();
        inner.arrays.get(key).map(|e| SlotHandle {
            key: key.to_string(),
            generation: e.generation,
            len: e.slots.len(),
        })
    }

    /// Write slot `index`. Each slot accepts exactly one write.
    pub fn set_item(&self, handle: &SlotHandle, index: usize, value: T) -> Result<(), CacheError> {
        let slots = self.slots(handle)?;
        let slot = slots.get(index).ok_or_else(|| CacheError::OutOfBounds {
            key: handle.key.clone(),
            index,
            len: slots.len(),
        })?;
        slot.set(value).map_err(|_| CacheError::SlotTaken { key: handle.key.clone(), index })
    }

    /// Number of slots written so far.
    pub fn filled(&self, handle: &SlotHandle) -> Result<usize, CacheError> {
        Ok(self.slots(handle)?.iter().filter(|s| s.get().is_some()).count())
    }

    /// Free `key`. Returns `false` if it was not allocated.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().unwrap().arrays.remove(key).is_some()
    }

    pub fn array_count(&self) -> usize {
        self.inner.lock().unwrap().arrays.len()
    }

    fn slots(&self, handle: &SlotHandle) -> Result<Arc<Vec<OnceLock<T>>>, CacheError> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .arrays
            .get(&handle.key)
            .ok_or_else(|| CacheError::Missing(handle.key.clone()))?;
        if entry.generation != handle.generation {
            return Err(CacheError::StaleHandle {
                key: handle.key.clone(),
                generation: handle.generation,
            });
        }
        Ok(entry.slots.clone())
    }

    fn remove_checked(&self, handle: &SlotHandle) -> Result<Arc<Vec<OnceLock<T>>>, CacheError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.arrays.get(&handle.key) {
            None => return Err(CacheError::Missing(handle.key.clone())),
            Some(e) if e.generation != handle.generation => {
                return Err(CacheError::StaleHandle {
                    key: handle.key.clone(),
                    generation: handle.generation,
                })
            }
            Some(_) => {}
        }
        let entry = inner
            .arrays
            .remove(&handle.key)
            .ok_or_else(|| CacheError::Missing(handle.key.clone()))?;
        Ok(entry.slots)
    }

    // ─── Object namespace ────────────────────────────────────────────────────

    /// Store `value` under `key`, returning the previous value.
    pub fn set_object(&self, key: &str, value: T) -> Option<T> {
        self.inner.lock().unwrap().objects.insert(key.to_string(), value)
    }

    pub fn delete_object(&self, key: &str) -> Option<T> {
        self.inner.lock().unwrap().objects.remove(key)
    }
}

impl<T: Clone> EphemeralCache<T> {
    /// Snapshot of the slots; unwritten slots read as `None`.
    pub fn get_array(&self, handle: &SlotHandle) -> Result<Vec<Option<T>>, CacheError> {
        Ok(self.slots(handle)?.iter().map(|s| s.get().cloned()).collect())
    }

    /// Remove the array and return its contents.
    pub fn take_array(&self, handle: &SlotHandle) -> Result<Vec<Option<T>>, CacheError> {
        let slots = self.remove_checked(handle)?;
        Ok(match Arc::try_unwrap(slots) {
            Ok(slots) => slots.into_iter().map(OnceLock::into_inner).collect(),
            // a worker still holds the array; copy what is there
            Err(shared) => shared.iter().map(|s| s.get().cloned()).collect(),
        })
    }

    pub fn get_object(&self, key: &str) -> Option<T> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_write_take() {
        let cache = EphemeralCache::<u64>::new();
        let h = cache.allocate("req-1", 3).unwrap();
        cache.set_item(&h, 2, 20).unwrap();
        cache.set_item(&h, 0, 0).unwrap();
        assert_eq!(cache.filled(&h).unwrap(), 2);
        assert_eq!(cache.get_array(&h).unwrap(), vec![Some(0), None, Some(20)]);

        let taken = cache.take_array(&h).unwrap();
        assert_eq!(taken, vec![Some(0), None, Some(20)]);
        assert_eq!(cache.array_count(), 0);
        assert_eq!(cache.take_array(&h), Err(CacheError::Missing("req-1".into())));
    }

    #[test]
    fn duplicate_allocation_is_rejected() {
        let cache = EphemeralCache::<u64>::new();
        cache.allocate("req", 1).unwrap();
        assert_eq!(cache.allocate("req", 1), Err(CacheError::AlreadyAllocated("req".into())));
    }

    #[test]
    fn slots_are_write_once_and_bounded() {
        let cache = EphemeralCache::<u64>::new();
        let h = cache.allocate("req", 1).unwrap();
        cache.set_item(&h, 0, 1).unwrap();
        assert!(matches!(cache.set_item(&h, 0, 2), Err(CacheError::SlotTaken { index: 0, .. })));
        assert!(matches!(cache.set_item(&h, 5, 2), Err(CacheError::OutOfBounds { len: 1, .. })));
    }

    #[test]
    fn stale_handles_are_rejected_after_reallocation() {
        let cache = EphemeralCache::<u64>::new();
        let old = cache.allocate("req", 2).unwrap();
        assert!(cache.delete("req"));
        let new = cache.allocate("req", 2).unwrap();
        assert!(matches!(cache.set_item(&old, 0, 1), Err(CacheError::StaleHandle { .. })));
        assert!(matches!(cache.take_array(&old), Err(CacheError::StaleHandle { .. })));
        cache.set_item(&new, 0, 1).unwrap();
        assert_eq!(cache.handle("req"), Some(new));
    }

    #[test]
    fn concurrent_writers_fill_disjoint_slots() {
        let cache = Arc::new(EphemeralCache::<usize>::new());
        let h = cache.allocate("fan-out", 64).unwrap();
        let threads: Vec<_> = (0..64)
            .map(|i| {
                let cache = cache.clone();
                let h = h.clone();
                std::thread::spawn(move || cache.set_item(&h, i, i * 10).unwrap())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let values = cache.take_array(&h).unwrap();
        assert!(values.iter().enumerate().all(|(i, v)| *v == Some(i * 10)));
    }

    #[test]
    fn object_namespace() {
        let cache = EphemeralCache::<String>::new();
        assert!(cache.set_object("head", "100".into()).is_none());
        assert_eq!(cache.set_object("head", "101".into()), Some("100".into()));
        assert_eq!(cache.get_object("head"), Some("101".into()));
        assert_eq!(cache.delete_object("head"), Some("101".into()));
        assert!(cache.get_object("head").is_none());
    }
}
