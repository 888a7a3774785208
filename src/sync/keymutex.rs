//! Lazily-created per-key locks.

use std::hash::Hash;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

/// A concurrent map of mutexes, created on first use per key. Callers clone
/// the returned `Arc` and lock it; the entry stays in the map for the life of
/// the `KeyMutex` (key cardinality is bounded in practice: lock paths, build
/// ids).
pub struct KeyMutex<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyMutex<K> {
    pub fn new() -> Self {
        KeyMutex {
            locks: DashMap::new(),
        }
    }

    /// The mutex for `key`, created if absent.
    pub fn entry(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}
