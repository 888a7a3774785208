//! Per-key rendezvous: waiters block until someone resolves their key.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;
use crate::sync::cancel::CancelToken;
use crate::sync::once::SetOnce;

/// A concurrent map of one-shot cells. `wait` and `resolve` may arrive in
/// either order; the cell is created by whichever side shows up first.
pub struct WaitMap<K: Eq + Hash, V> {
    cells: DashMap<K, Arc<SetOnce<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> WaitMap<K, V> {
    pub fn new() -> Self {
        WaitMap {
            cells: DashMap::new(),
        }
    }

    fn cell(&self, key: &K) -> Arc<SetOnce<V>> {
        self.cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(SetOnce::new()))
            .clone()
    }

    /// Resolves `key` with `value`. [`crate::Error::AlreadySet`] on a second
    /// resolve of the same key.
    pub fn resolve(&self, key: &K, value: V) -> Result<()> {
        self.cell(key).set_value(value)
    }

    /// Blocks until `key` resolves or `token` cancels.
    pub fn wait(&self, key: &K, token: &CancelToken) -> Result<V> {
        self.cell(key).wait_with(token)
    }

    /// Drops the key so future waiters rendezvous on a fresh cell.
    pub fn forget(&self, key: &K) {
        self.cells.remove(key);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for WaitMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
