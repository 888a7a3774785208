//! Per-key computation dedup.
//!
//! For each key, one caller (the leader) runs the computation; everyone else
//! waits on the shared [`SetOnce`] cell. The slot is removed once the leader
//! resolves the cell, success or failure, so a failed flight never poisons
//! future attempts.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::sync::cancel::CancelToken;
use crate::sync::once::SetOnce;

pub struct Singleflight<K: Eq + Hash, V> {
    flights: DashMap<K, Arc<SetOnce<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Singleflight<K, V> {
    pub fn new() -> Self {
        Singleflight {
            flights: DashMap::new(),
        }
    }

    /// Runs `compute` for `key` unless a flight is already up, in which case
    /// the call waits for the shared result. A canceled waiter returns
    /// [`crate::Error::Canceled`] without disturbing the flight.
    pub fn fly<F>(&self, key: K, token: &CancelToken, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let cell = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let cell = entry.get().clone();
                drop(entry);
                return cell.wait_with(token);
            }
            Entry::Vacant(entry) => {
                let cell = Arc::new(SetOnce::new());
                entry.insert(cell.clone());
                cell
            }
        };

        // Leader path. Resolve the cell before removing the slot so a late
        // joiner either finds the live flight or starts a fresh one.
        let out = match compute() {
            Ok(v) => {
                let _ = cell.set_value(v.clone());
                Ok(v)
            }
            Err(e) => {
                let shared = e.into_shared();
                let _ = cell.set_error(Error::Shared(shared.clone()));
                Err(Error::Shared(shared))
            }
        };
        self.flights.remove(&key);
        out
    }

    /// Number of flights currently up.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for Singleflight<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_caller_computes() {
        let sf: Singleflight<u64, u32> = Singleflight::new();
        let v = sf
            .fly(1, &CancelToken::never(), || Ok(42))
            .unwrap();
        assert_eq!(v, 42);
        assert_eq!(sf.in_flight(), 0);
    }

    #[test]
    fn concurrent_callers_share_one_computation() {
        let sf: Arc<Singleflight<u64, u32>> = Arc::new(Singleflight::new());
        let calls = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sf = sf.clone();
                let calls = calls.clone();
                thread::spawn(move || {
                    sf.fly(7, &CancelToken::never(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold the flight open so the others join it.
                        thread::sleep(Duration::from_millis(50));
                        Ok(7u32)
                    })
                })
            })
            .collect();

        let results: Vec<u32> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert!(results.iter().all(|&v| v == 7));
        // All callers landed while the first flight was open, so the
        // computation ran exactly once.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sf.in_flight(), 0);
    }

    #[test]
    fn failure_does_not_poison_the_key() {
        let sf: Singleflight<u64, u32> = Singleflight::new();
        let err = sf
            .fly(3, &CancelToken::never(), || Err(Error::BytesNotAvailable))
            .unwrap_err();
        assert!(matches!(err, Error::Shared(_)));
        // Next flight on the same key runs fresh.
        let v = sf.fly(3, &CancelToken::never(), || Ok(9)).unwrap();
        assert_eq!(v, 9);
    }

    #[test]
    fn waiters_observe_leader_error() {
        let sf: Arc<Singleflight<u64, u32>> = Arc::new(Singleflight::new());
        let sf2 = sf.clone();
        let leader = thread::spawn(move || {
            sf2.fly(5, &CancelToken::never(), || {
                thread::sleep(Duration::from_millis(50));
                Err(Error::BytesNotAvailable)
            })
        });
        thread::sleep(Duration::from_millis(10));
        let waiter = sf.fly(5, &CancelToken::never(), || Ok(1));
        // The waiter joined the failing flight.
        assert!(waiter.is_err());
        assert!(leader.join().unwrap().is_err());
    }
}
