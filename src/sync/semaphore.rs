//! Counted semaphore with a runtime-adjustable limit.
//!
//! `acquire` blocks until `used + n <= limit`; a cancel wakes waiters through
//! the token's condvar registry (with a short timeout backstop for the
//! unsynchronized window between flag store and notify). `release` panics on
//! over-release; that is a programmer error, not an I/O condition.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::sync::cancel::CancelToken;

const WAIT_BACKSTOP: Duration = Duration::from_millis(50);

struct SemState {
    used: u64,
    limit: u64,
}

pub struct AdjustableSemaphore {
    state: Mutex<SemState>,
    cv: Arc<Condvar>,
}

impl AdjustableSemaphore {
    pub fn new(limit: u64) -> Self {
        assert!(limit > 0, "semaphore limit must be positive");
        AdjustableSemaphore {
            state: Mutex::new(SemState { used: 0, limit }),
            cv: Arc::new(Condvar::new()),
        }
    }

    /// Blocks until `n` permits are available or `token` cancels.
    pub fn acquire(&self, n: u64, token: &CancelToken) -> Result<()> {
        let _reg = token.register_waiter(&self.cv);
        let mut st = self.state.lock().unwrap();
        loop {
            token.check()?;
            if st.used + n <= st.limit {
                st.used += n;
                return Ok(());
            }
            let (guard, _) = self.cv.wait_timeout(st, WAIT_BACKSTOP).unwrap();
            st = guard;
        }
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self, n: u64) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.used + n <= st.limit {
            st.used += n;
            true
        } else {
            false
        }
    }

    /// Returns `n` permits. Panics when more permits are returned than held.
    pub fn release(&self, n: u64) {
        let mut st = self.state.lock().unwrap();
        st.used = st
            .used
            .checked_sub(n)
            .unwrap_or_else(|| panic!("semaphore: release of {n} permits with {} held", st.used));
        drop(st);
        self.cv.notify_all();
    }

    /// Adjusts the limit. Waiters re-check immediately; holders above a
    /// lowered limit keep their permits until released.
    pub fn set_limit(&self, limit: u64) {
        assert!(limit > 0, "semaphore limit must be positive");
        self.state.lock().unwrap().limit = limit;
        self.cv.notify_all();
    }

    pub fn used(&self) -> u64 {
        self.state.lock().unwrap().used
    }

    pub fn limit(&self) -> u64 {
        self.state.lock().unwrap().limit
    }
}
