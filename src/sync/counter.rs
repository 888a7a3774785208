//! Counters that broadcast when they reach zero.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::sync::cancel::CancelToken;

const WAIT_BACKSTOP: Duration = Duration::from_millis(50);

/// In-flight counter with a cancelable wait-for-zero.
pub struct WaitCounter {
    count: Mutex<u64>,
    cv: Arc<Condvar>,
}

impl WaitCounter {
    pub fn new() -> Self {
        WaitCounter {
            count: Mutex::new(0),
            cv: Arc::new(Condvar::new()),
        }
    }

    pub fn add(&self, n: u64) {
        *self.count.lock().unwrap() += n;
    }

    /// Decrements by one. Panics below zero.
    pub fn done(&self) {
        let mut c = self.count.lock().unwrap();
        *c = c
            .checked_sub(1)
            .unwrap_or_else(|| panic!("wait counter went negative"));
        if *c == 0 {
            drop(c);
            self.cv.notify_all();
        }
    }

    pub fn count(&self) -> u64 {
        *self.count.lock().unwrap()
    }

    /// Blocks until the counter is zero or `token` cancels.
    pub fn wait(&self, token: &CancelToken) -> Result<()> {
        let _reg = token.register_waiter(&self.cv);
        let mut c = self.count.lock().unwrap();
        loop {
            token.check()?;
            if *c == 0 {
                return Ok(());
            }
            let (guard, _) = self.cv.wait_timeout(c, WAIT_BACKSTOP).unwrap();
            c = guard;
        }
    }
}

impl Default for WaitCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SettleCounter
// ─────────────────────────────────────────────────────────────────────────────

/// A [`WaitCounter`] that can be closed to new entries: once closed, `begin`
/// refuses, and `settle` resolves when the remaining in-flight work drains.
pub struct SettleCounter {
    state: Mutex<SettleState>,
    cv: Arc<Condvar>,
}

struct SettleState {
    count: u64,
    closed: bool,
}

impl SettleCounter {
    pub fn new() -> Self {
        SettleCounter {
            state: Mutex::new(SettleState {
                count: 0,
                closed: false,
            }),
            cv: Arc::new(Condvar::new()),
        }
    }

    /// Registers a unit of in-flight work. Returns `false` when closed.
    pub fn begin(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return false;
        }
        st.count += 1;
        true
    }

    pub fn end(&self) {
        let mut st = self.state.lock().unwrap();
        st.count = st
            .count
            .checked_sub(1)
            .unwrap_or_else(|| panic!("settle counter went negative"));
        if st.count == 0 {
            drop(st);
            self.cv.notify_all();
        }
    }

    /// Closes the counter and blocks until in-flight work reaches zero.
    pub fn settle(&self, token: &CancelToken) -> Result<()> {
        let _reg = token.register_waiter(&self.cv);
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        loop {
            token.check()?;
            if st.count == 0 {
                return Ok(());
            }
            let (guard, _) = self.cv.wait_timeout(st, WAIT_BACKSTOP).unwrap();
            st = guard;
        }
    }
}

impl Default for SettleCounter {
    fn default() -> Self {
        Self::new()
    }
}
