//! Cancellation plumbing: the crate's substitute for a request context.
//!
//! A [`CancelSource`] owns the right to cancel; any number of cloned
//! [`CancelToken`]s observe it. Tokens expose three views of the same event:
//!
//! - a flag (`is_canceled` / `check`) for polling loops,
//! - a channel that disconnects on cancel (`done`) for `crossbeam` `select!`,
//! - a condvar registry (`register_waiter`) so `Mutex`/`Condvar` waiters are
//!   notified promptly instead of spinning until their backstop timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};

struct Inner {
    canceled: AtomicBool,
    // Kept alive until cancel; dropping it disconnects `rx`.
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
    waiters: Mutex<Vec<Weak<Condvar>>>,
}

/// The cancel side. Dropping the source does NOT cancel; call [`cancel`].
///
/// [`cancel`]: CancelSource::cancel
pub struct CancelSource {
    inner: Arc<Inner>,
}

/// The observe side. Cheap to clone; all clones observe the same source.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

fn new_inner() -> Arc<Inner> {
    let (tx, rx) = bounded::<()>(0);
    Arc::new(Inner {
        canceled: AtomicBool::new(false),
        tx: Mutex::new(Some(tx)),
        rx,
        waiters: Mutex::new(Vec::new()),
    })
}

impl CancelSource {
    pub fn new() -> Self {
        CancelSource { inner: new_inner() }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: self.inner.clone(),
        }
    }

    /// Fires the cancellation: sets the flag, disconnects the done channel,
    /// and wakes every registered condvar waiter. Idempotent.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        // Disconnect the channel so select! waiters fire.
        self.inner.tx.lock().unwrap().take();
        // Wake condvar waiters so they re-check the flag.
        let waiters = self.inner.waiters.lock().unwrap();
        for w in waiters.iter() {
            if let Some(cv) = w.upgrade() {
                cv.notify_all();
            }
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that never cancels. Used by detached cleanup paths that must
    /// run to completion.
    pub fn never() -> Self {
        CancelToken { inner: new_inner() }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// `Err(Canceled)` once the source fired.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Channel that disconnects when the source fires; never delivers a
    /// message. Intended for `select!`.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.rx
    }

    /// Registers a condvar to be notified on cancel. The registration is
    /// dropped with the returned guard.
    pub fn register_waiter(&self, cv: &Arc<Condvar>) -> WaiterGuard {
        self.inner
            .waiters
            .lock()
            .unwrap()
            .push(Arc::downgrade(cv));
        WaiterGuard {
            inner: self.inner.clone(),
            cv: Arc::downgrade(cv),
        }
    }
}

/// Removes the condvar registration on drop.
pub struct WaiterGuard {
    inner: Arc<Inner>,
    cv: Weak<Condvar>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut waiters = self.inner.waiters.lock().unwrap();
        if let Some(pos) = waiters.iter().position(|w| w.ptr_eq(&self.cv)) {
            waiters.swap_remove(pos);
        }
    }
}
