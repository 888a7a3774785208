//! One-shot cells.
//!
//! [`SetOnce`] resolves exactly once to a value or an error; every waiter
//! observes the same outcome. [`ErrorOnce`] specializes it to "completion with
//! optional error" and is the transition handle of the sandbox state machine.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::error::{Error, Result};
use crate::sync::cancel::CancelToken;

type Outcome<T> = std::result::Result<T, Arc<Error>>;

/// A cell that can be set exactly once. `Done` (a channel that disconnects on
/// set) makes it usable inside `select!`; second `set_*` calls return
/// [`Error::AlreadySet`].
pub struct SetOnce<T> {
    cell: Mutex<Option<Outcome<T>>>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl<T: Clone> SetOnce<T> {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        SetOnce {
            cell: Mutex::new(None),
            done_tx: Mutex::new(Some(tx)),
            done_rx: rx,
        }
    }

    fn complete(&self, outcome: Outcome<T>) -> Result<()> {
        {
            let mut cell = self.cell.lock().unwrap();
            if cell.is_some() {
                return Err(Error::AlreadySet);
            }
            *cell = Some(outcome);
        }
        // Disconnect the done channel after the value is visible.
        self.done_tx.lock().unwrap().take();
        Ok(())
    }

    pub fn set_value(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    pub fn set_error(&self, err: Error) -> Result<()> {
        self.complete(Err(err.into_shared()))
    }

    /// Channel that disconnects once the cell resolves. Never delivers a
    /// message; intended for `select!`.
    pub fn done(&self) -> &Receiver<()> {
        &self.done_rx
    }

    /// Non-blocking result: `None` while unresolved.
    pub fn result(&self) -> Option<Result<T>> {
        self.cell
            .lock()
            .unwrap()
            .as_ref()
            .map(|outcome| outcome.clone().map_err(Error::Shared))
    }

    /// Blocks until the cell resolves.
    pub fn wait(&self) -> Result<T> {
        // recv errors exactly when the sender was dropped, i.e. on resolve.
        let _ = self.done_rx.recv();
        self.result().expect("resolved cell has a result")
    }

    /// Blocks until the cell resolves or `token` cancels.
    pub fn wait_with(&self, token: &CancelToken) -> Result<T> {
        if let Some(r) = self.result() {
            return r;
        }
        select! {
            recv(self.done_rx) -> _ => self.result().expect("resolved cell has a result"),
            recv(token.done()) -> _ => {
                // The set may have raced the cancel; prefer the value.
                self.result().unwrap_or(Err(Error::Canceled))
            }
        }
    }
}

impl<T: Clone> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ErrorOnce
// ─────────────────────────────────────────────────────────────────────────────

/// Completion signal with an optional error.
pub struct ErrorOnce {
    inner: SetOnce<()>,
}

impl ErrorOnce {
    pub fn new() -> Self {
        ErrorOnce {
            inner: SetOnce::new(),
        }
    }

    pub fn set_ok(&self) -> Result<()> {
        self.inner.set_value(())
    }

    pub fn set_error(&self, err: Error) -> Result<()> {
        self.inner.set_error(err)
    }

    /// Non-blocking: `None` while unresolved, `Some(outcome)` afterwards.
    pub fn peek(&self) -> Option<Result<()>> {
        self.inner.result()
    }

    pub fn done(&self) -> &Receiver<()> {
        self.inner.done()
    }

    pub fn wait(&self) -> Result<()> {
        self.inner.wait()
    }

    pub fn wait_with(&self, token: &CancelToken) -> Result<()> {
        self.inner.wait_with(token)
    }
}

impl Default for ErrorOnce {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::cancel::CancelSource;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn second_set_rejected() {
        let cell = SetOnce::new();
        cell.set_value(7u32).unwrap();
        assert!(matches!(cell.set_value(8), Err(Error::AlreadySet)));
        assert!(matches!(
            cell.set_error(Error::BytesNotAvailable),
            Err(Error::AlreadySet)
        ));
        assert_eq!(cell.result().unwrap().unwrap(), 7);
    }

    #[test]
    fn waiters_observe_same_value() {
        let cell = Arc::new(SetOnce::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || cell.wait().unwrap())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        cell.set_value(99u64).unwrap();
        for h in handles {
            assert_eq!(h.join().unwrap(), 99);
        }
    }

    #[test]
    fn error_is_shared_between_waiters() {
        let cell: Arc<SetOnce<()>> = Arc::new(SetOnce::new());
        let c2 = cell.clone();
        let handle = thread::spawn(move || c2.wait());
        thread::sleep(Duration::from_millis(10));
        cell.set_error(Error::BytesNotAvailable).unwrap();
        assert!(matches!(handle.join().unwrap(), Err(Error::Shared(_))));
        assert!(matches!(cell.wait(), Err(Error::Shared(_))));
    }

    #[test]
    fn wait_with_cancels() {
        let cell: SetOnce<u32> = SetOnce::new();
        let src = CancelSource::new();
        let token = src.token();
        src.cancel();
        assert!(matches!(cell.wait_with(&token), Err(Error::Canceled)));
    }

    #[test]
    fn wait_with_prefers_resolved_value_over_cancel() {
        let cell: SetOnce<u32> = SetOnce::new();
        cell.set_value(5).unwrap();
        let src = CancelSource::new();
        src.cancel();
        assert_eq!(cell.wait_with(&src.token()).unwrap(), 5);
    }

    #[test]
    fn error_once_peek() {
        let once = ErrorOnce::new();
        assert!(once.peek().is_none());
        once.set_error(Error::PoolClosed).unwrap();
        assert!(once.peek().unwrap().is_err());
        assert!(once.set_ok().is_err());
    }

    #[test]
    fn error_once_ok_path() {
        let once = Arc::new(ErrorOnce::new());
        let o2 = once.clone();
        let handle = thread::spawn(move || o2.wait());
        thread::sleep(Duration::from_millis(10));
        once.set_ok().unwrap();
        assert!(handle.join().unwrap().is_ok());
    }
}
