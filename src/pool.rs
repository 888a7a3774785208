//! Generic warm pool: fresh-vs-reusable resources.
//!
//! Two bounded channels back the pool. A single producer thread keeps
//! `fresh` topped up from the factory (sleeping between retries on factory
//! errors); `return_item` feeds `reusable`. `get` always drains reusable
//! before fresh so warm resources are spent before cold ones. Every
//! non-success path destroys the item, and destruction runs detached from any
//! caller's cancellation.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::warn;

use crate::error::{Error, Result};
use crate::sync::cancel::{CancelSource, CancelToken};

pub struct PoolConfig<T> {
    /// Capacity of the fresh channel the factory keeps full.
    pub warm_count: usize,
    /// Capacity of the reusable channel.
    pub max_pool: usize,
    /// How long `return_item` waits for reusable space before destroying.
    pub return_timeout: Duration,
    /// Sleep between factory retries after an error.
    pub factory_retry_delay: Duration,
    pub factory: Box<dyn Fn() -> Result<T> + Send + Sync>,
    pub destroy: Box<dyn Fn(T) + Send + Sync>,
}

pub struct WarmPool<T: Send + 'static> {
    fresh_rx: Receiver<T>,
    reusable_tx: Sender<T>,
    reusable_rx: Receiver<T>,
    closed: CancelSource,
    destroy: Arc<dyn Fn(T) + Send + Sync>,
    return_timeout: Duration,
    populate: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WarmPool<T> {
    /// Builds the pool and starts the populate thread.
    pub fn new(config: PoolConfig<T>) -> Arc<Self> {
        let (fresh_tx, fresh_rx) = bounded(config.warm_count.max(1));
        let (reusable_tx, reusable_rx) = bounded(config.max_pool.max(1));
        let closed = CancelSource::new();
        let destroy: Arc<dyn Fn(T) + Send + Sync> = Arc::from(config.destroy);

        let pool = Arc::new(WarmPool {
            fresh_rx,
            reusable_tx,
            reusable_rx,
            closed,
            destroy: destroy.clone(),
            return_timeout: config.return_timeout,
            populate: std::sync::Mutex::new(None),
        });

        let factory = config.factory;
        let retry_delay = config.factory_retry_delay;
        let closed_token = pool.closed.token();
        let handle = std::thread::Builder::new()
            .name("sediment-pool-populate".into())
            .spawn(move || {
                Self::populate_loop(factory, fresh_tx, destroy, retry_delay, closed_token)
            })
            .expect("spawn populate thread");
        *pool.populate.lock().unwrap() = Some(handle);
        pool
    }

    fn populate_loop(
        factory: Box<dyn Fn() -> Result<T> + Send + Sync>,
        fresh_tx: Sender<T>,
        destroy: Arc<dyn Fn(T) + Send + Sync>,
        retry_delay: Duration,
        closed: CancelToken,
    ) {
        loop {
            if closed.is_canceled() {
                return;
            }
            let item = match factory() {
                Ok(item) => item,
                Err(e) => {
                    warn!("pool factory failed: {e}; retrying");
                    // Sleep, but leave promptly on close.
                    select! {
                        recv(closed.done()) -> _ => return,
                        default(retry_delay) => continue,
                    }
                }
            };
            let mut item = Some(item);
            select! {
                send(fresh_tx, item.take().expect("item present")) -> res => {
                    if let Err(send_err) = res {
                        destroy(send_err.into_inner());
                        return;
                    }
                }
                recv(closed.done()) -> _ => {
                    if let Some(item) = item.take() {
                        destroy(item);
                    }
                    return;
                }
            }
        }
    }

    /// Takes an item, preferring reusable over fresh; blocks on both when
    /// empty until one delivers, `token` cancels, or the pool closes.
    pub fn get(&self, token: &CancelToken) -> Result<T> {
        if let Ok(item) = self.reusable_rx.try_recv() {
            return Ok(item);
        }
        if let Ok(item) = self.fresh_rx.try_recv() {
            return Ok(item);
        }
        let closed = self.closed.token();
        select! {
            recv(self.reusable_rx) -> res => res.map_err(|_| Error::PoolClosed),
            recv(self.fresh_rx) -> res => res.map_err(|_| Error::PoolClosed),
            recv(token.done()) -> _ => Err(Error::Canceled),
            recv(closed.done()) -> _ => Err(Error::PoolClosed),
        }
    }

    /// Returns an item for reuse. `Ok(true)` when pooled; `Ok(false)` when
    /// the pool was full past `return_timeout` and the item was destroyed;
    /// `Err` on cancel or close (the item is destroyed then too).
    pub fn return_item(&self, item: T, token: &CancelToken) -> Result<bool> {
        let closed = self.closed.token();
        if closed.is_canceled() {
            (self.destroy)(item);
            return Err(Error::PoolClosed);
        }
        let mut item = Some(item);
        select! {
            send(self.reusable_tx, item.take().expect("item present")) -> res => {
                match res {
                    Ok(()) => Ok(true),
                    Err(send_err) => {
                        (self.destroy)(send_err.into_inner());
                        Err(Error::PoolClosed)
                    }
                }
            }
            recv(token.done()) -> _ => {
                (self.destroy)(item.take().expect("item present"));
                Err(Error::Canceled)
            }
            recv(closed.done()) -> _ => {
                (self.destroy)(item.take().expect("item present"));
                Err(Error::PoolClosed)
            }
            default(self.return_timeout) => {
                (self.destroy)(item.take().expect("item present"));
                Ok(false)
            }
        }
    }

    /// Closes the pool: stops the producer, then drains and destroys every
    /// pooled item. Destruction runs to completion regardless of any
    /// caller's cancellation.
    pub fn close(&self) {
        self.closed.cancel();
        if let Some(handle) = self.populate.lock().unwrap().take() {
            let _ = handle.join();
        }
        while let Ok(item) = self.reusable_rx.try_recv() {
            (self.destroy)(item);
        }
        while let Ok(item) = self.fresh_rx.try_recv() {
            (self.destroy)(item);
        }
    }
}

impl<T: Send + 'static> Drop for WarmPool<T> {
    fn drop(&mut self) {
        self.close();
    }
}
