//! Bounded worker pool for cache write-backs.
//!
//! Publication jobs run on a small rayon pool. Admission is bounded by an
//! [`AdjustableSemaphore`]: a submission holds one permit from queue time
//! until its job finishes, so at most `depth` jobs are queued or running and
//! a write-back storm blocks the submitter instead of growing memory.
//! [`WaitCounter`] tracks in-flight jobs for [`drain`].
//!
//! [`drain`]: WritebackPool::drain

use std::sync::Arc;

use rayon::ThreadPool as RayonPool;

use crate::sync::cancel::CancelToken;
use crate::sync::counter::WaitCounter;
use crate::sync::semaphore::AdjustableSemaphore;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WritebackPool {
    pool: RayonPool,
    /// One permit per queued-or-running job.
    slots: Arc<AdjustableSemaphore>,
    pending: Arc<WaitCounter>,
}

impl WritebackPool {
    pub fn new(workers: usize, depth: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("sediment-writeback-{i}"))
            .build()
            .expect("build writeback pool");

        WritebackPool {
            pool,
            slots: Arc::new(AdjustableSemaphore::new(depth.max(1) as u64)),
            pending: Arc::new(WaitCounter::new()),
        }
    }

    /// Queues `job`, blocking while `depth` jobs are already in flight.
    pub fn submit(&self, job: Job) {
        // Cleanup work is never canceled; the permit is held until the job
        // finishes.
        self.slots
            .acquire(1, &CancelToken::never())
            .expect("never token does not cancel");
        self.pending.add(1);

        let slots = self.slots.clone();
        let pending = self.pending.clone();
        self.pool.spawn(move || {
            job();
            slots.release(1);
            pending.done();
        });
    }

    /// Blocks until all submitted jobs finished. The pool stays usable.
    pub fn drain(&self) {
        self.pending
            .wait(&CancelToken::never())
            .expect("never token does not cancel");
    }
}
