//! A fixed pool of worker threads that fans out one batch at a time.
//!
//! [`WorkerPool`] wraps a dedicated `rayon` thread pool. [`WorkerPool::run`]
//! hands a batch of actions to the pool with `install` and `par_iter`, and
//! blocks the calling thread until every action has finished.
//!
//! The pool accepts one batch at a time. A second caller (including an
//! action trying to fan out from inside the pool) is refused with `false`
//! and is expected to run its actions itself.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::plan::Action;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Busy flag
// ---------------------------------------------------------------------------

/// Clears the busy flag when the batch ends, even by unwinding.
struct Claim<'a>(&'a AtomicBool);

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// A dedicated `rayon` pool with single-batch admission.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    busy: AtomicBool,
    disposed: AtomicBool,
}

impl WorkerPool {
    /// Build a pool with `threads` workers.
    pub fn new(threads: usize) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("entia-worker-{index}"))
            .build()?;
        tracing::debug!(threads = pool.current_num_threads(), "started worker pool");
        Ok(Self {
            pool,
            busy: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run every action and block until all have finished.
    ///
    /// Returns `false` without running anything if another batch is in
    /// flight or the pool is disposed. If an action panics, the remaining
    /// actions still run and the first panic is resumed here afterwards.
    pub fn run(&self, actions: &[Action]) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        let claim = Claim(&self.busy);

        let panic: Mutex<Option<Box<dyn Any + Send>>> = Mutex::new(None);
        self.pool.install(|| {
            actions.par_iter().with_max_len(1).for_each(|action| {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action())) {
                    // Keep the first panic; later ones are dropped.
                    panic.lock().get_or_insert(payload);
                }
            });
        });
        drop(claim);

        if let Some(payload) = panic.into_inner() {
            panic::resume_unwind(payload);
        }
        true
    }

    /// Stop accepting batches. The threads exit when the pool is dropped.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!("disposed worker pool");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
