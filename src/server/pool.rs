//! Self-scaling worker pool.
//!
//! All media servers share one pool of OS threads draining a single
//! unbounded FIFO queue. The pool grows when workers are nearly all busy or
//! work is piling up, and shrinks back towards `max_workers` as workers
//! finish items. Worker counts are plain atomics; the channel is the only
//! other synchronization point.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    ShutDown,
}

enum Task<J> {
    Run(J),
    Exit,
}

struct PoolShared<J> {
    tx: Sender<Task<J>>,
    rx: Receiver<Task<J>>,
    handler: Box<dyn Fn(J) + Send + Sync>,
    max_workers: usize,
    alive: AtomicUsize,
    busy: AtomicUsize,
    terminating: AtomicBool,
    next_id: AtomicUsize,
    completed: AtomicU64,
}

/// Shared handle to the pool. Clones submit to the same queue.
pub struct WorkerPool<J> {
    shared: Arc<PoolShared<J>>,
}

impl<J> Clone for WorkerPool<J> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Create an empty pool; no threads are started until work arrives
    /// or [`ensure_worker`](Self::ensure_worker) is called.
    pub fn new<F>(max_workers: usize, handler: F) -> Self
    where
        F: Fn(J) + Send + Sync + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(PoolShared {
                tx,
                rx,
                handler: Box::new(handler),
                max_workers: max_workers.max(1),
                alive: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                terminating: AtomicBool::new(false),
                next_id: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    /// Queue a job. Starts a worker if none is alive.
    pub fn submit(&self, job: J) -> Result<(), PoolError> {
        if self.shared.terminating.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }
        self.shared
            .tx
            .send(Task::Run(job))
            .map_err(|_| PoolError::ShutDown)?;
        self.ensure_worker();
        Ok(())
    }

    /// Spawn one worker if none are alive.
    pub fn ensure_worker(&self) {
        if self.shared.terminating.load(Ordering::Acquire) {
            return;
        }
        if self
            .shared
            .alive
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            start_worker(&self.shared);
        }
    }

    /// Stop growing and ask every live worker to exit once the items queued
    /// ahead of the exit message are done. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        let alive = self.shared.alive.load(Ordering::Acquire);
        log::debug!("Worker pool shutting down ({} workers alive)", alive);
        for _ in 0..alive {
            let _ = self.shared.tx.send(Task::Exit);
        }
    }

    pub fn alive(&self) -> usize {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.rx.len()
    }

    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    /// Number of jobs that have run to completion (panicked ones included).
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.terminating.load(Ordering::Acquire)
    }
}

/// Spawn a worker thread. The caller has already counted it in `alive`.
fn start_worker<J: Send + 'static>(shared: &Arc<PoolShared<J>>) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let worker_shared = Arc::clone(shared);
    let spawned = std::thread::Builder::new()
        .name(format!("media-worker-{}", id))
        .spawn(move || worker_loop(worker_shared, id));

    match spawned {
        Ok(_) => log::debug!("Worker {} started", id),
        Err(e) => {
            shared.alive.fetch_sub(1, Ordering::AcqRel);
            log::error!("Failed to spawn worker {}: {}", id, e);
        }
    }
}

fn grow_if_needed<J: Send + 'static>(shared: &Arc<PoolShared<J>>, busy: usize) {
    if shared.terminating.load(Ordering::Acquire) {
        return;
    }
    let alive = shared.alive.load(Ordering::Acquire);
    if needs_worker(alive, busy, shared.max_workers, shared.rx.len()) {
        shared.alive.fetch_add(1, Ordering::AcqRel);
        start_worker(shared);
    }
}

/// Grow when at least 80% of workers are busy, or when items are backing
/// up and the pool is below `max_workers`.
fn needs_worker(alive: usize, busy: usize, max_workers: usize, queued: usize) -> bool {
    let saturated = busy * 5 >= alive * 4;
    let backlog = alive < max_workers && queued > 1;
    saturated || backlog
}

/// True if this worker should exit to bring the pool back to `max_workers`.
///
/// Concurrent checks may briefly take `alive` below the limit before the
/// losing worker re-increments.
fn should_retire<J>(shared: &PoolShared<J>) -> bool {
    if shared.alive.load(Ordering::Acquire) <= shared.max_workers {
        return false;
    }
    let before = shared.alive.fetch_sub(1, Ordering::AcqRel);
    if before > shared.max_workers {
        return true;
    }
    shared.alive.fetch_add(1, Ordering::AcqRel);
    false
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn worker_loop<J: Send + 'static>(shared: Arc<PoolShared<J>>, id: usize) {
    loop {
        let job = match shared.rx.recv() {
            Ok(Task::Run(job)) => job,
            Ok(Task::Exit) | Err(_) => break,
        };

        let busy = shared.busy.fetch_add(1, Ordering::AcqRel) + 1;
        grow_if_needed(&shared, busy);

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (shared.handler)(job))) {
            log::error!("Worker {} job panicked: {}", id, panic_message(&*payload));
        }

        shared.busy.fetch_sub(1, Ordering::AcqRel);
        shared.completed.fetch_add(1, Ordering::AcqRel);

        if should_retire(&shared) {
            log::debug!("Worker {} retiring (pool above limit)", id);
            return;
        }
    }

    shared.alive.fetch_sub(1, Ordering::AcqRel);
    log::debug!("Worker {} exited", id);
}
