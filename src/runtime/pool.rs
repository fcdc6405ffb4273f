//! Worker pool and per-object serial executor.
//!
//! [`WorkerPool`] is a fixed set of threads draining one FIFO task channel.
//! [`Processor`] layers ordering on top of it: tasks enqueued on the same
//! processor run one at a time in submission order, while different
//! processors run in parallel on the shared pool.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Minimum number of worker threads.
pub const MIN_THREADPOOL_SIZE: usize = 4;

// ============================================================================
// Types
// ============================================================================

/// Unit of work executed by the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// WorkerPool
// ============================================================================

/// Fixed-size pool of worker threads.
///
/// Each submitted task executes exactly once. A panicking task is logged and
/// does not take its worker down.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `max(hardware concurrency, MIN_THREADPOOL_SIZE)` workers.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a thread cannot be spawned.
    pub fn start() -> std::io::Result<Self> {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_threads(cores.max(MIN_THREADPOOL_SIZE))
    }

    /// Spawns exactly `count` workers.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a thread cannot be spawned.
    pub fn with_threads(count: usize) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("wsc worker {index}"))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(handle);
        }

        debug!(threads = count, "Worker pool started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Submits a task.
    ///
    /// Returns `false` if the pool has been joined and the task was dropped.
    pub fn enqueue(&self, task: Task) -> bool {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(task).is_ok(),
            None => {
                trace!("Task dropped: pool joined");
                false
            }
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Drains queued and in-flight tasks, then joins all workers.
    ///
    /// New submissions are rejected once this starts. A worker calling
    /// `join` on its own pool is not joined.
    pub fn join(&self) {
        drop(self.sender.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();

        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked outside a task");
            }
        }

        debug!("Worker pool joined");
    }
}

fn worker_loop(receiver: &Receiver<Task>) {
    while let Ok(task) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("Worker task panicked");
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

struct ProcessorState {
    tasks: VecDeque<Task>,
    pending: bool,
}

struct ProcessorShared {
    pool: Arc<WorkerPool>,
    state: Mutex<ProcessorState>,
    idle: Condvar,
}

/// Serial executor over a [`WorkerPool`].
///
/// At most one task of a processor runs at any time, in submission order.
#[derive(Clone)]
pub struct Processor {
    shared: Arc<ProcessorShared>,
}

impl Processor {
    /// Creates a processor bound to `pool`.
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            shared: Arc::new(ProcessorShared {
                pool,
                state: Mutex::new(ProcessorState {
                    tasks: VecDeque::new(),
                    pending: false,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    /// Enqueues a task behind every previously enqueued one.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        if state.pending {
            state.tasks.push_back(Box::new(task));
            return;
        }

        state.pending = true;
        drop(state);
        self.submit(Box::new(task));
    }

    /// Blocks until every enqueued task has run.
    ///
    /// Must not be called from one of this processor's own tasks.
    pub fn join(&self) {
        let mut state = self.shared.state.lock();
        while state.pending {
            self.shared.idle.wait(&mut state);
        }
    }

    fn submit(&self, task: Task) {
        let this = self.clone();
        let accepted = self.shared.pool.enqueue(Box::new(move || {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("Processor task panicked");
            }
            this.schedule_next();
        }));

        if !accepted {
            let mut state = self.shared.state.lock();
            state.tasks.clear();
            state.pending = false;
            self.shared.idle.notify_all();
        }
    }

    fn schedule_next(&self) {
        let mut state = self.shared.state.lock();
        match state.tasks.pop_front() {
            Some(next) => {
                drop(state);
                self.submit(next);
            }
            None => {
                state.pending = false;
                self.shared.idle.notify_all();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
