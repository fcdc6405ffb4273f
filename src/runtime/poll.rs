//! Single-threaded I/O multiplexer.
//!
//! [`PollService`] owns one dedicated thread that waits for readiness on every
//! registered socket using the `polling` crate. The poller's built-in notifier
//! is the always-registered wake source: every registration change calls
//! [`Poller::notify`] so the loop never sleeps on a stale interest set.
//!
//! # Dispatch
//!
//! ```text
//!   add/remove ──lock──► registrations ──notify──► poll thread
//!                                                   │ wait(timeout)
//!                                                   ▼
//!                              handler(PollEvent::In | Out | Timeout)
//! ```
//!
//! Handlers run on the poll thread and must not block. Registrations use
//! oneshot interest: after a handler returns, the loop re-arms the descriptor
//! with its current direction while still marked as dispatching, so a
//! concurrent [`PollService::remove`] cannot race a re-arm on a closed
//! descriptor. Each registration is armed under its own key rather than the
//! descriptor number, so a ready event collected for a descriptor that was
//! removed and reused in the meantime is dropped instead of dispatched.
//!
//! # Timers
//!
//! The bounded wait also drives one-shot timers registered with
//! [`PollService::schedule`]. They power keep-alive pings, connection and
//! close timeouts. Timer tasks run on the poll thread and must only hand work
//! off, never block.

// ============================================================================
// Imports
// ============================================================================

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use polling::{Event, Events, Poller};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on a single readiness wait.
const MAX_WAIT: Duration = Duration::from_secs(1);

// ============================================================================
// Types
// ============================================================================

/// Readiness interest of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Timeout only.
    #[default]
    None,
    /// Readable.
    In,
    /// Writable.
    Out,
    /// Readable and writable.
    Both,
}

impl Direction {
    fn to_event(self, key: usize) -> Event {
        match self {
            Self::None => Event::none(key),
            Self::In => Event::readable(key),
            Self::Out => Event::writable(key),
            Self::Both => Event::all(key),
        }
    }
}

/// Event delivered to a registration handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// Descriptor is readable.
    In,
    /// Descriptor is writable.
    Out,
    /// No activity within the registration timeout.
    Timeout,
}

/// Registration handler.
pub type PollHandler = Arc<dyn Fn(PollEvent) + Send + Sync>;

/// One-shot timer task.
pub type TimerTask = Box<dyn FnOnce() + Send>;

/// Parameters of a registration.
#[derive(Clone)]
pub struct PollParams {
    /// Readiness interest.
    pub direction: Direction,
    /// Inactivity timeout, reset on every dispatched event.
    pub timeout: Option<Duration>,
    /// Handler invoked on the poll thread.
    pub handler: PollHandler,
}

struct Registration {
    params: PollParams,
    deadline: Option<Instant>,
    /// Poller key, never shared with an earlier registration of the same fd.
    key: usize,
}

#[derive(Default)]
struct Registrations {
    by_fd: FxHashMap<RawFd, Registration>,
    fds: FxHashMap<usize, RawFd>,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    task: TimerTask,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

// ============================================================================
// PollService
// ============================================================================

/// I/O multiplexer with a dedicated thread.
///
/// # Thread Safety
///
/// `PollService` is `Send + Sync`. The registration table is guarded by a
/// lock; handlers are cloned out of it before being called, so a handler may
/// freely add, modify or remove registrations.
pub struct PollService {
    poller: Poller,
    registrations: Mutex<Registrations>,
    next_key: AtomicUsize,
    timers: Mutex<BinaryHeap<Reverse<Timer>>>,
    timer_seq: AtomicU64,
    dispatching: Mutex<Option<RawFd>>,
    dispatch_done: Condvar,
    stopped: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl PollService {
    /// Creates the service and starts its thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the poller or the thread cannot be created.
    pub fn start() -> io::Result<Arc<Self>> {
        let service = Arc::new(Self {
            poller: Poller::new()?,
            registrations: Mutex::new(Registrations::default()),
            next_key: AtomicUsize::new(0),
            timers: Mutex::new(BinaryHeap::new()),
            timer_seq: AtomicU64::new(0),
            dispatching: Mutex::new(None),
            dispatch_done: Condvar::new(),
            stopped: AtomicBool::new(false),
            thread: Mutex::new(None),
            thread_id: Mutex::new(None),
        });

        let runner = Arc::clone(&service);
        let handle = thread::Builder::new()
            .name("wsc poll".into())
            .spawn(move || runner.run())?;

        *service.thread_id.lock() = Some(handle.thread().id());
        *service.thread.lock() = Some(handle);

        debug!("Poll service started");
        Ok(service)
    }

    /// Registers a descriptor, or replaces the parameters of an existing one.
    ///
    /// The caller must keep the descriptor open until [`remove`](Self::remove)
    /// has returned.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the poller rejects the descriptor.
    pub fn add(&self, fd: RawFd, params: PollParams) -> io::Result<()> {
        {
            let mut registrations = self.registrations.lock();
            let deadline = params.timeout.map(|t| Instant::now() + t);

            if let Some(existing) = registrations.by_fd.get_mut(&fd) {
                self.poller.modify(borrow(fd), params.direction.to_event(existing.key))?;
                existing.params = params;
                existing.deadline = deadline;
            } else {
                let key = self.next_key.fetch_add(1, Ordering::Relaxed);
                // SAFETY: the caller keeps `fd` open until `remove` returns,
                // and `remove` deletes it from the poller first.
                unsafe { self.poller.add(fd, params.direction.to_event(key))? };
                registrations.fds.insert(key, fd);
                registrations.by_fd.insert(fd, Registration { params, deadline, key });
            }
        }

        trace!(fd, "Poll registration updated");
        self.interrupt();
        Ok(())
    }

    /// Changes only the direction of an existing registration.
    ///
    /// Does nothing if the descriptor is not registered.
    pub fn set_direction(&self, fd: RawFd, direction: Direction) {
        {
            let mut registrations = self.registrations.lock();
            let Some(registration) = registrations.by_fd.get_mut(&fd) else {
                return;
            };
            if registration.params.direction == direction {
                return;
            }
            registration.params.direction = direction;
            if let Err(e) = self.poller.modify(borrow(fd), direction.to_event(registration.key)) {
                warn!(fd, error = %e, "Failed to modify poll interest");
            }
        }

        trace!(fd, ?direction, "Poll direction changed");
        self.interrupt();
    }

    /// Deregisters a descriptor.
    ///
    /// Blocks until any in-flight handler for `fd` has returned, unless called
    /// from the poll thread itself. After this returns the descriptor may be
    /// closed.
    pub fn remove(&self, fd: RawFd) {
        {
            let mut registrations = self.registrations.lock();
            let Some(registration) = registrations.by_fd.remove(&fd) else {
                return;
            };
            registrations.fds.remove(&registration.key);
            if let Err(e) = self.poller.delete(borrow(fd)) {
                warn!(fd, error = %e, "Failed to delete poll registration");
            }
        }

        if !self.is_poll_thread() {
            let mut dispatching = self.dispatching.lock();
            while *dispatching == Some(fd) {
                self.dispatch_done.wait(&mut dispatching);
            }
        }

        trace!(fd, "Poll registration removed");
        self.interrupt();
    }

    /// Schedules a one-shot task at `deadline`.
    pub fn schedule(&self, deadline: Instant, task: TimerTask) {
        let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().push(Reverse(Timer {
            deadline,
            seq,
            task,
        }));
        self.interrupt();
    }

    /// Schedules a one-shot task after `delay`.
    #[inline]
    pub fn schedule_in(&self, delay: Duration, task: TimerTask) {
        self.schedule(Instant::now() + delay, task);
    }

    /// Number of registered descriptors.
    #[inline]
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.lock().by_fd.len()
    }

    /// Returns `true` if the caller runs on the poll thread.
    #[must_use]
    pub fn is_poll_thread(&self) -> bool {
        *self.thread_id.lock() == Some(thread::current().id())
    }

    /// Stops the loop and joins its thread.
    ///
    /// Pending timers are dropped without running.
    pub fn join(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.interrupt();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Poll thread panicked");
            }
        }

        self.timers.lock().clear();
        debug!("Poll service joined");
    }

    /// Wakes the blocked readiness wait.
    fn interrupt(&self) {
        if let Err(e) = self.poller.notify() {
            warn!(error = %e, "Failed to interrupt poll");
        }
    }
}

// ============================================================================
// PollService - Loop
// ============================================================================

impl PollService {
    fn run(self: Arc<Self>) {
        debug!("Poll loop started");
        let mut events = Events::new();

        while !self.stopped.load(Ordering::SeqCst) {
            let timeout = self.next_timeout();
            events.clear();

            if let Err(e) = self.poller.wait(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll wait failed");
                break;
            }

            let ready: Vec<(usize, bool, bool)> = events
                .iter()
                .map(|event| (event.key, event.readable, event.writable))
                .collect();

            for (key, readable, writable) in ready {
                self.dispatch(key, readable, writable);
            }

            self.expire_registrations();
            self.run_timers();
        }

        debug!("Poll loop terminated");
    }

    /// Computes the wait bound from registration deadlines and timers.
    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut next = now + MAX_WAIT;

        for registration in self.registrations.lock().by_fd.values() {
            if let Some(deadline) = registration.deadline {
                next = next.min(deadline);
            }
        }

        if let Some(Reverse(timer)) = self.timers.lock().peek() {
            next = next.min(timer.deadline);
        }

        next.saturating_duration_since(now)
    }

    /// Runs the handler of the registration armed under `key`. Events for a
    /// key whose registration is gone are stale and dropped.
    fn dispatch(&self, key: usize, readable: bool, writable: bool) {
        let (fd, handler) = {
            let mut registrations = self.registrations.lock();
            let Some(&fd) = registrations.fds.get(&key) else {
                trace!(key, "Dropping stale poll event");
                return;
            };
            let Some(registration) = registrations.by_fd.get_mut(&fd) else {
                return;
            };
            registration.deadline = registration.params.timeout.map(|t| Instant::now() + t);
            *self.dispatching.lock() = Some(fd);
            (fd, Arc::clone(&registration.params.handler))
        };

        if readable {
            handler(PollEvent::In);
        }
        if writable {
            handler(PollEvent::Out);
        }

        self.rearm_and_release(fd);
    }

    /// Re-arms a oneshot registration, then clears the dispatching mark.
    fn rearm_and_release(&self, fd: RawFd) {
        {
            let registrations = self.registrations.lock();
            if let Some(registration) = registrations.by_fd.get(&fd) {
                let event = registration.params.direction.to_event(registration.key);
                if let Err(e) = self.poller.modify(borrow(fd), event) {
                    warn!(fd, error = %e, "Failed to re-arm poll registration");
                }
            }
        }

        *self.dispatching.lock() = None;
        self.dispatch_done.notify_all();
    }

    fn expire_registrations(&self) {
        let now = Instant::now();
        let expired: Vec<RawFd> = self
            .registrations
            .lock()
            .by_fd
            .iter()
            .filter(|(_, r)| r.deadline.is_some_and(|d| d <= now))
            .map(|(fd, _)| *fd)
            .collect();

        for fd in expired {
            let handler = {
                let mut registrations = self.registrations.lock();
                let Some(registration) = registrations.by_fd.get_mut(&fd) else {
                    continue;
                };
                registration.deadline = registration.params.timeout.map(|t| now + t);
                *self.dispatching.lock() = Some(fd);
                Arc::clone(&registration.params.handler)
            };

            trace!(fd, "Poll registration timed out");
            handler(PollEvent::Timeout);

            *self.dispatching.lock() = None;
            self.dispatch_done.notify_all();
        }
    }

    fn run_timers(&self) {
        let now = Instant::now();
        loop {
            let task = {
                let mut timers = self.timers.lock();
                match timers.peek() {
                    Some(Reverse(timer)) if timer.deadline <= now => {
                        timers.pop().map(|Reverse(timer)| timer.task)
                    }
                    _ => None,
                }
            };

            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

#[inline]
fn borrow<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // SAFETY: only called for descriptors that are registered, which the
    // owner keeps open until `remove` has returned.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

// ============================================================================
// Tests
// ============================================================================
