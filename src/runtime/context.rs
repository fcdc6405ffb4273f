//! Global context token.
//!
//! The poll service, the worker pool and the TLS crypto provider are shared
//! by every connection in the process. They live in one reference-counted
//! context: the first [`Context::acquire`] starts them, and dropping the last
//! [`ContextToken`] tears them down on a background thread.
//!
//! Teardown progress is observable through a [`CleanupSignal`]. Waiting on it
//! past a deadline yields [`Error::CleanupTimeout`], which indicates a leaked
//! connection or a deadlock and is reported distinctly from connection
//! errors.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use wsclient::Context;
//!
//! Context::preload()?;
//! // ... create and use WebSockets ...
//! Context::cleanup().wait_timeout(Duration::from_secs(10))?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, const_mutex};
use rustls::crypto::CryptoProvider;
use tracing::{debug, error, info};

use crate::config::SctpSettings;
use crate::error::{Error, Result};

use super::poll::PollService;
use super::pool::WorkerPool;

// ============================================================================
// Global State
// ============================================================================

static GLOBAL: ContextSlot = ContextSlot::new();

/// Entry point for process-wide context management.
pub struct Context;

impl Context {
    /// Returns a token for the shared context, starting it if needed.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the poll thread or a worker cannot be spawned.
    pub fn acquire() -> Result<ContextToken> {
        GLOBAL.acquire()
    }

    /// Starts the shared context and keeps it alive until [`cleanup`](Self::cleanup).
    ///
    /// # Errors
    ///
    /// Returns an IO error if the context cannot be started.
    pub fn preload() -> Result<()> {
        GLOBAL.preload()
    }

    /// Releases the preloaded token and returns the teardown signal.
    ///
    /// The signal completes once every token is gone and teardown finished.
    #[must_use]
    pub fn cleanup() -> CleanupSignal {
        GLOBAL.cleanup()
    }

    /// Stores SCTP settings for the next initialisation.
    pub fn set_sctp_settings(settings: SctpSettings) {
        GLOBAL.set_sctp_settings(settings);
    }

    /// Returns the stored SCTP settings.
    #[must_use]
    pub fn sctp_settings() -> SctpSettings {
        GLOBAL.sctp_settings()
    }

    /// The process-wide slot behind the associated functions.
    pub(crate) fn global() -> &'static ContextSlot {
        &GLOBAL
    }
}

// ============================================================================
// ContextSlot
// ============================================================================

struct SlotState {
    weak: Weak<ContextInner>,
    preloaded: Option<ContextToken>,
    cleanup: Option<CleanupSignal>,
    sctp: Option<SctpSettings>,
}

/// Holder of one lazily started context.
pub(crate) struct ContextSlot {
    state: Mutex<SlotState>,
}

impl ContextSlot {
    pub(crate) const fn new() -> Self {
        Self {
            state: const_mutex(SlotState {
                weak: Weak::new(),
                preloaded: None,
                cleanup: None,
                sctp: None,
            }),
        }
    }

    pub(crate) fn acquire(&self) -> Result<ContextToken> {
        let mut state = self.state.lock();
        if let Some(inner) = state.weak.upgrade() {
            return Ok(ContextToken(inner));
        }

        let signal = CleanupSignal::pending();
        let inner = Arc::new(ContextInner::start(signal.clone())?);
        state.weak = Arc::downgrade(&inner);
        state.cleanup = Some(signal);
        Ok(ContextToken(inner))
    }

    pub(crate) fn preload(&self) -> Result<()> {
        let token = self.acquire()?;
        let previous = self.state.lock().preloaded.replace(token);
        drop(previous);
        Ok(())
    }

    pub(crate) fn cleanup(&self) -> CleanupSignal {
        let (released, signal) = {
            let mut state = self.state.lock();
            let signal = state
                .cleanup
                .clone()
                .unwrap_or_else(CleanupSignal::completed);
            (state.preloaded.take(), signal)
        };
        drop(released);
        signal
    }

    pub(crate) fn set_sctp_settings(&self, settings: SctpSettings) {
        self.state.lock().sctp = Some(settings);
    }

    pub(crate) fn sctp_settings(&self) -> SctpSettings {
        self.state.lock().sctp.clone().unwrap_or_default()
    }
}

// ============================================================================
// ContextToken
// ============================================================================

struct ContextInner {
    poll: Arc<PollService>,
    pool: Arc<WorkerPool>,
    crypto: Arc<CryptoProvider>,
    signal: CleanupSignal,
}

impl ContextInner {
    fn start(signal: CleanupSignal) -> Result<Self> {
        debug!("Global initialization");
        let pool = Arc::new(WorkerPool::start()?);
        let poll = match PollService::start() {
            Ok(poll) => poll,
            Err(e) => {
                pool.join();
                return Err(e.into());
            }
        };
        let crypto = Arc::new(rustls::crypto::ring::default_provider());

        info!(threads = pool.thread_count(), "Context started");
        Ok(Self {
            poll,
            pool,
            crypto,
            signal,
        })
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let pool = Arc::clone(&self.pool);
        let poll = Arc::clone(&self.poll);
        let signal = self.signal.clone();

        let spawned = thread::Builder::new()
            .name("wsc cleanup".into())
            .spawn(move || {
                debug!("Global cleanup");
                pool.join();
                poll.join();
                info!("Context cleaned up");
                signal.complete();
            });

        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn cleanup thread");
        }
    }
}

/// Reference-counted handle to the shared context.
///
/// Cloning is cheap. The context stays alive while any token exists.
#[derive(Clone)]
pub struct ContextToken(Arc<ContextInner>);

impl ContextToken {
    /// The I/O multiplexer.
    #[inline]
    #[must_use]
    pub fn poll(&self) -> &Arc<PollService> {
        &self.0.poll
    }

    /// The worker pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.0.pool
    }

    /// The TLS crypto provider.
    #[inline]
    #[must_use]
    pub fn crypto(&self) -> &Arc<CryptoProvider> {
        &self.0.crypto
    }

    /// Returns `true` if both tokens refer to the same context.
    #[inline]
    #[must_use]
    pub fn same_context(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextToken")
            .field("refs", &Arc::strong_count(&self.0))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// CleanupSignal
// ============================================================================

struct SignalInner {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Completion signal of an asynchronous context teardown.
#[derive(Clone)]
pub struct CleanupSignal {
    inner: Arc<SignalInner>,
}

impl CleanupSignal {
    fn with_state(done: bool) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                done: Mutex::new(done),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn pending() -> Self {
        Self::with_state(false)
    }

    pub(crate) fn completed() -> Self {
        Self::with_state(true)
    }

    pub(crate) fn complete(&self) {
        *self.inner.done.lock() = true;
        self.inner.cond.notify_all();
    }

    /// Returns `true` once teardown has finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Blocks until teardown has finished.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cond.wait(&mut done);
        }
    }

    /// Blocks until teardown has finished or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CleanupTimeout`] if teardown is still running at the
    /// deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock();
        while !*done {
            if self.inner.cond.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }

        if *done {
            Ok(())
        } else {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            error!(timeout_ms, "Cleanup timeout (possible deadlock or leaked object)");
            Err(Error::cleanup_timeout(timeout_ms))
        }
    }
}

impl fmt::Debug for CleanupSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupSignal")
            .field("complete", &self.is_complete())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_shares_context() {
        let slot = ContextSlot::new();
        let a = slot.acquire().expect("acquire");
        let b = slot.acquire().expect("acquire");
        assert!(a.same_context(&b));
        drop((a, b));
        slot.cleanup()
            .wait_timeout(Duration::from_secs(10))
            .expect("cleanup");
    }

    #[test]
    fn test_cleanup_without_init_is_complete() {
        let slot = ContextSlot::new();
        assert!(slot.cleanup().is_complete());
    }

    #[test]
    fn test_preload_keeps_context_alive() {
        let slot = ContextSlot::new();
        slot.preload().expect("preload");

        let token = slot.acquire().expect("acquire");
        let weak = Arc::downgrade(&token.0);
        drop(token);
        assert!(weak.upgrade().is_some());

        let signal = slot.cleanup();
        signal.wait_timeout(Duration::from_secs(10)).expect("cleanup");
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_leaked_token_times_out() {
        let slot = ContextSlot::new();
        let leaked = slot.acquire().expect("acquire");

        let err = slot
            .cleanup()
            .wait_timeout(Duration::from_millis(50))
            .expect_err("must time out");
        assert!(err.is_fatal());
        assert!(matches!(err, Error::CleanupTimeout { timeout_ms: 50 }));

        drop(leaked);
        slot.cleanup()
            .wait_timeout(Duration::from_secs(10))
            .expect("cleanup after release");
    }

    #[test]
    fn test_reacquire_after_cleanup_starts_fresh() {
        let slot = ContextSlot::new();
        let first = slot.acquire().expect("acquire");
        let first_pool = Arc::clone(first.pool());
        drop(first);
        slot.cleanup().wait_timeout(Duration::from_secs(10)).expect("cleanup");

        let second = slot.acquire().expect("reacquire");
        assert!(!Arc::ptr_eq(&first_pool, second.pool()));
        drop(second);
        slot.cleanup().wait_timeout(Duration::from_secs(10)).expect("cleanup");
    }

    #[test]
    fn test_sctp_settings_stored() {
        let slot = ContextSlot::new();
        assert_eq!(slot.sctp_settings(), SctpSettings::default());
        slot.set_sctp_settings(SctpSettings {
            max_burst: Some(4),
            ..Default::default()
        });
        assert_eq!(slot.sctp_settings().max_burst, Some(4));
    }

    #[test]
    fn test_tokens_run_pool_tasks() {
        let slot = ContextSlot::new();
        let token = slot.acquire().expect("acquire");
        let (tx, rx) = std::sync::mpsc::channel();
        token.pool().enqueue(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        drop(token);
        slot.cleanup().wait_timeout(Duration::from_secs(10)).expect("cleanup");
    }
}
