//! Shared execution runtime.
//!
//! This module provides the process-wide machinery every connection runs on:
//!
//! - [`PollService`]: single I/O thread dispatching socket readiness and timers
//! - [`WorkerPool`]: fixed worker threads executing user callbacks
//! - [`Processor`]: per-connection serial executor over the pool
//! - [`Context`]: reference-counted ownership of all of the above
//!
//! # Threading
//!
//! ```text
//! ┌──────────────┐  readiness   ┌──────────────┐  enqueue   ┌──────────────┐
//! │ OS sockets   │ ───────────► │ PollService  │ ─────────► │ WorkerPool   │
//! └──────────────┘              │ (1 thread)   │            │ (N threads)  │
//!                               └──────────────┘            └──────────────┘
//! ```
//!
//! Poll handlers never block. Anything user-visible crosses to the pool
//! through a [`Processor`], which keeps events of one connection in order.

// ============================================================================
// Submodules
// ============================================================================

/// Global context token and teardown signal.
pub mod context;

/// Readiness loop and timers.
pub mod poll;

/// Worker pool and serial executor.
pub mod pool;

// ============================================================================
// Re-exports
// ============================================================================

pub use context::{CleanupSignal, Context, ContextToken};
pub use poll::{Direction, PollEvent, PollHandler, PollParams, PollService, TimerTask};
pub use pool::{MIN_THREADPOOL_SIZE, Processor, Task, WorkerPool};
