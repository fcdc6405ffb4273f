//! WebSocket client - Embeddable, poll-driven WebSocket connections.
//!
//! This library connects to `ws://` and `wss://` servers, optionally through
//! an HTTP CONNECT proxy, and delivers events through callbacks executed on
//! a shared worker pool.
//!
//! # Architecture
//!
//! Every connection is a chain of transports sharing one process-wide
//! runtime:
//!
//! - **PollService**: one thread waits on every socket and runs timers
//! - **WorkerPool**: fixed threads run user callbacks, in order per connection
//! - **Transport chain**: TCP, optional proxy tunnel, optional TLS, framing
//!
//! Key design principles:
//!
//! - I/O handlers never block and never call user code directly
//! - Each layer owns the layer beneath it
//! - Failures are terminal: error callback, then closed callback
//! - The runtime lives while any connection or [`ContextToken`] exists
//!
//! # Quick Start
//!
//! ```no_run
//! use wsclient::{MessageData, Result, WebSocket, WebSocketConfig};
//!
//! fn main() -> Result<()> {
//!     let config = WebSocketConfig::default().with_protocol("chat");
//!     let ws = WebSocket::new(config)?;
//!
//!     ws.on_open(|| println!("Connected"));
//!     ws.on_message(|message| {
//!         if let MessageData::Text(text) = message {
//!             println!("Received: {text}");
//!         }
//!     });
//!     ws.on_error(|error| eprintln!("Error: {error}"));
//!
//!     ws.open("wss://echo.example.com/")?;
//!     ws.send("hello")?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`websocket`] | [`WebSocket`] connection and [`ReadyState`] |
//! | [`handle`] | Integer-id [`Registry`] for embedders |
//! | [`config`] | [`WebSocketConfig`] and [`ProxyServer`] |
//! | [`error`] | Error types, [`Result`] alias and status codes |
//! | [`message`] | Message types |
//! | [`channel`] | Callback and inbound queue plumbing (internal) |
//! | [`transport`] | Transport chain (internal) |
//! | [`protocol`] | Handshake and frame codec (internal) |
//! | [`runtime`] | Poll loop, worker pool and global context |
//! | [`queue`] | Bounded FIFO queue |

// ============================================================================
// Modules
// ============================================================================

/// Event delivery for one connection.
///
/// Holds user callbacks, stored lifecycle events and the inbound queue.
pub mod channel;

/// Connection configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Integer-handle registry.
pub mod handle;

/// Message types shared by every layer.
pub mod message;

/// Wire formats: HTTP head parsing, handshake, frames.
pub mod protocol;

/// Bounded FIFO queue.
pub mod queue;

/// Shared execution runtime.
///
/// Poll thread, worker pool, serial processors and the global context.
pub mod runtime;

/// Transport chain.
pub mod transport;

/// WebSocket connection state machine.
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

// ============================================================================
// Re-exports
// ============================================================================

// Connection types
pub use websocket::{ReadyState, Received, WebSocket};

// Registry
pub use handle::Registry;

// Configuration types
pub use config::{ProxyKind, ProxyServer, SctpSettings, ServerConfig, WebSocketConfig};

// Error types
pub use error::{ERR_FAILURE, ERR_INVALID, ERR_NOT_AVAIL, ERR_SUCCESS, ERR_TOO_SMALL, Error, Result};

// Message types
pub use message::{FrameInfo, Message, MessageData, MessageKind};

// Queue types
pub use queue::{Queue, QueueError, QueueLimit};

// Runtime types
pub use runtime::{CleanupSignal, Context, ContextToken};
