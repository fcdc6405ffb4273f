//! Error types for the WebSocket client.
//!
//! This module defines all error types used throughout the crate, and the
//! integer codes the embedding surface reports for them.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use wsclient::{Result, WebSocket, WebSocketConfig};
//!
//! fn example() -> Result<()> {
//!     let ws = WebSocket::new(WebSocketConfig::default())?;
//!     ws.open("ws://127.0.0.1:8080/chat")?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Code |
//! |----------|----------|------|
//! | Caller | [`Error::InvalidArgument`], [`Error::Config`] | [`ERR_INVALID`] |
//! | Availability | [`Error::NotAvailable`] | [`ERR_NOT_AVAIL`] |
//! | Buffer | [`Error::BufferTooSmall`] | [`ERR_TOO_SMALL`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::QueueFull`] | [`ERR_FAILURE`] |
//! | Protocol | [`Error::Handshake`], [`Error::Proxy`], [`Error::Tls`], [`Error::Certificate`] | [`ERR_FAILURE`] |
//! | Teardown | [`Error::CleanupTimeout`] | [`ERR_FAILURE`] (fatal) |
//! | External | [`Error::Io`], [`Error::Url`], [`Error::Rustls`] | mixed |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Embedding Codes
// ============================================================================

/// Operation succeeded.
pub const ERR_SUCCESS: i32 = 0;

/// Invalid argument (bad handle, malformed URL, missing input).
pub const ERR_INVALID: i32 = -1;

/// Runtime failure (network, TLS, handshake).
pub const ERR_FAILURE: i32 = -2;

/// Element not available (no inbound message ready).
pub const ERR_NOT_AVAIL: i32 = -3;

/// Caller buffer too small.
pub const ERR_TOO_SMALL: i32 = -4;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Caller Errors
    // ========================================================================
    /// Invalid argument.
    ///
    /// Returned for unknown handles, malformed URLs and missing inputs.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Configuration error.
    ///
    /// Returned when a [`WebSocketConfig`](crate::WebSocketConfig) is invalid
    /// or references unusable files.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// No inbound message is ready.
    #[error("No message available")]
    NotAvailable,

    /// Caller buffer is smaller than the pending message.
    ///
    /// The message stays queued; retry with at least `required` bytes.
    #[error("Buffer too small: {required} bytes required")]
    BufferTooSmall {
        /// Number of bytes the caller must provide.
        required: usize,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Network-level connection failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection establishment exceeded its deadline.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Operation attempted on a closed connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue is at capacity.
    ///
    /// The caller must apply backpressure and retry later.
    #[error("Send queue full (limit {limit})")]
    QueueFull {
        /// Configured queue limit.
        limit: usize,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// WebSocket opening handshake failure.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    /// HTTP CONNECT tunnel failure.
    #[error("Proxy error: {message}")]
    Proxy {
        /// Description of the proxy failure.
        message: String,
    },

    /// TLS negotiation failure.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the TLS failure.
        message: String,
    },

    /// Peer certificate rejected (chain or hostname).
    #[error("Certificate error: {message}")]
    Certificate {
        /// Description of the verification failure.
        message: String,
    },

    // ========================================================================
    // Teardown Errors
    // ========================================================================
    /// Global cleanup did not finish within its deadline.
    ///
    /// Indicates a leaked connection or a deadlock. This is fatal and is
    /// never produced by an individual connection.
    #[error("Cleanup timeout after {timeout_ms}ms (possible deadlock or leaked object)")]
    CleanupTimeout {
        /// Milliseconds waited before giving up.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// TLS engine error.
    #[error("TLS engine error: {0}")]
    Rustls(#[from] rustls::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(required: usize) -> Self {
        Self::BufferTooSmall { required }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a queue full error.
    #[inline]
    pub fn queue_full(limit: usize) -> Self {
        Self::QueueFull { limit }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a proxy error.
    #[inline]
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates a certificate error.
    #[inline]
    pub fn certificate(message: impl Into<String>) -> Self {
        Self::Certificate {
            message: message.into(),
        }
    }

    /// Creates a cleanup timeout error.
    #[inline]
    pub fn cleanup_timeout(timeout_ms: u64) -> Self {
        Self::CleanupTimeout { timeout_ms }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::CleanupTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Io(_)
        )
    }

    /// Returns `true` if this error came from TLS negotiation or verification.
    #[inline]
    #[must_use]
    pub fn is_tls_error(&self) -> bool {
        matches!(
            self,
            Self::Tls { .. } | Self::Certificate { .. } | Self::Rustls(_)
        )
    }

    /// Returns `true` for errors that indicate a leak or deadlock.
    ///
    /// Fatal errors must be surfaced separately from per-connection errors.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CleanupTimeout { .. })
    }

    /// Returns the embedding error code for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } | Self::Config { .. } | Self::Url(_) => ERR_INVALID,
            Self::NotAvailable => ERR_NOT_AVAIL,
            Self::BufferTooSmall { .. } => ERR_TOO_SMALL,
            _ => ERR_FAILURE,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_buffer_too_small_display() {
        let err = Error::buffer_too_small(42);
        assert_eq!(err.to_string(), "Buffer too small: 42 bytes required");
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::invalid_argument("x").code(), ERR_INVALID);
        assert_eq!(Error::config("x").code(), ERR_INVALID);
        assert_eq!(Error::NotAvailable.code(), ERR_NOT_AVAIL);
        assert_eq!(Error::buffer_too_small(1).code(), ERR_TOO_SMALL);
        assert_eq!(Error::handshake("x").code(), ERR_FAILURE);
        assert_eq!(Error::ConnectionClosed.code(), ERR_FAILURE);
        assert_eq!(Error::cleanup_timeout(10).code(), ERR_FAILURE);
    }

    #[test]
    fn test_is_fatal() {
        assert!(Error::cleanup_timeout(10_000).is_fatal());
        assert!(!Error::connection_timeout(10_000).is_fatal());
        assert!(!Error::handshake("bad accept").is_fatal());
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::connection_timeout(5000).is_timeout());
        assert!(!Error::connection("test").is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(!Error::config("test").is_connection_error());
    }

    #[test]
    fn test_is_tls_error() {
        assert!(Error::certificate("expired").is_tls_error());
        assert!(Error::tls("alert").is_tls_error());
        assert!(!Error::proxy("403").is_tls_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.code(), ERR_FAILURE);
    }

    #[test]
    fn test_from_url_error() {
        let url_err = url::Url::parse("not a url").unwrap_err();
        let err: Error = url_err.into();
        assert!(matches!(err, Error::Url(_)));
        assert_eq!(err.code(), ERR_INVALID);
    }
}
