//! Wire formats spoken over the transport chain.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `http` | HTTP/1.1 response head parsing |
//! | `handshake` | WebSocket opening handshake |
//! | `frame` | RFC 6455 frame codec |

// ============================================================================
// Submodules
// ============================================================================

/// RFC 6455 frame codec.
pub mod frame;

/// WebSocket opening handshake.
pub mod handshake;

/// HTTP/1.1 head parsing.
pub mod http;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::{Frame, FrameError, Opcode, close_code};
pub use handshake::{Handshake, accept_key};
