//! Byte-stream transport chain.
//!
//! A connection is a linear stack of transports. Each layer implements
//! [`Transport`] and exclusively owns the layer beneath it:
//!
//! ```text
//! ┌─────────────────┐
//! │  WsTransport    │  frames, handshake, keep-alive
//! ├─────────────────┤
//! │  TlsTransport   │  optional, rustls
//! ├─────────────────┤
//! │ HttpProxy       │  optional, CONNECT tunnel
//! ├─────────────────┤
//! │  TcpTransport   │  socket, registered with the PollService
//! └─────────────────┘
//! ```
//!
//! Outgoing messages travel down through [`Transport::send`]. Incoming data
//! travels up through the [`RecvCallback`] the upper layer installed with
//! [`Transport::on_recv`]; `None` signals end of stream. State changes are
//! reported through a [`StateCallback`] given at construction.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `tcp` | Non-blocking TCP with sequential address fallback |
//! | `proxy` | HTTP CONNECT tunnel |
//! | `tls` | TLS client, with or without verification |
//! | `ws` | RFC 6455 framing over the byte stream |

// ============================================================================
// Submodules
// ============================================================================

/// HTTP CONNECT proxy tunnel.
pub mod proxy;

/// Non-blocking TCP transport.
pub mod tcp;

/// TLS client transport.
pub mod tls;

/// WebSocket framing transport.
pub mod ws;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Result;
use crate::message::Message;

// ============================================================================
// Re-exports
// ============================================================================

pub use proxy::HttpProxyTransport;
pub use tcp::TcpTransport;
pub use tls::TlsTransport;
pub use ws::{WsConfig, WsTransport};

// ============================================================================
// Types
// ============================================================================

/// Incoming data callback. `None` signals end of stream.
pub type RecvCallback = Arc<dyn Fn(Option<Message>) + Send + Sync>;

/// State change callback.
pub type StateCallback = Arc<dyn Fn(TransportState) + Send + Sync>;

/// Buffered amount change callback.
pub type BufferedAmountCallback = Arc<dyn Fn(usize) + Send + Sync>;

// ============================================================================
// TransportState
// ============================================================================

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportState {
    /// Not started, or stopped.
    #[default]
    Disconnected,
    /// Establishing.
    Connecting,
    /// Ready for data.
    Connected,
    /// Finished normally.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TransportState {
    /// Returns `true` for states no transition leaves.
    #[inline]
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Uniform interface of every layer in the chain.
pub trait Transport: Send + Sync {
    /// Starts the layer. Progress is reported through the state callback.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot begin establishing.
    fn start(&self) -> Result<()>;

    /// Stops the layer and everything beneath it.
    ///
    /// Idempotent and silent: no state callback fires. Blocks until any
    /// in-flight I/O handler of the layer has returned.
    fn stop(&self);

    /// Sends a message down the chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is not connected or its buffer is full.
    fn send(&self, message: Message) -> Result<()>;

    /// Installs (or clears) the incoming data callback.
    fn on_recv(&self, callback: Option<RecvCallback>);

    /// Current state.
    fn state(&self) -> TransportState;

    /// Reason of the failure, once [`TransportState::Failed`].
    fn failure(&self) -> Option<String>;
}

// ============================================================================
// TransportBase
// ============================================================================

/// State and callbacks shared by every transport implementation.
pub(crate) struct TransportBase {
    name: &'static str,
    state: Mutex<TransportState>,
    state_callback: Option<StateCallback>,
    recv_callback: Mutex<Option<RecvCallback>>,
    failure: Mutex<Option<String>>,
    stopped: AtomicBool,
}

impl TransportBase {
    pub(crate) fn new(name: &'static str, state_callback: Option<StateCallback>) -> Self {
        Self {
            name,
            state: Mutex::new(TransportState::Disconnected),
            state_callback,
            recv_callback: Mutex::new(None),
            failure: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock()
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Moves to `state` and notifies the owner.
    ///
    /// Ignored once stopped, once final, or if unchanged. The callback runs
    /// after the state lock is released.
    pub(crate) fn change_state(&self, state: TransportState) -> bool {
        {
            let mut current = self.state.lock();
            if self.is_stopped() || current.is_final() || *current == state {
                return false;
            }
            debug!(transport = self.name, from = %*current, to = %state, "Transport state changed");
            *current = state;
        }

        if let Some(callback) = &self.state_callback {
            callback(state);
        }
        true
    }

    /// Records `reason` and moves to [`TransportState::Failed`].
    ///
    /// The first recorded reason wins.
    pub(crate) fn fail(&self, reason: impl Into<String>) -> bool {
        if self.is_stopped() || self.state().is_final() {
            return false;
        }
        let reason = reason.into();
        error!(transport = self.name, %reason, "Transport failed");
        self.failure.lock().get_or_insert(reason);
        self.change_state(TransportState::Failed)
    }

    pub(crate) fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Marks the transport stopped. Returns `false` if it already was.
    pub(crate) fn mark_stopped(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock();
        if !state.is_final() {
            *state = TransportState::Disconnected;
        }
        debug!(transport = self.name, "Transport stopped");
        true
    }

    pub(crate) fn set_recv_callback(&self, callback: Option<RecvCallback>) {
        *self.recv_callback.lock() = callback;
    }

    /// Delivers incoming data to the upper layer.
    pub(crate) fn recv(&self, message: Option<Message>) {
        let callback = self.recv_callback.lock().clone();
        if let Some(callback) = callback {
            callback(message);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_base() -> (TransportBase, Arc<Mutex<Vec<TransportState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let base = TransportBase::new(
            "test",
            Some(Arc::new(move |state| sink.lock().push(state))),
        );
        (base, seen)
    }

    #[test]
    fn test_change_state_notifies_once_per_change() {
        let (base, seen) = recording_base();
        assert!(base.change_state(TransportState::Connecting));
        assert!(!base.change_state(TransportState::Connecting));
        assert!(base.change_state(TransportState::Connected));
        assert_eq!(
            *seen.lock(),
            vec![TransportState::Connecting, TransportState::Connected]
        );
    }

    #[test]
    fn test_final_state_is_sticky() {
        let (base, seen) = recording_base();
        base.change_state(TransportState::Failed);
        assert!(!base.change_state(TransportState::Connected));
        assert_eq!(base.state(), TransportState::Failed);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_stop_is_silent_and_idempotent() {
        let (base, seen) = recording_base();
        base.change_state(TransportState::Connected);
        assert!(base.mark_stopped());
        assert!(!base.mark_stopped());
        assert_eq!(base.state(), TransportState::Disconnected);
        assert!(!base.change_state(TransportState::Failed));
        assert_eq!(*seen.lock(), vec![TransportState::Connected]);
    }

    #[test]
    fn test_fail_records_first_reason() {
        let (base, seen) = recording_base();
        assert!(base.fail("refused"));
        assert!(!base.fail("again"));
        assert_eq!(base.failure().as_deref(), Some("refused"));
        assert_eq!(*seen.lock(), vec![TransportState::Failed]);
    }

    #[test]
    fn test_recv_without_callback_is_noop() {
        let (base, _) = recording_base();
        base.recv(Some(Message::text("dropped")));

        let got = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&got);
        base.set_recv_callback(Some(Arc::new(move |m| *sink.lock() = m)));
        base.recv(Some(Message::text("kept")));
        assert_eq!(&got.lock().as_ref().unwrap().payload[..], b"kept");
    }
}
