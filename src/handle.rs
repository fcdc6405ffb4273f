//! Integer-handle registry.
//!
//! Embedders that cannot hold Rust values refer to WebSockets by `i32` id.
//! [`Registry`] owns the connections, maps every call onto the matching
//! [`WebSocket`] method and reports failures as [`Error`]s whose
//! [`code`](Error::code) is the embedding status code.
//!
//! Ids start at 1 and are never reused within a registry.
//!
//! # Payload Conventions
//!
//! | Call | `size >= 0` | `size < 0` |
//! |------|-------------|------------|
//! | [`send`](Registry::send) | binary, `size` bytes | text up to the first NUL |
//! | [`receive`](Registry::receive) (out) | binary of `size` bytes | text of `-size` bytes including NUL |

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::message::MessageData;
use crate::runtime::Context;
use crate::runtime::context::ContextSlot;
use crate::websocket::WebSocket;

// ============================================================================
// Global Registry
// ============================================================================

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Entries {
    sockets: FxHashMap<i32, Arc<WebSocket>>,
    last_id: i32,
}

/// Map from integer ids to WebSockets.
pub struct Registry {
    slot: &'static ContextSlot,
    entries: Mutex<Entries>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Registry - Constructors
// ============================================================================

impl Registry {
    /// Creates an empty registry on the global context.
    #[must_use]
    pub fn new() -> Self {
        Self::with_slot(Context::global())
    }

    pub(crate) fn with_slot(slot: &'static ContextSlot) -> Self {
        Self {
            slot,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }
}

// ============================================================================
// Registry - Lifecycle
// ============================================================================

impl Registry {
    /// Creates a WebSocket and starts connecting to `url`.
    ///
    /// Returns the new id. The connection outcome is only reported through
    /// callbacks.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or `url` cannot be opened.
    pub fn create(&self, url: &str, config: WebSocketConfig) -> Result<i32> {
        let ws = WebSocket::with_context(self.slot.acquire()?, config)?;
        ws.open(url)?;

        let mut entries = self.entries.lock();
        entries.last_id = entries
            .last_id
            .checked_add(1)
            .ok_or_else(|| Error::invalid_argument("WebSocket ids exhausted"))?;
        let id = entries.last_id;
        entries.sockets.insert(id, Arc::new(ws));

        debug!(id, url, "WebSocket created");
        Ok(id)
    }

    /// Force-closes and removes a WebSocket. Its callbacks are dropped
    /// first, so the closed callback does not fire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn delete(&self, id: i32) -> Result<()> {
        let ws = self.get(id)?;
        ws.clear_callbacks();
        ws.force_close();
        self.entries.lock().sockets.remove(&id);
        debug!(id, "WebSocket deleted");
        Ok(())
    }

    /// Starts the closing handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn close(&self, id: i32) -> Result<()> {
        self.get(id)?.close();
        Ok(())
    }

    /// Starts the shared context ahead of the first connection.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the context cannot be started.
    pub fn preload(&self) -> Result<()> {
        self.slot.preload()
    }

    /// Removes every WebSocket and waits for the shared context to shut
    /// down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CleanupTimeout`] if teardown does not finish within
    /// `timeout`. This is fatal: a connection leaked or a thread deadlocked.
    pub fn cleanup(&self, timeout: Duration) -> Result<()> {
        let sockets = std::mem::take(&mut self.entries.lock().sockets);
        if !sockets.is_empty() {
            warn!(count = sockets.len(), "WebSockets were not deleted before cleanup");
        }
        drop(sockets);

        self.slot.cleanup().wait_timeout(timeout)?;
        info!("Registry cleaned up");
        Ok(())
    }

    /// Number of registered WebSockets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().sockets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: i32) -> Result<Arc<WebSocket>> {
        self.entries
            .lock()
            .sockets
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("WebSocket ID {id} does not exist")))
    }
}

// ============================================================================
// Registry - Callbacks
// ============================================================================

impl Registry {
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn set_open_callback(&self, id: i32, callback: impl Fn(i32) + Send + Sync + 'static) -> Result<()> {
        self.get(id)?.on_open(move || callback(id));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn set_closed_callback(&self, id: i32, callback: impl Fn(i32) + Send + Sync + 'static) -> Result<()> {
        self.get(id)?.on_closed(move || callback(id));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn set_error_callback(
        &self,
        id: i32,
        callback: impl Fn(i32, String) + Send + Sync + 'static,
    ) -> Result<()> {
        self.get(id)?.on_error(move |error| callback(id, error));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn set_message_callback(
        &self,
        id: i32,
        callback: impl Fn(i32, MessageData) + Send + Sync + 'static,
    ) -> Result<()> {
        self.get(id)?.on_message(move |message| callback(id, message));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn set_available_callback(&self, id: i32, callback: impl Fn(i32) + Send + Sync + 'static) -> Result<()> {
        self.get(id)?.on_available(move |_| callback(id));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn set_buffered_amount_low_callback(
        &self,
        id: i32,
        callback: impl Fn(i32) + Send + Sync + 'static,
    ) -> Result<()> {
        self.get(id)?.on_buffered_amount_low(move || callback(id));
        Ok(())
    }
}

// ============================================================================
// Registry - Messaging
// ============================================================================

impl Registry {
    /// Sends `data` using the sign convention: a non-negative `size` sends
    /// that many bytes as binary, a negative one sends text up to the first
    /// NUL (or the whole slice).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for an unknown id, a `size` beyond
    ///   `data`, or text that is not UTF-8
    /// - any error of [`WebSocket::send`]
    pub fn send(&self, id: i32, data: &[u8], size: i32) -> Result<()> {
        let ws = self.get(id)?;

        let message = match usize::try_from(size) {
            Ok(size) => {
                let bytes = data.get(..size).ok_or_else(|| {
                    Error::invalid_argument(format!("size {size} exceeds data length {}", data.len()))
                })?;
                MessageData::Binary(bytes.to_vec())
            }
            Err(_) => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let text = std::str::from_utf8(&data[..end])
                    .map_err(|e| Error::invalid_argument(format!("text is not valid UTF-8: {e}")))?;
                MessageData::Text(text.to_string())
            }
        };

        ws.send(message)
    }

    /// Copies the next inbound message into `buffer`.
    ///
    /// On entry `|size|` is the usable buffer capacity. On return `size`
    /// holds the message size, negated for text (which includes its NUL).
    /// Without a buffer, only the size is reported and the message stays
    /// queued.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for an unknown id
    /// - [`Error::NotAvailable`] if no message is queued
    /// - [`Error::BufferTooSmall`] if the capacity is too small; `size`
    ///   still reports the requirement and the message stays queued
    pub fn receive(&self, id: i32, buffer: Option<&mut [u8]>, size: &mut i32) -> Result<()> {
        let ws = self.get(id)?;
        let capacity = usize::try_from(size.unsigned_abs()).unwrap_or(usize::MAX);

        let next = ws.peek()?;
        let required = next.len() + usize::from(next.is_text());
        let signed = |len: usize| {
            let len = i32::try_from(len).unwrap_or(i32::MAX);
            if next.is_text() { -len } else { len }
        };

        let Some(buffer) = buffer else {
            *size = signed(required);
            return Ok(());
        };

        let usable = capacity.min(buffer.len());
        match ws.receive_into(Some(&mut buffer[..usable])) {
            Ok(received) => {
                let len = i32::try_from(received.len).unwrap_or(i32::MAX);
                *size = if received.is_text { -len } else { len };
                Ok(())
            }
            Err(e) => {
                if let Error::BufferTooSmall { required } = &e {
                    *size = signed(*required);
                }
                Err(e)
            }
        }
    }
}

// ============================================================================
// Registry - Accessors
// ============================================================================

impl Registry {
    /// Returns `false` for unknown ids.
    #[must_use]
    pub fn is_open(&self, id: i32) -> bool {
        self.get(id).is_ok_and(|ws| ws.is_open())
    }

    /// Returns `false` for unknown ids.
    #[must_use]
    pub fn is_closed(&self, id: i32) -> bool {
        self.get(id).is_ok_and(|ws| ws.is_closed())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn buffered_amount(&self, id: i32) -> Result<usize> {
        Ok(self.get(id)?.buffered_amount())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn set_buffered_amount_low_threshold(&self, id: i32, threshold: usize) -> Result<()> {
        self.get(id)?.set_buffered_amount_low_threshold(threshold);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn available_amount(&self, id: i32) -> Result<usize> {
        Ok(self.get(id)?.available_amount())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn max_message_size(&self, id: i32) -> Result<usize> {
        Ok(self.get(id)?.max_message_size())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id and
    /// [`Error::NotAvailable`] before the TCP connection is established.
    pub fn remote_address(&self, id: i32) -> Result<String> {
        self.get(id)?.remote_address().ok_or(Error::NotAvailable)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown id.
    pub fn path(&self, id: i32) -> Result<String> {
        self.get(id)?.path().ok_or(Error::NotAvailable)
    }
}

// ============================================================================
// Tests
// ============================================================================
