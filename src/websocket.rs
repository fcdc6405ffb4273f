//! WebSocket connection.
//!
//! A [`WebSocket`] owns one transport chain and drives the connection state
//! machine:
//!
//! ```text
//! Closed ──open()──► Connecting ──handshake──► Open ──close()──► Closing ──► Closed
//!                        │                      │                   │
//!                        └──────── failure / force_close() ─────────┴──► Closed
//! ```
//!
//! `open` only validates its input and starts the chain; success or failure
//! is reported through callbacks. Layer state changes are handled on the
//! connection's [`Processor`], never inside a transport call, so tearing the
//! chain down cannot deadlock with a running I/O handler.
//!
//! Messages sent while connecting are held in a pending queue and flushed,
//! in order, when the connection opens.
//!
//! # Example
//!
//! ```no_run
//! use wsclient::{WebSocket, WebSocketConfig};
//!
//! # fn main() -> wsclient::Result<()> {
//! let ws = WebSocket::new(WebSocketConfig::default())?;
//! ws.on_open(|| println!("open"));
//! ws.on_message(|message| println!("received {} bytes", message.len()));
//! ws.open("wss://echo.example.com/chat")?;
//! ws.send("hello")?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::ChannelCore;
use crate::config::{ProxyKind, WebSocketConfig};
use crate::error::{Error, Result};
use crate::message::{Message, MessageData};
use crate::protocol::Handshake;
use crate::protocol::http::authority;
use crate::queue::{Queue, QueueError, QueueLimit};
use crate::runtime::{Context, ContextToken, Processor};
use crate::transport::tcp::TcpOptions;
use crate::transport::tls::{TlsOptions, client_config};
use crate::transport::{
    HttpProxyTransport, StateCallback, TcpTransport, TlsTransport, Transport, TransportState, WsConfig,
    WsTransport,
};

// ============================================================================
// ReadyState
// ============================================================================

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadyState {
    /// Opening handshake in progress.
    Connecting,
    /// Ready to send and receive.
    Open,
    /// Closing handshake in progress.
    Closing,
    /// Not connected. Initial and terminal.
    #[default]
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Received
// ============================================================================

/// Result of [`WebSocket::receive_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes written, including the trailing NUL of a text message.
    pub len: usize,
    /// The message was text.
    pub is_text: bool,
}

// ============================================================================
// Internal Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Tcp,
    Proxy,
    Tls,
    Ws,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tcp => "TCP",
            Self::Proxy => "proxy",
            Self::Tls => "TLS",
            Self::Ws => "WebSocket",
        };
        f.write_str(name)
    }
}

/// Target parsed from a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
struct Endpoint {
    secure: bool,
    host: String,
    port: u16,
    path: String,
    host_header: String,
}

impl Endpoint {
    fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(Error::invalid_argument(format!(
                    "Invalid WebSocket URL scheme: {other}"
                )));
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::invalid_argument(format!("Missing host in URL: {input}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = url.port().unwrap_or(if secure { 443 } else { 80 });
        let host_header = match url.port() {
            Some(port) => authority(&host, port),
            None if host.contains(':') => format!("[{host}]"),
            None => host.clone(),
        };

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            secure,
            host,
            port,
            path,
            host_header,
        })
    }
}

/// The transports of one connection, bottom to top.
#[derive(Default)]
struct Chain {
    tcp: Option<Arc<TcpTransport>>,
    proxy: Option<Arc<HttpProxyTransport>>,
    tls: Option<Arc<TlsTransport>>,
    ws: Option<Arc<WsTransport>>,
}

impl Chain {
    fn get(&self, layer: Layer) -> Option<Arc<dyn Transport>> {
        match layer {
            Layer::Tcp => self.tcp.clone().map(|t| t as Arc<dyn Transport>),
            Layer::Proxy => self.proxy.clone().map(|t| t as Arc<dyn Transport>),
            Layer::Tls => self.tls.clone().map(|t| t as Arc<dyn Transport>),
            Layer::Ws => self.ws.clone().map(|t| t as Arc<dyn Transport>),
        }
    }

    /// The layer stacked directly on `layer`.
    fn above(&self, layer: Layer) -> Option<Arc<dyn Transport>> {
        let order = [Layer::Tcp, Layer::Proxy, Layer::Tls, Layer::Ws];
        let position = order.iter().position(|l| *l == layer)?;
        order[position + 1..].iter().find_map(|l| self.get(*l))
    }
}

// ============================================================================
// Shared State
// ============================================================================

struct Shared {
    ctx: ContextToken,
    config: WebSocketConfig,
    core: Arc<ChannelCore>,
    weak_self: Weak<Shared>,
    state: Mutex<ReadyState>,
    opened: AtomicBool,
    endpoint: Mutex<Option<Endpoint>>,
    chain: Mutex<Chain>,
    protocol: Mutex<Option<String>>,
    pending: Queue<Message>,
    send_lock: Mutex<()>,
}

impl Shared {
    #[inline]
    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    fn processor(&self) -> &Processor {
        self.core.processor()
    }

    // ========================================================================
    // Chain Construction
    // ========================================================================

    fn build_chain(&self, endpoint: &Endpoint) -> Result<Chain> {
        let config = &self.config;
        let options = TcpOptions {
            send_buffer_limit: config.send_buffer_limit,
            read_timeout: config.read_timeout,
        };

        let (host, port) = match &config.proxy_server {
            Some(proxy) => (proxy.host.clone(), proxy.port),
            None => (endpoint.host.clone(), endpoint.port),
        };
        let tcp = TcpTransport::new(self.ctx.clone(), host, port, options, Some(self.state_callback(Layer::Tcp)));

        let weak = self.weak_self.clone();
        tcp.on_buffered_amount(Some(Arc::new(move |_| {
            if let Some(this) = weak.upgrade() {
                this.update_buffered_amount();
            }
        })));

        let mut chain = Chain {
            tcp: Some(Arc::clone(&tcp)),
            ..Chain::default()
        };
        let mut lower: Arc<dyn Transport> = tcp;

        if let Some(proxy) = &config.proxy_server {
            let credentials = proxy
                .username
                .clone()
                .map(|user| (user, proxy.password.clone().unwrap_or_default()));
            let tunnel = HttpProxyTransport::new(
                lower,
                &endpoint.host,
                endpoint.port,
                credentials,
                Some(self.state_callback(Layer::Proxy)),
            );
            lower = tunnel.clone();
            chain.proxy = Some(tunnel);
        }

        if endpoint.secure {
            let tls_config = client_config(self.ctx.crypto(), &TlsOptions::from(config))?;
            let tls = TlsTransport::new(lower, tls_config, &endpoint.host, Some(self.state_callback(Layer::Tls)))?;
            lower = tls.clone();
            chain.tls = Some(tls);
        }

        let handshake = Handshake::new(
            endpoint.host_header.clone(),
            endpoint.path.clone(),
            config.protocols.clone(),
        )?;
        let ws = WsTransport::new(
            self.ctx.clone(),
            lower,
            handshake,
            WsConfig::from(config),
            Some(self.state_callback(Layer::Ws)),
        );

        let weak = self.weak_self.clone();
        ws.on_recv(Some(Arc::new(move |message: Option<Message>| {
            if let (Some(this), Some(message)) = (weak.upgrade(), message) {
                this.core.incoming(message);
            }
        })));

        chain.ws = Some(ws);
        Ok(chain)
    }

    /// Forwards layer state changes to the processor.
    fn state_callback(&self, layer: Layer) -> StateCallback {
        let weak = self.weak_self.clone();
        Arc::new(move |state| {
            if let Some(this) = weak.upgrade() {
                let processor = this.processor().clone();
                processor.enqueue(move || this.on_layer_state(layer, state));
            }
        })
    }

    fn schedule_connection_timeout(&self) {
        let Some(timeout) = self.config.effective_connection_timeout() else {
            return;
        };
        let weak = self.weak_self.clone();
        self.ctx.poll().schedule_in(
            timeout,
            Box::new(move || {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let processor = this.processor().clone();
                processor.enqueue(move || {
                    if this.ready_state() == ReadyState::Connecting {
                        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                        this.shutdown(Some(Error::connection_timeout(timeout_ms).to_string()));
                    }
                });
            }),
        );
    }

    // ========================================================================
    // State Machine
    // ========================================================================

    /// Runs on the processor.
    fn on_layer_state(&self, layer: Layer, state: TransportState) {
        if self.ready_state() == ReadyState::Closed {
            return;
        }

        match state {
            TransportState::Connected if layer == Layer::Ws => self.on_open(),
            TransportState::Connected => self.start_above(layer),
            TransportState::Completed => self.shutdown(None),
            TransportState::Failed => {
                let reason = self
                    .chain
                    .lock()
                    .get(layer)
                    .and_then(|t| t.failure())
                    .unwrap_or_else(|| "unknown failure".to_string());
                self.shutdown(Some(format!("{layer}: {reason}")));
            }
            TransportState::Disconnected => {
                if self.ready_state() == ReadyState::Connecting {
                    self.shutdown(Some(format!("{layer}: connection closed while connecting")));
                } else {
                    debug!(%layer, "Remote closed the connection");
                    self.shutdown(None);
                }
            }
            TransportState::Connecting => {}
        }
    }

    fn start_above(&self, layer: Layer) {
        let next = self.chain.lock().above(layer);
        if let Some(next) = next {
            debug!(%layer, "Layer connected, starting the next one");
            if let Err(e) = next.start() {
                self.shutdown(Some(e.to_string()));
            }
        }
    }

    fn on_open(&self) {
        {
            let _ordered = self.send_lock.lock();
            {
                let mut state = self.state.lock();
                if *state != ReadyState::Connecting {
                    return;
                }
                *state = ReadyState::Open;
            }

            let ws = self.chain.lock().ws.clone();
            *self.protocol.lock() = ws.as_ref().and_then(|ws| ws.protocol());
            if let Some(ws) = ws {
                for message in self.pending.drain() {
                    if let Err(e) = ws.send(message) {
                        warn!(error = %e, "Failed to flush pending message");
                        break;
                    }
                }
            }
        }

        info!(path = ?self.endpoint.lock().as_ref().map(|e| e.path.clone()), "WebSocket open");
        self.update_buffered_amount();
        self.core.deliver_open();
    }

    /// Tears the connection down. Reports `error` first if given.
    ///
    /// Idempotent; only the first call has an effect.
    fn shutdown(&self, error: Option<String>) {
        {
            let mut state = self.state.lock();
            if *state == ReadyState::Closed {
                return;
            }
            *state = ReadyState::Closed;
        }

        if let Some(reason) = error {
            error!(%reason, "WebSocket failed");
            self.core.trigger_error(reason);
        }

        let chain = std::mem::take(&mut *self.chain.lock());
        if let Some(ws) = &chain.ws {
            ws.stop();
        }
        self.pending.drain();

        info!("WebSocket closed");
        self.core.trigger_closed();
        let core = Arc::clone(&self.core);
        self.processor().enqueue(move || core.reset_callbacks());
    }

    fn buffered_amount(&self) -> usize {
        let tcp = self.chain.lock().tcp.clone();
        self.pending.amount() + tcp.map_or(0, |tcp| tcp.buffered_amount())
    }

    fn update_buffered_amount(&self) {
        self.core.update_buffered_amount(self.buffered_amount());
    }
}

// ============================================================================
// WebSocket
// ============================================================================

/// WebSocket client connection.
///
/// Dropping it force-closes the connection.
///
/// # Thread Safety
///
/// All methods take `&self` and may be called from any thread, including
/// from inside callbacks.
pub struct WebSocket {
    shared: Arc<Shared>,
}

// ============================================================================
// WebSocket - Constructors
// ============================================================================

impl WebSocket {
    /// Creates a closed WebSocket on the global context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid, or an IO error if
    /// the global context cannot start.
    pub fn new(config: WebSocketConfig) -> Result<Self> {
        Self::with_context(Context::acquire()?, config)
    }

    /// Creates a closed WebSocket on an explicit context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub fn with_context(ctx: ContextToken, config: WebSocketConfig) -> Result<Self> {
        config.validate()?;
        let core = ChannelCore::new(Processor::new(Arc::clone(ctx.pool())));
        let pending = Queue::new(QueueLimit::Bytes(config.send_buffer_limit), Message::size);

        let shared = Arc::new_cyclic(|weak_self| Shared {
            ctx,
            config,
            core,
            weak_self: weak_self.clone(),
            state: Mutex::new(ReadyState::Closed),
            opened: AtomicBool::new(false),
            endpoint: Mutex::new(None),
            chain: Mutex::new(Chain::default()),
            protocol: Mutex::new(None),
            pending,
            send_lock: Mutex::new(()),
        });

        Ok(Self { shared })
    }
}

// ============================================================================
// WebSocket - Lifecycle
// ============================================================================

impl WebSocket {
    /// Starts connecting to a `ws://` or `wss://` URL.
    ///
    /// Returns once the connection attempt has started. The outcome is
    /// reported through [`on_open`](Self::on_open) or
    /// [`on_error`](Self::on_error) followed by [`on_closed`](Self::on_closed).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the URL is malformed, the proxy is
    ///   SOCKS5, or the WebSocket was already opened
    /// - [`Error::Url`] if the URL cannot be parsed
    /// - [`Error::Config`] if TLS material cannot be loaded
    pub fn open(&self, url: &str) -> Result<()> {
        let shared = &self.shared;
        let endpoint = Endpoint::parse(url)?;

        if shared
            .config
            .proxy_server
            .as_ref()
            .is_some_and(|p| p.kind == ProxyKind::Socks5)
        {
            return Err(Error::invalid_argument("SOCKS5 proxies are not supported"));
        }

        if shared.opened.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_argument("WebSocket was already opened"));
        }

        let chain = match shared.build_chain(&endpoint) {
            Ok(chain) => chain,
            Err(e) => {
                shared.opened.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(
            host = %endpoint.host,
            port = endpoint.port,
            secure = endpoint.secure,
            proxy = shared.config.proxy_server.is_some(),
            "Opening WebSocket"
        );

        let tcp = chain.tcp.clone();
        *shared.endpoint.lock() = Some(endpoint);
        *shared.chain.lock() = chain;
        *shared.state.lock() = ReadyState::Connecting;
        shared.schedule_connection_timeout();

        if let Some(tcp) = tcp
            && let Err(e) = tcp.start()
        {
            let this = Arc::clone(shared);
            shared
                .processor()
                .enqueue(move || this.shutdown(Some(format!("TCP: {e}"))));
        }
        Ok(())
    }

    /// Starts the closing handshake.
    ///
    /// An open connection moves to [`ReadyState::Closing`] and closes when
    /// the peer answers or the close timeout expires. A connecting one is
    /// aborted.
    pub fn close(&self) {
        let shared = &self.shared;
        let previous = {
            let mut state = shared.state.lock();
            let previous = *state;
            if previous == ReadyState::Open {
                *state = ReadyState::Closing;
            }
            previous
        };

        match previous {
            ReadyState::Connecting => shared.shutdown(None),
            ReadyState::Open => {
                debug!("Closing WebSocket");
                let ws = shared.chain.lock().ws.clone();
                if let Some(ws) = ws {
                    ws.close();
                }

                let weak = Arc::downgrade(shared);
                shared.ctx.poll().schedule_in(
                    shared.config.close_timeout,
                    Box::new(move || {
                        let Some(this) = weak.upgrade() else {
                            return;
                        };
                        let processor = this.processor().clone();
                        processor.enqueue(move || {
                            if this.ready_state() == ReadyState::Closing {
                                warn!("Close timeout, closing without peer response");
                                this.shutdown(None);
                            }
                        });
                    }),
                );
            }
            ReadyState::Closing | ReadyState::Closed => {}
        }
    }

    /// Closes immediately without the closing handshake.
    ///
    /// Pending outbound messages are discarded.
    pub fn force_close(&self) {
        self.shared.shutdown(None);
    }
}

// ============================================================================
// WebSocket - Messaging
// ============================================================================

impl WebSocket {
    /// Sends a message.
    ///
    /// While connecting, the message is queued and sent when the connection
    /// opens.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the message exceeds the maximum size
    /// - [`Error::QueueFull`] if the send buffer is full
    /// - [`Error::ConnectionClosed`] if the connection is closing or closed
    pub fn send(&self, data: impl Into<MessageData>) -> Result<()> {
        let shared = &self.shared;
        let message = Message::from(data.into());
        if message.len() > shared.config.max_message_size {
            return Err(Error::invalid_argument(format!(
                "Message size {} exceeds limit {}",
                message.len(),
                shared.config.max_message_size
            )));
        }

        let result = {
            let _ordered = shared.send_lock.lock();
            match shared.ready_state() {
                ReadyState::Connecting => shared.pending.push(message).map_err(|e| match e {
                    QueueError::Full(_) => Error::queue_full(shared.config.send_buffer_limit),
                    QueueError::Empty => Error::ConnectionClosed,
                }),
                ReadyState::Open => {
                    let ws = shared.chain.lock().ws.clone();
                    ws.ok_or(Error::ConnectionClosed)?.send(message)
                }
                ReadyState::Closing | ReadyState::Closed => Err(Error::ConnectionClosed),
            }
        };

        shared.update_buffered_amount();
        result
    }

    /// Removes and returns the oldest inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAvailable`] if no message is queued.
    pub fn receive(&self) -> Result<MessageData> {
        self.shared.core.receive().ok_or(Error::NotAvailable)
    }

    /// Returns the oldest inbound message without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAvailable`] if no message is queued.
    pub fn peek(&self) -> Result<MessageData> {
        self.shared.core.peek().ok_or(Error::NotAvailable)
    }

    /// Copies the oldest inbound message into `buffer` and removes it.
    ///
    /// Text messages are written with a trailing NUL, counted in the
    /// returned length.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAvailable`] if no message is queued
    /// - [`Error::BufferTooSmall`] with the required size if `buffer` is
    ///   absent or too short; the message stays queued
    pub fn receive_into(&self, buffer: Option<&mut [u8]>) -> Result<Received> {
        let core = &self.shared.core;
        let Some(buffer) = buffer else {
            let next = core.peek().ok_or(Error::NotAvailable)?;
            return Err(Error::buffer_too_small(next.len() + usize::from(next.is_text())));
        };

        let data = core.receive_if_fits(buffer.len())?;
        let (bytes, is_text) = match &data {
            MessageData::Binary(bytes) => (bytes.as_slice(), false),
            MessageData::Text(text) => (text.as_bytes(), true),
        };

        let required = bytes.len() + usize::from(is_text);
        if required > buffer.len() {
            return Err(Error::buffer_too_small(required));
        }

        buffer[..bytes.len()].copy_from_slice(bytes);
        let mut len = bytes.len();
        if is_text {
            buffer[len] = 0;
            len += 1;
        }
        Ok(Received { len, is_text })
    }
}

// ============================================================================
// WebSocket - Callbacks
// ============================================================================

impl WebSocket {
    /// Called once the connection opens, before any message callback.
    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.core.on_open(Some(Arc::new(callback)));
    }

    /// Called once the connection is closed.
    pub fn on_closed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.core.on_closed(Some(Arc::new(callback)));
    }

    /// Called with a description of a failure, before the closed callback.
    pub fn on_error(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.shared.core.on_error(Some(Arc::new(callback)));
    }

    /// Called with every inbound message. Queued messages are delivered
    /// immediately; [`receive`](Self::receive) then finds nothing.
    pub fn on_message(&self, callback: impl Fn(MessageData) + Send + Sync + 'static) {
        self.shared.core.on_message(Some(Arc::new(callback)));
    }

    /// Called with the number of queued inbound messages when one arrives.
    pub fn on_available(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        self.shared.core.on_available(Some(Arc::new(callback)));
    }

    /// Called when the buffered amount drops to the low threshold.
    pub fn on_buffered_amount_low(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.core.on_buffered_amount_low(Some(Arc::new(callback)));
    }

    /// Removes every registered callback.
    pub fn clear_callbacks(&self) {
        self.shared.core.reset_callbacks();
    }
}

// ============================================================================
// WebSocket - Accessors
// ============================================================================

impl WebSocket {
    #[inline]
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_state()
    }

    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.ready_state() == ReadyState::Closed
    }

    /// Bytes accepted by [`send`](Self::send) but not yet written to the
    /// socket, including framing and TLS overhead.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered_amount()
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.shared.core.set_buffered_amount_low_threshold(threshold);
    }

    /// Payload bytes waiting in the inbound queue.
    #[must_use]
    pub fn available_amount(&self) -> usize {
        self.shared.core.available_amount()
    }

    #[inline]
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.shared.config.max_message_size
    }

    /// Address of the connected peer (the proxy when tunneling).
    #[must_use]
    pub fn remote_address(&self) -> Option<String> {
        let tcp = self.shared.chain.lock().tcp.clone();
        tcp.and_then(|tcp| tcp.remote_address())
    }

    /// Request path, including the query string.
    #[must_use]
    pub fn path(&self) -> Option<String> {
        self.shared.endpoint.lock().as_ref().map(|e| e.path.clone())
    }

    /// Sub-protocol selected by the server.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        self.shared.protocol.lock().clone()
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.shared.config
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("state", &self.ready_state())
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        self.force_close();
    }
}

// ============================================================================
// Tests
// ============================================================================
