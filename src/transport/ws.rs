//! WebSocket framing transport.
//!
//! Top of every chain. On start it sends the opening handshake request and
//! buffers incoming bytes until the response head validates; from then on
//! the byte stream is parsed as RFC 6455 frames.
//!
//! Outgoing Binary and Text messages become single masked frames. Incoming
//! fragments are reassembled into one message. Pings are answered, pongs
//! reset the keep-alive counter, and a Close frame from the peer is echoed
//! before the transport completes.
//!
//! Incoming parsing only ever runs on the thread delivering data from the
//! lower layer, so frame state needs no ordering beyond its lock.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};
use crate::protocol::{Frame, FrameError, Handshake, Opcode, close_code};
use crate::runtime::ContextToken;

use super::{RecvCallback, StateCallback, Transport, TransportBase, TransportState};

// ============================================================================
// WsConfig
// ============================================================================

/// Framing and keep-alive settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsConfig {
    /// Largest accepted inbound message.
    pub max_message_size: usize,
    /// Interval between keep-alive pings. `None` disables them.
    pub ping_interval: Option<Duration>,
    /// Unanswered pings tolerated before failing. Zero never fails.
    pub max_outstanding_pings: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self::from(&WebSocketConfig::default())
    }
}

impl From<&WebSocketConfig> for WsConfig {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            ping_interval: config.effective_ping_interval(),
            max_outstanding_pings: config.max_outstanding_pings,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

#[derive(Default)]
struct WsInner {
    buffer: BytesMut,
    /// Opcode and payload of a message still receiving continuations.
    partial: Option<(Opcode, BytesMut)>,
    close_sent: bool,
    outstanding_pings: u32,
}

// ============================================================================
// WsTransport
// ============================================================================

/// RFC 6455 client framing over a byte-stream transport.
pub struct WsTransport {
    base: TransportBase,
    ctx: ContextToken,
    weak_self: Weak<Self>,
    lower: Arc<dyn Transport>,
    config: WsConfig,
    handshake: Mutex<Handshake>,
    inner: Mutex<WsInner>,
}

impl WsTransport {
    /// Creates the framing layer over `lower`.
    #[must_use]
    pub fn new(
        ctx: ContextToken,
        lower: Arc<dyn Transport>,
        handshake: Handshake,
        config: WsConfig,
        state_callback: Option<StateCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self: &Weak<Self>| {
            let weak = weak_self.clone();
            lower.on_recv(Some(Arc::new(move |message| {
                if let Some(this) = weak.upgrade() {
                    this.incoming(message);
                }
            })));

            Self {
                base: TransportBase::new("ws", state_callback),
                ctx,
                weak_self: weak_self.clone(),
                lower,
                config,
                handshake: Mutex::new(handshake),
                inner: Mutex::new(WsInner::default()),
            }
        })
    }

    /// Sub-protocol selected by the server.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        self.handshake.lock().protocol().map(str::to_string)
    }

    /// Request path sent in the handshake.
    #[must_use]
    pub fn path(&self) -> String {
        self.handshake.lock().path().to_string()
    }

    /// Starts the closing handshake with code 1000.
    ///
    /// The transport completes once the peer answers with its own Close.
    /// Does nothing unless connected, or if a Close was already sent.
    pub fn close(&self) {
        if self.base.state() != TransportState::Connected {
            return;
        }
        if std::mem::replace(&mut self.inner.lock().close_sent, true) {
            return;
        }
        debug!("Sending close frame");
        if let Err(e) = self.send_frame(Frame::close(close_code::NORMAL, "")) {
            self.fail(format!("failed to send close frame: {e}"));
        }
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    fn incoming(&self, message: Option<Message>) {
        if self.base.is_stopped() {
            return;
        }

        let Some(message) = message else {
            match self.base.state() {
                TransportState::Connecting => self.fail("connection closed during WebSocket handshake"),
                _ => {
                    debug!("Connection closed without close frame");
                    self.base.change_state(TransportState::Disconnected);
                }
            }
            return;
        };

        self.inner.lock().buffer.extend_from_slice(&message.payload);

        if self.base.state() == TransportState::Connecting && !self.finish_handshake() {
            return;
        }
        self.drain_frames();
    }

    /// Parses the handshake response. Returns `true` once connected.
    fn finish_handshake(&self) -> bool {
        let parsed = {
            let mut inner = self.inner.lock();
            let parsed = self.handshake.lock().parse_response(&inner.buffer);
            if let Ok(Some(used)) = parsed {
                inner.buffer.advance(used);
            }
            parsed
        };

        match parsed {
            Ok(Some(_)) => {
                info!(protocol = ?self.protocol(), "WebSocket handshake accepted");
                self.base.change_state(TransportState::Connected);
                self.schedule_ping();
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.fail(e.to_string());
                false
            }
        }
    }

    fn drain_frames(&self) {
        while self.base.state() == TransportState::Connected {
            let decoded = {
                let mut inner = self.inner.lock();
                match Frame::decode(&inner.buffer, self.config.max_message_size) {
                    Ok(Some((frame, used))) => {
                        inner.buffer.advance(used);
                        Ok(frame)
                    }
                    Ok(None) => return,
                    Err(e) => Err(e),
                }
            };

            match decoded {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => {
                    self.protocol_failure(&e);
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "Frame received");

        match frame.opcode {
            Opcode::Text | Opcode::Binary | Opcode::Continuation => self.handle_data(frame),
            Opcode::Ping => {
                if let Err(e) = self.send_frame(Frame::new(Opcode::Pong, frame.payload)) {
                    warn!(error = %e, "Failed to answer ping");
                }
            }
            Opcode::Pong => self.inner.lock().outstanding_pings = 0,
            Opcode::Close => self.handle_close(&frame),
        }
    }

    fn handle_data(&self, frame: Frame) {
        let complete = {
            let mut inner = self.inner.lock();
            match (frame.opcode, inner.partial.take()) {
                (Opcode::Continuation, None) => Err(FrameError::Protocol("unexpected continuation frame")),
                (Opcode::Continuation, Some((opcode, mut data))) => {
                    if data.len() + frame.payload.len() > self.config.max_message_size {
                        Err(FrameError::TooLarge((data.len() + frame.payload.len()) as u64))
                    } else {
                        data.extend_from_slice(&frame.payload);
                        if frame.fin {
                            Ok(Some((opcode, data)))
                        } else {
                            inner.partial = Some((opcode, data));
                            Ok(None)
                        }
                    }
                }
                (_, Some(_)) => Err(FrameError::Protocol("new message before previous one finished")),
                (opcode, None) if frame.fin => Ok(Some((opcode, BytesMut::from(&frame.payload[..])))),
                (opcode, None) => {
                    inner.partial = Some((opcode, BytesMut::from(&frame.payload[..])));
                    Ok(None)
                }
            }
        };

        match complete {
            Ok(Some((opcode, data))) => self.deliver(opcode, data),
            Ok(None) => {}
            Err(e) => self.protocol_failure(&e),
        }
    }

    fn deliver(&self, opcode: Opcode, data: BytesMut) {
        let message = if opcode == Opcode::Text {
            if std::str::from_utf8(&data).is_err() {
                let close = Frame::close(close_code::INVALID_PAYLOAD, "invalid UTF-8");
                if let Err(e) = self.send_frame(close) {
                    warn!(error = %e, "Failed to send close frame");
                }
                self.fail("text message is not valid UTF-8");
                return;
            }
            Message::new(MessageKind::Text, data.freeze())
        } else {
            Message::binary(data.freeze())
        };

        trace!(len = message.len(), kind = ?message.kind, "WebSocket message received");
        self.base.recv(Some(message));
    }

    fn handle_close(&self, frame: &Frame) {
        let (code, reason) = frame.close_reason();
        info!(?code, %reason, "Close frame received");

        let already_sent = std::mem::replace(&mut self.inner.lock().close_sent, true);
        if !already_sent {
            let echo = Frame::close(code.unwrap_or(close_code::NORMAL), "");
            if let Err(e) = self.send_frame(echo) {
                debug!(error = %e, "Failed to echo close frame");
            }
        }
        self.base.change_state(TransportState::Completed);
    }

    fn protocol_failure(&self, error: &FrameError) {
        if let Err(e) = self.send_frame(Frame::close(error.close_code(), "")) {
            warn!(error = %e, "Failed to send close frame");
        }
        self.fail(error.to_string());
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let encoded = frame.encode(Some(random_mask()?));
        self.lower.send(Message::binary(encoded))
    }

    fn schedule_ping(&self) {
        let Some(interval) = self.config.ping_interval else {
            return;
        };
        let weak = self.weak_self.clone();
        self.ctx.poll().schedule_in(
            interval,
            Box::new(move || {
                if let Some(this) = weak.upgrade() {
                    this.keep_alive();
                }
            }),
        );
    }

    fn keep_alive(&self) {
        if self.base.is_stopped() || self.base.state() != TransportState::Connected {
            return;
        }

        let outstanding = {
            let mut inner = self.inner.lock();
            if inner.close_sent {
                return;
            }
            inner.outstanding_pings += 1;
            inner.outstanding_pings
        };

        let max = self.config.max_outstanding_pings;
        if max > 0 && outstanding > max {
            self.fail(format!("keep-alive timeout: {max} pings unanswered"));
            return;
        }

        trace!(outstanding, "Sending keep-alive ping");
        if let Err(e) = self.send_frame(Frame::new(Opcode::Ping, Vec::new())) {
            warn!(error = %e, "Failed to send ping");
        }
        self.schedule_ping();
    }

    fn fail(&self, reason: impl Into<String>) {
        self.base.fail(reason);
        self.lower.on_recv(None);
        self.lower.stop();
    }
}

fn random_mask() -> Result<[u8; 4]> {
    let mut key = [0u8; 4];
    getrandom::getrandom(&mut key).map_err(|e| Error::connection(format!("random source failed: {e}")))?;
    Ok(key)
}

// ============================================================================
// Transport Implementation
// ============================================================================

impl Transport for WsTransport {
    fn start(&self) -> Result<()> {
        self.base.change_state(TransportState::Connecting);
        let request = self.handshake.lock().request();
        debug!(path = %self.path(), "Sending WebSocket handshake");
        self.lower.send(Message::binary(request.into_bytes()))
    }

    fn stop(&self) {
        if !self.base.mark_stopped() {
            return;
        }
        self.lower.on_recv(None);
        self.lower.stop();
    }

    /// Frames a data message. A control message starts the closing handshake.
    fn send(&self, message: Message) -> Result<()> {
        if self.base.state() != TransportState::Connected || self.inner.lock().close_sent {
            return Err(Error::ConnectionClosed);
        }

        let opcode = match message.kind {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
            MessageKind::Control | MessageKind::Reset => {
                self.close();
                return Ok(());
            }
        };
        self.send_frame(Frame::new(opcode, message.payload))
    }

    fn on_recv(&self, callback: Option<RecvCallback>) {
        self.base.set_recv_callback(callback);
    }

    fn state(&self) -> TransportState {
        self.base.state()
    }

    fn failure(&self) -> Option<String> {
        self.base.failure()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;

    use crate::protocol::http::authority;
    use crate::runtime::Context;
    use crate::test_support::{
        spawn_echo_server, spawn_raw_server, spawn_silent_ws_server, spawn_ws_server_sending,
        state_recorder, wait_until,
    };
    use crate::transport::tcp::{TcpOptions, TcpTransport};

    const WAIT: Duration = Duration::from_secs(10);

    struct Harness {
        ws: Arc<WsTransport>,
        states: Arc<Mutex<Vec<TransportState>>>,
        received: Arc<Mutex<Vec<Message>>>,
    }

    fn connect(addr: SocketAddr, protocols: Vec<String>, config: WsConfig) -> Harness {
        let ctx = Context::acquire().unwrap();
        let slot: Arc<Mutex<Option<Arc<WsTransport>>>> = Arc::new(Mutex::new(None));
        let starter = Arc::clone(&slot);

        let tcp = TcpTransport::with_candidates(
            ctx.clone(),
            vec![addr],
            TcpOptions::default(),
            Some(Arc::new(move |state| {
                if state == TransportState::Connected
                    && let Some(ws) = starter.lock().clone()
                {
                    let _ = ws.start();
                }
            })),
        );

        let handshake = Handshake::new(authority(&addr.ip().to_string(), addr.port()), "/", protocols).unwrap();
        let (callback, states) = state_recorder();
        let ws = WsTransport::new(ctx, tcp.clone(), handshake, config, Some(callback));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        ws.on_recv(Some(Arc::new(move |message: Option<Message>| {
            if let Some(message) = message {
                sink.lock().push(message);
            }
        })));

        *slot.lock() = Some(Arc::clone(&ws));
        tcp.start().unwrap();
        Harness { ws, states, received }
    }

    #[test]
    fn test_echo_text_and_binary() {
        let h = connect(spawn_echo_server(), vec![], WsConfig::default());
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Connected));

        h.ws.send(Message::text("hello")).unwrap();
        h.ws.send(Message::binary(vec![1u8, 2, 3])).unwrap();
        assert!(wait_until(WAIT, || h.received.lock().len() == 2));

        let received = h.received.lock();
        assert_eq!(received[0].kind, MessageKind::Text);
        assert_eq!(&received[0].payload[..], b"hello");
        assert_eq!(received[1].kind, MessageKind::Binary);
        assert_eq!(&received[1].payload[..], &[1, 2, 3]);
        drop(received);
        h.ws.stop();
    }

    #[test]
    fn test_large_message_uses_extended_length() {
        let h = connect(spawn_echo_server(), vec![], WsConfig::default());
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Connected));

        let payload = vec![0xABu8; 100_000];
        h.ws.send(Message::binary(payload.clone())).unwrap();
        assert!(wait_until(WAIT, || h.received.lock().len() == 1));
        assert_eq!(&h.received.lock()[0].payload[..], &payload[..]);
        h.ws.stop();
    }

    #[test]
    fn test_subprotocol_negotiated() {
        let h = connect(spawn_echo_server(), vec!["chat".into()], WsConfig::default());
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Connected));
        assert_eq!(h.ws.protocol().as_deref(), Some("chat"));
        h.ws.stop();
    }

    #[test]
    fn test_close_handshake_completes() {
        let h = connect(spawn_echo_server(), vec![], WsConfig::default());
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Connected));

        h.ws.close();
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Completed));
        assert!(matches!(h.ws.send(Message::text("late")), Err(Error::ConnectionClosed)));
        assert_eq!(
            *h.states.lock(),
            vec![TransportState::Connecting, TransportState::Connected, TransportState::Completed]
        );
    }

    #[test]
    fn test_server_initiated_close() {
        let h = connect(spawn_echo_server(), vec![], WsConfig::default());
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Connected));
        h.ws.send(Message::text("close")).unwrap();
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Completed));
    }

    #[test]
    fn test_oversized_message_fails() {
        let config = WsConfig {
            max_message_size: 1024,
            ..WsConfig::default()
        };
        let h = connect(spawn_echo_server(), vec![], config);
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Connected));

        h.ws.send(Message::text("big:4096")).unwrap();
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Failed));
        assert!(h.ws.failure().unwrap().contains("exceeds the maximum"));
        assert!(h.received.lock().is_empty());
    }

    #[test]
    fn test_bad_accept_fails_handshake() {
        let server = spawn_raw_server(|_| {
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: bogus\r\n\r\n".to_string()
        });
        let h = connect(server, vec![], WsConfig::default());
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Failed));
        assert!(h.ws.failure().unwrap().contains("Sec-WebSocket-Accept mismatch"));
        assert_eq!(
            *h.states.lock(),
            vec![TransportState::Connecting, TransportState::Failed]
        );
    }

    #[test]
    fn test_unanswered_pings_fail() {
        let server = spawn_silent_ws_server();
        let config = WsConfig {
            ping_interval: Some(Duration::from_millis(50)),
            max_outstanding_pings: 2,
            ..WsConfig::default()
        };
        let h = connect(server, vec![], config);
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Connected));
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Failed));
        assert!(h.ws.failure().unwrap().starts_with("keep-alive timeout"));
    }

    #[test]
    fn test_pong_keeps_connection_alive() {
        let config = WsConfig {
            ping_interval: Some(Duration::from_millis(100)),
            max_outstanding_pings: 1,
            ..WsConfig::default()
        };
        let h = connect(spawn_echo_server(), vec![], config);
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Connected));
        std::thread::sleep(Duration::from_millis(550));
        assert_eq!(h.ws.state(), TransportState::Connected);
        h.ws.stop();
    }

    #[test]
    fn test_invalid_utf8_text_fails_without_delivery() {
        let server = spawn_ws_server_sending(vec![0x81, 0x02, 0xFF, 0xFE]);
        let h = connect(server, vec![], WsConfig::default());
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Failed));
        assert!(h.ws.failure().unwrap().contains("not valid UTF-8"));
        assert!(h.received.lock().is_empty());
        assert!(matches!(h.ws.send(Message::text("late")), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_reserved_bits_fail_the_connection() {
        let server = spawn_ws_server_sending(vec![0xC1, 0x02, b'h', b'i']);
        let h = connect(server, vec![], WsConfig::default());
        assert!(wait_until(WAIT, || h.ws.state() == TransportState::Failed));
        assert!(h.ws.failure().unwrap().contains("reserved bits set"));
        assert!(h.received.lock().is_empty());
    }
}
