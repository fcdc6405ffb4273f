//! HTTP CONNECT proxy tunnel.
//!
//! Started once the lower transport is connected. Sends a `CONNECT` request
//! for the target, buffers the proxy's response head, and on a 2xx status
//! becomes a transparent pass-through. Bytes that arrive after the head are
//! forwarded upward unchanged.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::http::{MAX_HEAD_SIZE, StatusLine, authority, find_head_end};

use super::{RecvCallback, StateCallback, Transport, TransportBase, TransportState};

// ============================================================================
// HttpProxyTransport
// ============================================================================

/// CONNECT tunnel over a lower byte-stream transport.
pub struct HttpProxyTransport {
    base: TransportBase,
    lower: Arc<dyn Transport>,
    target: String,
    credentials: Option<(String, String)>,
    buffer: Mutex<Vec<u8>>,
}

impl HttpProxyTransport {
    /// Creates a tunnel to `host:port` through `lower`.
    #[must_use]
    pub fn new(
        lower: Arc<dyn Transport>,
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
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
                base: TransportBase::new("http-proxy", state_callback),
                lower,
                target: authority(host, port),
                credentials,
                buffer: Mutex::new(Vec::new()),
            }
        })
    }

    /// Builds the CONNECT request head.
    fn request(&self) -> String {
        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n",
            target = self.target
        );
        if let Some((username, password)) = &self.credentials {
            let token = BASE64.encode(format!("{username}:{password}"));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");
        request
    }

    fn incoming(&self, message: Option<Message>) {
        if self.base.is_stopped() {
            return;
        }

        if self.base.state() == TransportState::Connected {
            self.base.recv(message);
            return;
        }

        let Some(message) = message else {
            self.fail("proxy closed the connection before responding");
            return;
        };

        let (status, leftover) = {
            let mut buffer = self.buffer.lock();
            buffer.extend_from_slice(&message.payload);

            let Some(end) = find_head_end(&buffer) else {
                if buffer.len() > MAX_HEAD_SIZE {
                    drop(buffer);
                    self.fail("proxy response head too large");
                }
                return;
            };

            let head = String::from_utf8_lossy(&buffer[..end]).into_owned();
            let leftover = Bytes::copy_from_slice(&buffer[end..]);
            buffer.clear();
            (head.lines().next().and_then(StatusLine::parse), leftover)
        };

        match status {
            Some(status) if status.is_success() => {
                info!(target = %self.target, code = status.code, "Proxy tunnel established");
                self.base.change_state(TransportState::Connected);
                if !leftover.is_empty() {
                    self.base.recv(Some(Message::binary(leftover)));
                }
            }
            Some(status) => {
                self.fail(format!("proxy refused CONNECT: {} {}", status.code, status.reason));
            }
            None => self.fail("malformed proxy response"),
        }
    }

    fn fail(&self, reason: impl Into<String>) {
        self.base.fail(reason);
        self.lower.on_recv(None);
        self.lower.stop();
    }
}

impl Transport for HttpProxyTransport {
    fn start(&self) -> Result<()> {
        self.base.change_state(TransportState::Connecting);
        debug!(target = %self.target, "Sending CONNECT request");
        self.lower
            .send(Message::binary(self.request().into_bytes()))
            .map_err(|e| Error::proxy(format!("failed to send CONNECT: {e}")))
    }

    fn stop(&self) {
        if !self.base.mark_stopped() {
            return;
        }
        self.lower.on_recv(None);
        self.lower.stop();
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.base.state() != TransportState::Connected {
            return Err(Error::ConnectionClosed);
        }
        self.lower.send(message)
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

    use std::net::{SocketAddr, TcpListener};
    use std::thread;
    use std::time::Duration;

    use crate::runtime::Context;
    use crate::test_support::{spawn_connect_proxy, spawn_raw_server, state_recorder, wait_until};
    use crate::transport::tcp::{TcpOptions, TcpTransport};

    const WAIT: Duration = Duration::from_secs(10);

    /// Starts TCP to `proxy`, then the tunnel once TCP connects.
    fn tunnel_to(
        proxy: SocketAddr,
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        recv: Option<RecvCallback>,
    ) -> (Arc<HttpProxyTransport>, Arc<Mutex<Vec<TransportState>>>) {
        let ctx = Context::acquire().unwrap();
        let slot: Arc<Mutex<Option<Arc<HttpProxyTransport>>>> = Arc::new(Mutex::new(None));
        let starter = Arc::clone(&slot);

        let tcp = TcpTransport::with_candidates(
            ctx,
            vec![proxy],
            TcpOptions::default(),
            Some(Arc::new(move |state| {
                if state == TransportState::Connected
                    && let Some(tunnel) = starter.lock().clone()
                {
                    tunnel.start().unwrap();
                }
            })),
        );

        let (callback, states) = state_recorder();
        let tunnel = HttpProxyTransport::new(tcp.clone(), host, port, credentials, Some(callback));
        tunnel.on_recv(recv);
        *slot.lock() = Some(Arc::clone(&tunnel));
        tcp.start().unwrap();
        (tunnel, states)
    }

    fn collector() -> (RecvCallback, Arc<Mutex<Vec<u8>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let callback: RecvCallback = Arc::new(move |message: Option<Message>| {
            if let Some(message) = message {
                sink.lock().extend_from_slice(&message.payload);
            }
        });
        (callback, received)
    }

    #[test]
    fn test_request_format() {
        let ctx = Context::acquire().unwrap();
        let tcp = TcpTransport::with_candidates(ctx, vec![], TcpOptions::default(), None);
        let tunnel = HttpProxyTransport::new(
            tcp,
            "example.com",
            443,
            Some(("user".into(), "pass".into())),
            None,
        );
        assert_eq!(
            tunnel.request(),
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"
        );
    }

    #[test]
    fn test_tunnel_passes_bytes_through() {
        let target = TcpListener::bind("127.0.0.1:0").unwrap();
        let target_addr = target.local_addr().unwrap();
        let echo = thread::spawn(move || {
            use std::io::{Read, Write};
            let (mut stream, _) = target.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let proxy = spawn_connect_proxy(None);
        let (recv, received) = collector();
        let (tunnel, states) =
            tunnel_to(proxy.addr, "127.0.0.1", target_addr.port(), None, Some(recv));

        assert!(wait_until(WAIT, || tunnel.state() == TransportState::Connected));
        tunnel.send(Message::binary(&b"hello"[..])).unwrap();
        assert!(wait_until(WAIT, || received.lock().len() == 5));
        assert_eq!(&received.lock()[..], b"hello");
        assert_eq!(
            *states.lock(),
            vec![TransportState::Connecting, TransportState::Connected]
        );
        assert!(proxy.requests.lock()[0].starts_with(&format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n", target_addr.port())));

        echo.join().unwrap();
        tunnel.stop();
    }

    #[test]
    fn test_leftover_bytes_after_head_are_forwarded() {
        let server = spawn_raw_server(|_| "HTTP/1.1 200 OK\r\n\r\nearly".to_string());
        let (recv, received) = collector();
        let (tunnel, _) = tunnel_to(server, "example.com", 80, None, Some(recv));

        assert!(wait_until(WAIT, || tunnel.state() == TransportState::Connected));
        assert!(wait_until(WAIT, || received.lock().as_slice() == b"early"));
        tunnel.stop();
    }

    #[test]
    fn test_non_2xx_fails_and_stops_lower() {
        let proxy = spawn_connect_proxy(Some("Basic dXNlcjpwYXNz"));
        let (tunnel, states) = tunnel_to(proxy.addr, "127.0.0.1", 9, None, None);

        assert!(wait_until(WAIT, || tunnel.state() == TransportState::Failed));
        assert_eq!(
            *states.lock(),
            vec![TransportState::Connecting, TransportState::Failed]
        );
        assert_eq!(tunnel.lower.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_credentials_accepted() {
        let target = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();
        let proxy = spawn_connect_proxy(Some("Basic dXNlcjpwYXNz"));
        let (tunnel, _) = tunnel_to(
            proxy.addr,
            "127.0.0.1",
            port,
            Some(("user".into(), "pass".into())),
            None,
        );

        assert!(wait_until(WAIT, || tunnel.state() == TransportState::Connected));
        tunnel.stop();
        drop(target);
    }

    #[test]
    fn test_malformed_response_fails() {
        let server = spawn_raw_server(|_| "garbage\r\n\r\n".to_string());
        let (tunnel, _) = tunnel_to(server, "example.com", 80, None, None);
        assert!(wait_until(WAIT, || tunnel.state() == TransportState::Failed));
    }
}
