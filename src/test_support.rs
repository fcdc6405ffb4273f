//! Shared helpers for in-crate tests: peers, a CONNECT proxy, and polling
//! waits.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing_subscriber::EnvFilter;

use crate::transport::{StateCallback, TransportState};

// ============================================================================
// Fixtures
// ============================================================================

/// CA certificate that signed [`SERVER_CERT_PEM`].
pub const CA_PEM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/tls/ca.pem");

/// Server certificate for `localhost` and `127.0.0.1`.
pub const SERVER_CERT_PEM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/tls/server.pem");

/// PKCS#8 key of [`SERVER_CERT_PEM`].
pub const SERVER_KEY_PEM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/tls/server.key");

// ============================================================================
// General
// ============================================================================

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// A state callback that records every state it sees.
pub fn state_recorder() -> (StateCallback, Arc<Mutex<Vec<TransportState>>>) {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    (Arc::new(move |state| sink.lock().push(state)), states)
}

// ============================================================================
// WebSocket Echo Server (tokio)
// ============================================================================

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime")
    })
}

/// Starts a compliant echo server.
///
/// Text and binary messages are echoed. The text command `close` makes the
/// server start the closing handshake; `big:N` makes it send `N` bytes.
/// The first requested sub-protocol is accepted.
pub fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().expect("addr");

    runtime().spawn(async move {
        let listener = tokio::net::TcpListener::from_std(listener).expect("tokio listener");
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_echo(stream));
        }
    });

    addr
}

fn select_protocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let first = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    if let Some(protocol) = first
        && let Ok(value) = protocol.parse()
    {
        response.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    Ok(response)
}

async fn serve_echo(stream: tokio::net::TcpStream) {
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, select_protocol).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    while let Some(Ok(message)) = read.next().await {
        let reply = match &message {
            WsMessage::Text(text) if text.as_str() == "close" => Some(WsMessage::Close(None)),
            WsMessage::Text(text) => match text.as_str().strip_prefix("big:") {
                Some(size) => size
                    .parse::<usize>()
                    .ok()
                    .map(|n| WsMessage::binary(vec![7u8; n])),
                None => Some(message.clone()),
            },
            WsMessage::Binary(_) => Some(message.clone()),
            _ => None,
        };

        if let Some(reply) = reply
            && write.send(reply).await.is_err()
        {
            break;
        }
    }
}

// ============================================================================
// WebSocket Echo Server (TLS, std threads)
// ============================================================================

fn server_tls_config() -> Arc<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(SERVER_CERT_PEM).expect("cert")))
        .collect::<Result<Vec<_>, _>>()
        .expect("parse cert");
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(SERVER_KEY_PEM).expect("key")))
        .expect("parse key")
        .expect("key present");

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("server config");
    Arc::new(config)
}

/// Starts a TLS echo server presenting [`SERVER_CERT_PEM`].
pub fn spawn_tls_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let config = server_tls_config();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let config = Arc::clone(&config);
            thread::spawn(move || {
                let Ok(connection) = rustls::ServerConnection::new(config) else {
                    return;
                };
                let tls = rustls::StreamOwned::new(connection, stream);
                let Ok(mut ws) = tungstenite::accept(tls) else {
                    return;
                };
                loop {
                    match ws.read() {
                        Ok(message) if message.is_text() || message.is_binary() => {
                            if ws.send(message).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            });
        }
    });

    addr
}

// ============================================================================
// Raw HTTP Server
// ============================================================================

/// Starts a server that answers each request with `respond(request)` and
/// then keeps the connection open, reading and discarding input.
pub fn spawn_raw_server<R>(respond: impl Fn(&str) -> R + Send + Sync + 'static) -> SocketAddr
where
    R: AsRef<[u8]>,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let respond = Arc::new(respond);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let respond = Arc::clone(&respond);
            thread::spawn(move || {
                let Ok(request) = read_head(&mut stream) else {
                    return;
                };
                if stream.write_all(respond(&request).as_ref()).is_err() {
                    return;
                }
                let mut sink = [0u8; 1024];
                while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
            });
        }
    });

    addr
}

/// Starts a server that accepts the WebSocket handshake and then ignores
/// every frame, never answering pings or close frames.
pub fn spawn_silent_ws_server() -> SocketAddr {
    spawn_ws_server_sending(Vec::new())
}

/// Starts a server that accepts the WebSocket handshake, writes `frames`
/// verbatim right after it, and then ignores every frame.
pub fn spawn_ws_server_sending(frames: Vec<u8>) -> SocketAddr {
    spawn_raw_server(move |request| {
        let key = request
            .lines()
            .find_map(|line| {
                line.split_once(':')
                    .filter(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-key"))
                    .map(|(_, value)| value.trim().to_string())
            })
            .unwrap_or_default();
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            crate::protocol::accept_key(&key)
        )
        .into_bytes();
        response.extend_from_slice(&frames);
        response
    })
}

/// Reads an HTTP head up to and including the blank line.
fn read_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

// ============================================================================
// CONNECT Proxy
// ============================================================================

/// Minimal HTTP CONNECT proxy.
pub struct TestProxy {
    pub addr: SocketAddr,
    /// Request heads received, in order.
    pub requests: Arc<Mutex<Vec<String>>>,
}

/// Starts a CONNECT proxy. With `expected_auth`, requests without that
/// exact `Proxy-Authorization` value get a 407.
pub fn spawn_connect_proxy(expected_auth: Option<&'static str>) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requests);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(client) = stream else { break };
            let log = Arc::clone(&log);
            thread::spawn(move || {
                let _ = tunnel(client, expected_auth, &log);
            });
        }
    });

    TestProxy { addr, requests }
}

fn tunnel(
    mut client: TcpStream,
    expected_auth: Option<&str>,
    log: &Mutex<Vec<String>>,
) -> io::Result<()> {
    let head = read_head(&mut client)?;
    log.lock().push(head.clone());

    let target = head
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("CONNECT "))
        .and_then(|rest| rest.split(' ').next())
        .unwrap_or_default()
        .to_string();

    if let Some(expected) = expected_auth {
        let authorized = head.lines().any(|line| {
            line.split_once(':').is_some_and(|(name, value)| {
                name.eq_ignore_ascii_case("proxy-authorization") && value.trim() == expected
            })
        });
        if !authorized {
            client.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")?;
            return Ok(());
        }
    }

    let Ok(mut upstream) = TcpStream::connect(&target) else {
        client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")?;
        return Ok(());
    };
    client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")?;

    let mut client_reader = client.try_clone()?;
    let mut upstream_writer = upstream.try_clone()?;
    let forward = thread::spawn(move || {
        let _ = io::copy(&mut client_reader, &mut upstream_writer);
        let _ = upstream_writer.shutdown(Shutdown::Write);
    });
    let _ = io::copy(&mut upstream, &mut client);
    let _ = client.shutdown(Shutdown::Write);
    let _ = forward.join();
    Ok(())
}
