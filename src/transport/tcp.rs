//! Non-blocking TCP transport.
//!
//! Active mode resolves a host name on the worker pool, then tries each
//! candidate address in order until one connects. Passive mode wraps an
//! already accepted stream.
//!
//! All socket I/O happens either in [`PollService`](crate::runtime::PollService)
//! handlers or directly in [`Transport::send`] when the socket is writable.
//! Outgoing bytes are kept in a byte-limited [`Queue`]; a partially written
//! message keeps its unsent tail in a remainder slot until the next writable
//! event, so nothing is dropped or reordered.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::queue::{Queue, QueueLimit};
use crate::runtime::{ContextToken, Direction, PollEvent, PollParams};

use super::{BufferedAmountCallback, RecvCallback, StateCallback, Transport, TransportBase, TransportState};

// ============================================================================
// Constants
// ============================================================================

/// Read chunk size.
const BUFFER_SIZE: usize = 4096;

// ============================================================================
// Types
// ============================================================================

/// Tuning for a [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    /// Outbound buffer limit in bytes.
    pub send_buffer_limit: usize,
    /// Fail the connection after this long without activity.
    pub read_timeout: Option<Duration>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            send_buffer_limit: crate::config::DEFAULT_SEND_BUFFER_LIMIT,
            read_timeout: None,
        }
    }
}

enum Target {
    Resolve { host: String, port: u16 },
    Addresses(Vec<SocketAddr>),
    Accepted,
}

#[derive(Default)]
struct TcpInner {
    socket: Option<Socket>,
    registered: Option<RawFd>,
    candidates: VecDeque<SocketAddr>,
    connecting: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    remainder: Bytes,
}

// ============================================================================
// TcpTransport
// ============================================================================

/// Non-blocking TCP transport, bottom of every chain.
///
/// # Thread Safety
///
/// Socket state lives behind one lock. The lock is never held while an
/// upper-layer callback runs.
pub struct TcpTransport {
    base: TransportBase,
    ctx: ContextToken,
    weak_self: Weak<Self>,
    target: Target,
    options: TcpOptions,
    inner: Mutex<TcpInner>,
    send_queue: Queue<Message>,
    buffered_callback: Mutex<Option<BufferedAmountCallback>>,
    attempts: AtomicUsize,
}

// ============================================================================
// TcpTransport - Constructors
// ============================================================================

impl TcpTransport {
    /// Creates an active transport for `host:port`.
    #[must_use]
    pub fn new(
        ctx: ContextToken,
        host: impl Into<String>,
        port: u16,
        options: TcpOptions,
        state_callback: Option<StateCallback>,
    ) -> Arc<Self> {
        let host = host.into();
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        Self::build(ctx, Target::Resolve { host, port }, options, state_callback, TcpInner::default())
    }

    /// Creates an active transport over pre-resolved candidates.
    #[cfg(test)]
    pub(crate) fn with_candidates(
        ctx: ContextToken,
        candidates: Vec<SocketAddr>,
        options: TcpOptions,
        state_callback: Option<StateCallback>,
    ) -> Arc<Self> {
        Self::build(
            ctx,
            Target::Addresses(candidates),
            options,
            state_callback,
            TcpInner::default(),
        )
    }

    /// Wraps an accepted stream.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the stream cannot be made non-blocking.
    pub fn from_stream(
        ctx: ContextToken,
        stream: TcpStream,
        options: TcpOptions,
        state_callback: Option<StateCallback>,
    ) -> Result<Arc<Self>> {
        let remote = stream.peer_addr().ok();
        let socket = Socket::from(stream);
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        let inner = TcpInner {
            socket: Some(socket),
            remote,
            ..TcpInner::default()
        };
        Ok(Self::build(ctx, Target::Accepted, options, state_callback, inner))
    }

    fn build(
        ctx: ContextToken,
        target: Target,
        options: TcpOptions,
        state_callback: Option<StateCallback>,
        inner: TcpInner,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            base: TransportBase::new("tcp", state_callback),
            ctx,
            weak_self: weak_self.clone(),
            target,
            options,
            inner: Mutex::new(inner),
            send_queue: Queue::new(QueueLimit::Bytes(options.send_buffer_limit), Message::len),
            buffered_callback: Mutex::new(None),
            attempts: AtomicUsize::new(0),
        })
    }
}

// ============================================================================
// TcpTransport - Accessors
// ============================================================================

impl TcpTransport {
    /// Address of the connected peer, once connected.
    #[must_use]
    pub fn remote_address(&self) -> Option<String> {
        self.inner.lock().remote.map(|addr| addr.to_string())
    }

    /// Number of connection attempts made so far.
    #[inline]
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Bytes accepted by [`send`](Transport::send) but not yet written.
    ///
    /// Includes the unsent tail of a partially written message.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        let inner = self.inner.lock();
        self.send_queue.amount() + inner.remainder.len()
    }

    /// Installs a callback invoked with the new buffered amount after it
    /// changes.
    pub fn on_buffered_amount(&self, callback: Option<BufferedAmountCallback>) {
        *self.buffered_callback.lock() = callback;
    }

    fn report_buffered_amount(&self) {
        let callback = self.buffered_callback.lock().clone();
        if let Some(callback) = callback {
            callback(self.buffered_amount());
        }
    }
}

// ============================================================================
// TcpTransport - Connection Establishment
// ============================================================================

impl TcpTransport {
    fn resolve(&self, host: String, port: u16) {
        let weak = self.weak_self.clone();
        let accepted = self.ctx.pool().enqueue(Box::new(move || {
            let Some(this) = weak.upgrade() else {
                return;
            };
            if this.base.is_stopped() {
                return;
            }

            match (host.as_str(), port).to_socket_addrs() {
                Ok(addrs) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    debug!(%host, port, count = addrs.len(), "Resolved address candidates");
                    this.inner.lock().candidates = addrs.into();
                    this.attempt_next();
                }
                Err(e) => {
                    this.base.fail(format!("resolution of {host}:{port} failed: {e}"));
                }
            }
        }));

        if !accepted {
            self.base.fail("worker pool unavailable for resolution");
        }
    }

    /// Tries remaining candidates in order until one connect is in flight.
    fn attempt_next(&self) {
        loop {
            if self.base.is_stopped() {
                return;
            }

            let Some(addr) = self.inner.lock().candidates.pop_front() else {
                self.base.fail("TCP connection failed: no more addresses to try");
                return;
            };

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(%addr, attempt, "Trying address");

            match self.connect_to(addr) {
                Ok(()) => return,
                Err(e) => warn!(%addr, error = %e, "Connection attempt failed"),
            }
        }
    }

    fn connect_to(&self, addr: SocketAddr) -> io::Result<()> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(e),
        }

        let fd = socket.as_raw_fd();
        {
            let mut inner = self.inner.lock();
            inner.socket = Some(socket);
            inner.connecting = Some(addr);
            inner.registered = Some(fd);
        }

        if let Err(e) = self.register(fd, Direction::Out, None) {
            self.release_socket();
            return Err(e);
        }
        Ok(())
    }

    fn register(&self, fd: RawFd, direction: Direction, timeout: Option<Duration>) -> io::Result<()> {
        let weak = self.weak_self.clone();
        self.ctx.poll().add(
            fd,
            PollParams {
                direction,
                timeout,
                handler: Arc::new(move |event| {
                    if let Some(this) = weak.upgrade() {
                        this.process(event);
                    }
                }),
            },
        )
    }

    fn process_connect(&self) {
        let outcome = {
            let inner = self.inner.lock();
            let Some(socket) = inner.socket.as_ref() else {
                return;
            };
            match socket.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => socket.peer_addr().map(|addr| addr.as_socket()),
            }
        };

        match outcome {
            Ok(remote) => self.on_connected(remote),
            // Spurious wakeup: still connecting.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => {
                let addr = self.inner.lock().connecting.take();
                warn!(addr = ?addr, error = %e, "Connection attempt failed");
                self.release_socket();
                self.attempt_next();
            }
        }
    }

    fn on_connected(&self, remote: Option<SocketAddr>) {
        let fd = {
            let mut inner = self.inner.lock();
            let connecting = inner.connecting.take();
            inner.remote = remote.or(connecting);
            inner.registered
        };

        if let Some(fd) = fd
            && let Err(e) = self.register(fd, self.wanted_direction(), self.options.read_timeout)
        {
            self.fail(format!("failed to register connected socket: {e}"));
            return;
        }

        info!(remote = ?remote, "TCP connected");
        self.base.change_state(TransportState::Connected);
    }
}

// ============================================================================
// TcpTransport - I/O
// ============================================================================

impl TcpTransport {
    fn process(&self, event: PollEvent) {
        if self.base.is_stopped() {
            return;
        }

        if self.inner.lock().connecting.is_some() {
            if event != PollEvent::Timeout {
                self.process_connect();
            }
            return;
        }

        match event {
            PollEvent::In => self.process_read(),
            PollEvent::Out => {
                if let Err(e) = self.flush() {
                    self.fail(format!("TCP send failed: {e}"));
                    return;
                }
                self.report_buffered_amount();
            }
            PollEvent::Timeout => self.fail("TCP read timeout"),
        }
    }

    fn process_read(&self) {
        let mut buffer = [0u8; BUFFER_SIZE];
        loop {
            let result = {
                let inner = self.inner.lock();
                let Some(socket) = inner.socket.as_ref() else {
                    return;
                };
                let mut reader: &Socket = socket;
                reader.read(&mut buffer)
            };

            match result {
                Ok(0) => {
                    info!("TCP connection closed by peer");
                    self.release_socket();
                    self.base.recv(None);
                    self.base.change_state(TransportState::Disconnected);
                    return;
                }
                Ok(len) => {
                    trace!(len, "TCP received");
                    self.base.recv(Some(Message::binary(Bytes::copy_from_slice(&buffer[..len]))));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail(format!("TCP receive failed: {e}"));
                    return;
                }
            }
        }
    }

    /// Writes as much queued data as the socket accepts, then updates the
    /// poll interest.
    fn flush(&self) -> io::Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(socket) = inner.socket.as_ref() else {
            return Ok(());
        };
        let mut writer: &Socket = socket;

        loop {
            if inner.remainder.is_empty() {
                match self.send_queue.pop() {
                    Ok(message) => inner.remainder = message.payload,
                    Err(_) => break,
                }
                continue;
            }

            match writer.write(&inner.remainder) {
                Ok(written) => {
                    trace!(written, "TCP sent");
                    inner.remainder.advance(written);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        let pending = !inner.remainder.is_empty() || !self.send_queue.is_empty();
        if let Some(fd) = inner.registered {
            let direction = if pending { Direction::Both } else { Direction::In };
            self.ctx.poll().set_direction(fd, direction);
        }
        Ok(())
    }

    fn wanted_direction(&self) -> Direction {
        let inner = self.inner.lock();
        if inner.remainder.is_empty() && self.send_queue.is_empty() {
            Direction::In
        } else {
            Direction::Both
        }
    }

    /// Deregisters and closes the socket.
    fn release_socket(&self) {
        let (fd, socket) = {
            let mut inner = self.inner.lock();
            (inner.registered.take(), inner.socket.take())
        };
        if let Some(fd) = fd {
            self.ctx.poll().remove(fd);
        }
        drop(socket);
    }

    fn fail(&self, reason: impl Into<String>) {
        self.release_socket();
        self.base.fail(reason);
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

impl Transport for TcpTransport {
    fn start(&self) -> Result<()> {
        self.base.change_state(TransportState::Connecting);

        match &self.target {
            Target::Resolve { host, port } => self.resolve(host.clone(), *port),
            Target::Addresses(addrs) => {
                self.inner.lock().candidates = addrs.iter().copied().collect();
                self.attempt_next();
            }
            Target::Accepted => {
                let fd = self
                    .inner
                    .lock()
                    .socket
                    .as_ref()
                    .map(AsRawFd::as_raw_fd)
                    .ok_or_else(|| Error::connection("accepted socket already closed"))?;
                self.inner.lock().registered = Some(fd);
                self.register(fd, Direction::In, self.options.read_timeout)?;
                self.base.change_state(TransportState::Connected);
            }
        }
        Ok(())
    }

    fn stop(&self) {
        if !self.base.mark_stopped() {
            return;
        }
        self.release_socket();
        self.send_queue.drain();
        let mut inner = self.inner.lock();
        inner.remainder = Bytes::new();
        inner.candidates.clear();
        inner.connecting = None;
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.base.state() != TransportState::Connected {
            return Err(Error::ConnectionClosed);
        }

        if !message.is_empty() {
            self.send_queue
                .push(message)
                .map_err(|_| Error::queue_full(self.options.send_buffer_limit))?;
        }

        if let Err(e) = self.flush() {
            self.fail(format!("TCP send failed: {e}"));
            return Err(e.into());
        }

        self.report_buffered_amount();
        Ok(())
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

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let fd = self.inner.get_mut().registered.take();
        if let Some(fd) = fd {
            self.ctx.poll().remove(fd);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

// ============================================================================
// Tests
// ============================================================================
