//! TLS client transport.
//!
//! Wraps a byte-stream transport with a rustls [`ClientConnection`]. The
//! handshake is driven by incoming records: every chunk from the lower layer
//! is fed to the engine, new records the engine wants to send are flushed
//! down, and the transport reports [`TransportState::Connected`] once the
//! handshake is complete. Nothing here blocks.
//!
//! Verification follows [`TlsOptions`]: the peer chain is checked against a
//! PEM CA file or the bundled webpki roots, and the host name against the
//! certificate. A rejected certificate fails the transport before anything
//! above it sees a connection. With verification disabled, any certificate
//! is accepted but handshake signatures are still checked.

// ============================================================================
// Imports
// ============================================================================

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, info, trace, warn};

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::message::Message;

use super::{RecvCallback, StateCallback, Transport, TransportBase, TransportState};

// ============================================================================
// TlsOptions
// ============================================================================

/// Certificate material and verification policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Verify the peer chain and host name.
    pub verify: bool,
    /// Trusted CA certificates, replacing the bundled roots.
    pub ca_certificate_pem_file: Option<PathBuf>,
    /// Client certificate chain.
    pub certificate_pem_file: Option<PathBuf>,
    /// Client private key.
    pub key_pem_file: Option<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify: true,
            ca_certificate_pem_file: None,
            certificate_pem_file: None,
            key_pem_file: None,
        }
    }
}

impl From<&WebSocketConfig> for TlsOptions {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            verify: !config.disable_tls_verification,
            ca_certificate_pem_file: config.ca_certificate_pem_file.clone(),
            certificate_pem_file: config.certificate_pem_file.clone(),
            key_pem_file: config.key_pem_file.clone(),
        }
    }
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Builds a rustls client configuration.
///
/// # Errors
///
/// Returns [`Error::Config`] if a PEM file cannot be read or holds nothing
/// usable, and [`Error::Tls`] if rustls rejects the material.
pub fn client_config(provider: &Arc<CryptoProvider>, options: &TlsOptions) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls(e.to_string()))?;

    let builder = if options.verify {
        builder.with_root_certificates(root_store(options.ca_certificate_pem_file.as_deref())?)
    } else {
        warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(Arc::clone(provider))))
    };

    let config = match (&options.certificate_pem_file, &options.key_pem_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certificates(cert)?, load_private_key(key)?)
            .map_err(|e| Error::tls(format!("client certificate rejected: {e}")))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::config(
                "certificate_pem_file and key_pem_file must be set together",
            ));
        }
    };

    Ok(Arc::new(config))
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for certificate in load_certificates(path)? {
                roots
                    .add(certificate)
                    .map_err(|e| Error::config(format!("invalid CA certificate in {}: {e}", path.display())))?;
            }
            debug!(path = %path.display(), count = roots.len(), "Loaded CA certificates");
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certificates = rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("invalid PEM in {}: {e}", path.display())))?;

    if certificates.is_empty() {
        return Err(Error::config(format!("no certificates in {}", path.display())));
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open_pem(path)?)
        .map_err(|e| Error::config(format!("invalid PEM in {}: {e}", path.display())))?
        .ok_or_else(|| Error::config(format!("no private key in {}", path.display())))
}

// ============================================================================
// NoVerification
// ============================================================================

/// Accepts any certificate; still verifies handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ============================================================================
// TlsTransport
// ============================================================================

#[derive(Default)]
struct Decrypted {
    plaintext: Vec<u8>,
    handshake_done: bool,
    peer_closed: bool,
}

/// TLS client over a lower byte-stream transport.
///
/// # Thread Safety
///
/// The engine lives behind one lock that is never held while calling the
/// lower transport or an upper callback. A second lock orders record flushes
/// so concurrent senders cannot interleave records.
pub struct TlsTransport {
    base: TransportBase,
    lower: Arc<dyn Transport>,
    host: String,
    connection: Mutex<ClientConnection>,
    flush_lock: Mutex<()>,
}

impl TlsTransport {
    /// Creates a TLS layer for `host` over `lower`.
    ///
    /// SNI is sent for host names, not for IP literals.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if `host` is not a valid server name or the
    /// engine cannot be created.
    pub fn new(
        lower: Arc<dyn Transport>,
        config: Arc<ClientConfig>,
        host: &str,
        state_callback: Option<StateCallback>,
    ) -> Result<Arc<Self>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(bare.to_string())
            .map_err(|e| Error::tls(format!("invalid server name {host:?}: {e}")))?;
        let connection = ClientConnection::new(config, server_name)?;

        Ok(Arc::new_cyclic(|weak_self: &Weak<Self>| {
            let weak = weak_self.clone();
            lower.on_recv(Some(Arc::new(move |message| {
                if let Some(this) = weak.upgrade() {
                    this.incoming(message);
                }
            })));

            Self {
                base: TransportBase::new("tls", state_callback),
                lower,
                host: bare.to_string(),
                connection: Mutex::new(connection),
                flush_lock: Mutex::new(()),
            }
        }))
    }

    /// Negotiated protocol version, once connected.
    #[must_use]
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.connection.lock().protocol_version()
    }

    fn incoming(&self, message: Option<Message>) {
        if self.base.is_stopped() {
            return;
        }

        let Some(message) = message else {
            if self.base.state() == TransportState::Connected {
                self.base.recv(None);
                self.base.change_state(TransportState::Disconnected);
            } else {
                self.fail("connection closed during TLS handshake");
            }
            return;
        };

        let decrypted = self.decrypt(&message.payload);
        // Handshake continuations and alerts are queued even on failure.
        let flushed = self.flush_records();

        let decrypted = match decrypted {
            Ok(decrypted) => decrypted,
            Err(reason) => {
                self.fail(reason);
                return;
            }
        };
        if let Err(e) = flushed {
            self.fail(format!("TLS send failed: {e}"));
            return;
        }

        if decrypted.handshake_done {
            info!(host = %self.host, version = ?self.protocol_version(), "TLS handshake finished");
            self.base.change_state(TransportState::Connected);
        }

        if !decrypted.plaintext.is_empty() {
            trace!(len = decrypted.plaintext.len(), "TLS decrypted");
            self.base.recv(Some(Message::binary(decrypted.plaintext)));
        }

        if decrypted.peer_closed {
            debug!("TLS close_notify received");
            self.base.recv(None);
            self.base.change_state(TransportState::Disconnected);
        }
    }

    /// Feeds ciphertext to the engine and drains the resulting plaintext.
    fn decrypt(&self, mut data: &[u8]) -> std::result::Result<Decrypted, String> {
        let mut connection = self.connection.lock();
        let was_handshaking = connection.is_handshaking();
        let mut out = Decrypted::default();

        while !data.is_empty() {
            connection
                .read_tls(&mut data)
                .map_err(|e| format!("TLS read failed: {e}"))?;
            let io_state = connection.process_new_packets().map_err(describe)?;

            let available = io_state.plaintext_bytes_to_read();
            if available > 0 {
                let start = out.plaintext.len();
                out.plaintext.resize(start + available, 0);
                connection
                    .reader()
                    .read_exact(&mut out.plaintext[start..])
                    .map_err(|e| format!("TLS plaintext read failed: {e}"))?;
            }
            if io_state.peer_has_closed() {
                out.peer_closed = true;
            }
        }

        out.handshake_done = was_handshaking && !connection.is_handshaking();
        Ok(out)
    }

    /// Sends every record the engine has queued.
    fn flush_records(&self) -> Result<()> {
        let _ordered = self.flush_lock.lock();
        let records = {
            let mut connection = self.connection.lock();
            let mut records = Vec::new();
            while connection.wants_write() {
                if connection.write_tls(&mut records)? == 0 {
                    break;
                }
            }
            records
        };

        if records.is_empty() {
            return Ok(());
        }
        self.lower.send(Message::binary(records))
    }

    fn fail(&self, reason: impl Into<String>) {
        self.base.fail(reason);
        self.lower.on_recv(None);
        self.lower.stop();
    }
}

/// Maps an engine error to a failure reason.
fn describe(error: rustls::Error) -> String {
    match error {
        rustls::Error::InvalidCertificate(reason) => {
            format!("certificate verification failed: {reason:?}")
        }
        rustls::Error::NoCertificatesPresented => {
            "certificate verification failed: no certificate presented".to_string()
        }
        other => format!("TLS handshake failed: {other}"),
    }
}

impl Transport for TlsTransport {
    fn start(&self) -> Result<()> {
        self.base.change_state(TransportState::Connecting);
        debug!(host = %self.host, "Starting TLS handshake");
        self.flush_records()
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
        self.connection.lock().writer().write_all(&message.payload)?;
        self.flush_records()
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
