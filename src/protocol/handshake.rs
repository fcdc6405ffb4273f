//! WebSocket opening handshake (RFC 6455 section 4).
//!
//! Generates the client upgrade request and validates the server response:
//! status 101, `Upgrade: websocket`, `Connection: Upgrade`, and an accept
//! value derived from the request key.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

use super::http::{MAX_HEAD_SIZE, ResponseHead, find_head_end};

// ============================================================================
// Constants
// ============================================================================

/// Fixed GUID appended to the key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Length of the random nonce before encoding.
pub const KEY_LENGTH: usize = 16;

const SWITCHING_PROTOCOLS: u16 = 101;

// ============================================================================
// Handshake
// ============================================================================

/// Client side of the opening handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    host: String,
    path: String,
    protocols: Vec<String>,
    key: String,
    protocol: Option<String>,
}

impl Handshake {
    /// Creates a handshake with a fresh random key.
    ///
    /// `host` is the `Host` header value (`host[:port]`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the system random source fails.
    pub fn new(host: impl Into<String>, path: impl Into<String>, protocols: Vec<String>) -> Result<Self> {
        Ok(Self::with_key(host, path, protocols, generate_key()?))
    }

    /// Creates a handshake with a caller-chosen key.
    #[must_use]
    pub fn with_key(
        host: impl Into<String>,
        path: impl Into<String>,
        protocols: Vec<String>,
        key: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Self {
            host: host.into(),
            path: if path.is_empty() { "/".to_string() } else { path },
            protocols,
            key: key.into(),
            protocol: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Requested sub-protocols.
    #[inline]
    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Sub-protocol selected by the server, once the response is parsed.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Builds the HTTP upgrade request.
    #[must_use]
    pub fn request(&self) -> String {
        let mut request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {key}\r\n",
            path = self.path,
            host = self.host,
            key = self.key,
        );
        if !self.protocols.is_empty() {
            request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", self.protocols.join(", ")));
        }
        request.push_str("\r\n");
        request
    }

    /// Parses the server response from the start of `buffer`.
    ///
    /// Returns `Ok(None)` while the head is incomplete, and the head length
    /// once it validated. Bytes after the head belong to the frame stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] for a malformed or oversized head, a
    /// status other than 101, a missing upgrade header, an accept mismatch,
    /// or a sub-protocol that was not requested.
    pub fn parse_response(&mut self, buffer: &[u8]) -> Result<Option<usize>> {
        let Some(end) = find_head_end(buffer) else {
            if buffer.len() > MAX_HEAD_SIZE {
                return Err(Error::handshake("response head too large"));
            }
            return Ok(None);
        };

        let text = std::str::from_utf8(&buffer[..end])
            .map_err(|_| Error::handshake("response head is not valid UTF-8"))?;
        let head = ResponseHead::parse(text).ok_or_else(|| Error::handshake("malformed status line"))?;

        if head.status.code != SWITCHING_PROTOCOLS {
            return Err(Error::handshake(format!(
                "unexpected status {} {}",
                head.status.code, head.status.reason
            )));
        }
        if !head.header_contains("upgrade", "websocket") {
            return Err(Error::handshake("missing Upgrade: websocket"));
        }
        if !head.header_contains("connection", "upgrade") {
            return Err(Error::handshake("missing Connection: Upgrade"));
        }

        let accept = head
            .header("sec-websocket-accept")
            .ok_or_else(|| Error::handshake("missing Sec-WebSocket-Accept"))?;
        if accept != accept_key(&self.key) {
            return Err(Error::handshake("Sec-WebSocket-Accept mismatch"));
        }

        self.protocol = match head.header("sec-websocket-protocol") {
            Some(protocol) if !self.protocols.iter().any(|p| p == protocol) => {
                return Err(Error::handshake(format!("unrequested sub-protocol {protocol:?}")));
            }
            Some(protocol) => Some(protocol.to_string()),
            None => None,
        };

        Ok(Some(end))
    }
}

// ============================================================================
// Key Derivation
// ============================================================================

/// Encodes 16 random bytes.
fn generate_key() -> Result<String> {
    let mut nonce = [0u8; KEY_LENGTH];
    getrandom::getrandom(&mut nonce)
        .map_err(|e| Error::handshake(format!("random source failed: {e}")))?;
    Ok(BASE64.encode(nonce))
}

/// Accept value the server must return for `key`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn response(accept: &str, extra: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n{extra}\r\n"
        )
    }

    fn handshake(protocols: &[&str]) -> Handshake {
        Handshake::with_key(
            "example.com:8080",
            "/chat?room=1",
            protocols.iter().map(ToString::to_string).collect(),
            RFC_KEY,
        )
    }

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(accept_key(RFC_KEY), RFC_ACCEPT);
    }

    #[test]
    fn test_generated_key_is_16_random_bytes() {
        let a = Handshake::new("h", "/", vec![]).unwrap();
        let b = Handshake::new("h", "/", vec![]).unwrap();
        assert_eq!(BASE64.decode(a.key()).unwrap().len(), KEY_LENGTH);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_request_format() {
        let request = handshake(&["chat", "superchat"]).request();
        assert!(request.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:8080\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains("Connection: Upgrade\r\n"));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.contains(&format!("Sec-WebSocket-Key: {RFC_KEY}\r\n")));
        assert!(request.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_request_without_protocols_or_path() {
        let request = Handshake::with_key("h", "", vec![], RFC_KEY).request();
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(!request.contains("Sec-WebSocket-Protocol"));
    }

    #[test]
    fn test_valid_response_accepted() {
        let mut hs = handshake(&[]);
        let head = response(RFC_ACCEPT, "");
        let mut buffer = head.clone().into_bytes();
        buffer.extend_from_slice(b"\x81\x00");
        assert_eq!(hs.parse_response(&buffer).unwrap(), Some(head.len()));
        assert_eq!(hs.protocol(), None);
    }

    #[test]
    fn test_incomplete_response_waits() {
        let mut hs = handshake(&[]);
        let head = response(RFC_ACCEPT, "");
        assert_eq!(hs.parse_response(&head.as_bytes()[..20]).unwrap(), None);
    }

    #[test]
    fn test_accept_mismatch_rejected() {
        let mut hs = handshake(&[]);
        let bad = response("s3pPLMBiTxaQ9kYGzzhZRbK+xOp=", "");
        assert!(matches!(
            hs.parse_response(bad.as_bytes()),
            Err(Error::Handshake { .. })
        ));
    }

    #[test]
    fn test_headers_case_insensitive() {
        let mut hs = handshake(&[]);
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: WebSocket\r\nCONNECTION: keep-alive, upgrade\r\nsec-websocket-accept: {RFC_ACCEPT}\r\n\r\n"
        );
        assert!(hs.parse_response(head.as_bytes()).unwrap().is_some());
    }

    #[test]
    fn test_wrong_status_and_missing_headers_rejected() {
        let mut hs = handshake(&[]);
        let not_found = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        assert!(hs.parse_response(not_found.as_bytes()).is_err());

        let no_upgrade = format!(
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {RFC_ACCEPT}\r\n\r\n"
        );
        assert!(hs.parse_response(no_upgrade.as_bytes()).is_err());

        let no_accept = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(hs.parse_response(no_accept.as_bytes()).is_err());

        assert!(hs.parse_response(b"garbage\r\n\r\n").is_err());
    }

    #[test]
    fn test_oversized_head_rejected() {
        let mut hs = handshake(&[]);
        let endless = vec![b'a'; MAX_HEAD_SIZE + 1];
        assert!(hs.parse_response(&endless).is_err());
    }

    #[test]
    fn test_negotiated_protocol() {
        let mut hs = handshake(&["chat", "superchat"]);
        let head = response(RFC_ACCEPT, "Sec-WebSocket-Protocol: superchat\r\n");
        assert!(hs.parse_response(head.as_bytes()).unwrap().is_some());
        assert_eq!(hs.protocol(), Some("superchat"));

        let mut hs = handshake(&["chat"]);
        let head = response(RFC_ACCEPT, "Sec-WebSocket-Protocol: other\r\n");
        assert!(hs.parse_response(head.as_bytes()).is_err());
    }
}
