//! Minimal HTTP/1.1 head parsing shared by the proxy tunnel and the
//! WebSocket handshake.

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use regex::Regex;
use rustc_hash::FxHashMap;

// ============================================================================
// Constants
// ============================================================================

/// Longest response head accepted before giving up.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^HTTP/(\d\.\d)\s+(\d{3})(?:\s+(.*))?$").expect("valid regex")
});

// ============================================================================
// Head Framing
// ============================================================================

/// Returns the length of the head including its terminating blank line, or
/// `None` while incomplete.
#[must_use]
pub fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

// ============================================================================
// StatusLine
// ============================================================================

/// Parsed `HTTP/x.y CODE reason` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    /// Parses a status line. Returns `None` if malformed.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let captures = STATUS_LINE.captures(line.trim_end())?;
        Some(Self {
            version: captures.get(1)?.as_str().to_string(),
            code: captures.get(2)?.as_str().parse().ok()?,
            reason: captures
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        })
    }

    /// Returns `true` for 2xx codes.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

// ============================================================================
// ResponseHead
// ============================================================================

/// Status line plus headers. Header names are stored lowercase; repeated
/// headers are joined with `", "`.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusLine,
    headers: FxHashMap<String, String>,
}

impl ResponseHead {
    /// Parses a complete head (with or without the trailing blank line).
    ///
    /// Returns `None` if the status line is malformed. Header lines without
    /// a colon are skipped.
    #[must_use]
    pub fn parse(head: &str) -> Option<Self> {
        let mut lines = head.split("\r\n");
        let status = StatusLine::parse(lines.next()?)?;

        let mut headers: FxHashMap<String, String> = FxHashMap::default();
        for line in lines.filter(|l| !l.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Some(Self { status, headers })
    }

    /// Header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Returns `true` if the comma-separated header contains `token`,
    /// compared case-insensitively.
    #[must_use]
    pub fn header_contains(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }
}

/// Formats `host:port`, bracketing IPv6 literals.
#[must_use]
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

// ============================================================================
// Tests
// ============================================================================
