//! Message types moved through the transport chain.
//!
//! A [`Message`] is a tagged byte payload. Transports pass messages up and
//! down the chain; users see the payload as [`MessageData`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::Bytes;

// ============================================================================
// MessageKind
// ============================================================================

/// Kind tag carried by every [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    /// Opaque binary payload.
    #[default]
    Binary,
    /// UTF-8 text payload.
    Text,
    /// Control message (close request between layers).
    Control,
    /// Stream reset.
    Reset,
}

impl MessageKind {
    /// Returns `true` for Binary and Text.
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Binary | Self::Text)
    }
}

// ============================================================================
// FrameInfo
// ============================================================================

/// Optional delivery metadata attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Codec identifier of the frame.
    pub payload_type: u8,
    /// Media timestamp.
    pub timestamp: u32,
}

// ============================================================================
// Message
// ============================================================================

/// A tagged byte payload.
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Payload kind.
    pub kind: MessageKind,
    /// Stream or priority tag.
    pub stream: u32,
    /// Payload bytes.
    pub payload: Bytes,
    /// Optional delivery metadata.
    pub info: Option<FrameInfo>,
}

impl Message {
    /// Creates a message of the given kind.
    #[inline]
    #[must_use]
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stream: 0,
            payload: payload.into(),
            info: None,
        }
    }

    /// Creates a binary message.
    #[inline]
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Binary, payload)
    }

    /// Creates a text message.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, Bytes::from(text.into()))
    }

    /// Creates a control message.
    #[inline]
    #[must_use]
    pub fn control(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Control, payload)
    }

    /// Sets the stream tag.
    #[inline]
    #[must_use]
    pub fn with_stream(mut self, stream: u32) -> Self {
        self.stream = stream;
        self
    }

    /// Attaches delivery metadata.
    #[inline]
    #[must_use]
    pub fn with_info(mut self, info: FrameInfo) -> Self {
        self.info = Some(info);
        self
    }

    /// Payload length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Size counted against buffers and limits.
    ///
    /// Control and reset messages weigh zero.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        if self.kind.is_data() {
            self.payload.len()
        } else {
            0
        }
    }

    /// Converts a data message into user-facing [`MessageData`].
    ///
    /// Returns `None` for control and reset messages. Text that is not valid
    /// UTF-8 is converted lossily.
    #[must_use]
    pub fn into_data(self) -> Option<MessageData> {
        match self.kind {
            MessageKind::Binary => Some(MessageData::Binary(self.payload.to_vec())),
            MessageKind::Text => Some(MessageData::Text(
                String::from_utf8_lossy(&self.payload).into_owned(),
            )),
            MessageKind::Control | MessageKind::Reset => None,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("stream", &self.stream)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl From<MessageData> for Message {
    fn from(data: MessageData) -> Self {
        match data {
            MessageData::Binary(bytes) => Self::binary(bytes),
            MessageData::Text(text) => Self::text(text),
        }
    }
}

// ============================================================================
// MessageData
// ============================================================================

/// User-facing message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    /// Binary payload.
    Binary(Vec<u8>),
    /// Text payload.
    Text(String),
}

impl MessageData {
    /// Payload length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(bytes) => bytes.len(),
            Self::Text(text) => text.len(),
        }
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` for text payloads.
    #[inline]
    #[must_use]
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }
}

impl From<String> for MessageData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for MessageData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for MessageData {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_weighs_zero() {
        let msg = Message::control(vec![0x03, 0xE8]);
        assert_eq!(msg.len(), 2);
        assert_eq!(msg.size(), 0);
    }

    #[test]
    fn test_data_size() {
        assert_eq!(Message::binary(vec![1u8, 2, 3]).size(), 3);
        assert_eq!(Message::text("hello").size(), 5);
    }

    #[test]
    fn test_into_data() {
        assert_eq!(
            Message::text("hi").into_data(),
            Some(MessageData::Text("hi".into()))
        );
        assert_eq!(
            Message::binary(vec![9u8]).into_data(),
            Some(MessageData::Binary(vec![9]))
        );
        assert_eq!(Message::new(MessageKind::Reset, Bytes::new()).into_data(), None);
    }

    #[test]
    fn test_from_message_data() {
        let msg: Message = MessageData::from("abc").into();
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(&msg.payload[..], b"abc");
    }

    #[test]
    fn test_builder_metadata() {
        let info = FrameInfo {
            payload_type: 96,
            timestamp: 1234,
        };
        let msg = Message::binary(vec![0u8; 4]).with_stream(7).with_info(info);
        assert_eq!(msg.stream, 7);
        assert_eq!(msg.info, Some(info));
    }
}
