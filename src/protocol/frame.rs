//! # Frame and Message Types
//!
//! The vocabulary shared by the server ingress and the client session:
//! raw frame events as the transport reports them, complete logical messages
//! as the application sees them, and the frames the relay writes back out.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identity of one duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WebSocket close status code (RFC 6455 section 7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL: CloseCode = CloseCode(1002);
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    pub const TOO_BIG: CloseCode = CloseCode(1009);
}

/// Close code plus optional human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// What a peer means by a close frame that carries no status.
    pub fn normal() -> Self {
        Self::new(CloseCode::NORMAL, "")
    }
}

/// Payload kind of a data frame or logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Text => write!(f, "text"),
            MessageKind::Binary => write!(f, "binary"),
        }
    }
}

/// One event delivered by the transport for a connection.
///
/// Text payloads travel as raw bytes: a fragment boundary is free to split a
/// UTF-8 code point, so text is only decoded once the message is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    TextData { payload: Bytes, is_final: bool },
    BinaryData { payload: Bytes, is_final: bool },
    Ping(Bytes),
    Pong(Bytes),
    Close(CloseInfo),
    Disconnect,
    /// A frame kind the relay has no handling for
    Unknown(String),
}

impl FrameEvent {
    /// A complete, unfragmented text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        FrameEvent::TextData {
            payload: payload.into(),
            is_final: true,
        }
    }

    /// A complete, unfragmented binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        FrameEvent::BinaryData {
            payload: payload.into(),
            is_final: true,
        }
    }

    /// A text fragment with more to follow.
    pub fn text_fragment(payload: impl Into<Bytes>) -> Self {
        FrameEvent::TextData {
            payload: payload.into(),
            is_final: false,
        }
    }

    /// A binary fragment with more to follow.
    pub fn binary_fragment(payload: impl Into<Bytes>) -> Self {
        FrameEvent::BinaryData {
            payload: payload.into(),
            is_final: false,
        }
    }
}

/// A complete application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    Text(String),
    Binary(Bytes),
}

impl LogicalMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            LogicalMessage::Text(_) => MessageKind::Text,
            LogicalMessage::Binary(_) => MessageKind::Binary,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            LogicalMessage::Text(text) => text.len(),
            LogicalMessage::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for LogicalMessage {
    fn from(text: String) -> Self {
        LogicalMessage::Text(text)
    }
}

impl From<&str> for LogicalMessage {
    fn from(text: &str) -> Self {
        LogicalMessage::Text(text.to_string())
    }
}

impl From<Bytes> for LogicalMessage {
    fn from(data: Bytes) -> Self {
        LogicalMessage::Binary(data)
    }
}

impl From<Vec<u8>> for LogicalMessage {
    fn from(data: Vec<u8>) -> Self {
        LogicalMessage::Binary(Bytes::from(data))
    }
}

/// A frame the relay writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Pong(Bytes),
    Close(CloseInfo),
}

impl From<LogicalMessage> for OutboundFrame {
    fn from(message: LogicalMessage) -> Self {
        match message {
            LogicalMessage::Text(text) => OutboundFrame::Text(text),
            LogicalMessage::Binary(data) => OutboundFrame::Binary(data),
        }
    }
}
