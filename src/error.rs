//! # Error Handling
//!
//! Error types for every layer of the relay, and how the HTTP-facing ones are
//! turned into JSON responses.
//!
//! ## Error Categories:
//! - **ProtocolError**: the peer broke the framing rules. Fatal to that one
//!   connection, never to the process.
//! - **DeliveryError**: an outbound frame could not be handed to a connection.
//!   The registry drops the connection and carries on.
//! - **SessionError**: misuse of a client streaming session (`send` before
//!   `start`, double `start`) or a transport failure underneath it.
//! - **AppError**: anything an HTTP handler returns to a caller.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::protocol::frame::{CloseCode, ConnectionId};

/// Framing rule violations detected while reassembling inbound frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A fragment of one kind arrived while a run of the other kind was open
    MixedFragments,

    /// The aggregate size of a fragment run passed the configured cap
    MessageTooLarge { limit: usize, attempted: usize },

    /// A completed text message was not valid UTF-8
    InvalidUtf8,

    /// A continuation fragment arrived with no run open
    UnexpectedContinuation,

    /// The transport delivered a frame kind the relay does not understand
    UnknownFrame(String),
}

impl ProtocolError {
    /// Close code sent to the peer when this error tears a connection down.
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::MessageTooLarge { .. } => CloseCode::TOO_BIG,
            ProtocolError::InvalidUtf8 => CloseCode::INVALID_PAYLOAD,
            ProtocolError::MixedFragments
            | ProtocolError::UnexpectedContinuation
            | ProtocolError::UnknownFrame(_) => CloseCode::PROTOCOL,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MixedFragments => {
                write!(f, "text and binary fragments interleaved on one connection")
            }
            ProtocolError::MessageTooLarge { limit, attempted } => write!(
                f,
                "fragmented message of {} bytes exceeds limit of {} bytes",
                attempted, limit
            ),
            ProtocolError::InvalidUtf8 => write!(f, "text message is not valid UTF-8"),
            ProtocolError::UnexpectedContinuation => {
                write!(f, "continuation frame without a preceding first fragment")
            }
            ProtocolError::UnknownFrame(kind) => write!(f, "unknown frame type: {}", kind),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Failure to hand an outbound frame to a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection's outbound path has shut down
    Closed(ConnectionId),

    /// No live connection with this id is registered
    Unknown(ConnectionId),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Closed(id) => write!(f, "connection {} is closed", id),
            DeliveryError::Unknown(id) => write!(f, "connection {} is not registered", id),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Errors surfaced by a client-side streaming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `start` called on a session that is already active or finished
    AlreadyActive,

    /// `send` called on a session that is not active
    NotActive,

    /// The duplex channel could not be established
    Connect(String),

    /// Sending or receiving failed mid-session
    Transport(String),

    /// Reading local input (e.g. an audio file) failed
    Io(String),

    /// The session settings cannot be used for the requested operation
    InvalidConfig(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyActive => write!(f, "session already active"),
            SessionError::NotActive => write!(f, "session not active"),
            SessionError::Connect(msg) => write!(f, "connect failed: {}", msg),
            SessionError::Transport(msg) => write!(f, "transport error: {}", msg),
            SessionError::Io(msg) => write!(f, "input error: {}", msg),
            SessionError::InvalidConfig(msg) => write!(f, "invalid session config: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

/// Errors returned by HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest → 400 (Bad Request)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "JSON parsing error: ...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// JSON parsing errors are almost always the client's fault, so they become
/// a 400 rather than a 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
