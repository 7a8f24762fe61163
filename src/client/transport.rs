//! # Streaming Transport
//!
//! The "invoke remote streaming endpoint" capability used by client sessions.
//! A `StreamConnector` opens a duplex channel and hands back its two halves,
//! which the session drives independently: the caller's task writes to the
//! `OutboundHalf`, the background pump reads from the `InboundHalf`.
//!
//! `WebSocketConnector` is the production implementation on top of
//! `tokio-tungstenite`. Tests plug in an in-memory connector instead.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::SessionError;
use crate::protocol::frame::LogicalMessage;

/// Where a session connects: a base URL plus the streaming invocation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub invocation_path: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, invocation_path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            invocation_path: invocation_path.into(),
        }
    }

    /// Full WebSocket URL with `params` encoded as the query string.
    ///
    /// `http`/`https` bases are mapped to `ws`/`wss`.
    pub fn url(&self, params: &[(String, String)]) -> Result<Url, SessionError> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| SessionError::Connect(format!("invalid base URL {}: {}", self.base_url, e)))?;
        let mut url = base.join(&self.invocation_path).map_err(|e| {
            SessionError::Connect(format!("invalid invocation path {}: {}", self.invocation_path, e))
        })?;

        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| SessionError::Connect(format!("cannot use scheme {}", scheme)))?;
        }

        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.invocation_path.trim_start_matches('/')
        )
    }
}

/// Write side of a duplex session.
#[async_trait]
pub trait OutboundHalf: Send {
    async fn send(&mut self, chunk: LogicalMessage) -> Result<(), SessionError>;

    /// Signal "no more input" without touching the inbound half.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Read side of a duplex session.
#[async_trait]
pub trait InboundHalf: Send {
    /// Next response, or `Ok(None)` once the remote has ended the stream.
    async fn recv(&mut self) -> Result<Option<LogicalMessage>, SessionError>;
}

pub type DuplexHalves = (Box<dyn OutboundHalf>, Box<dyn InboundHalf>);

/// Opens duplex sessions against a remote endpoint.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        params: &[(String, String)],
    ) -> Result<DuplexHalves, SessionError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for WebSocket endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        params: &[(String, String)],
    ) -> Result<DuplexHalves, SessionError> {
        let url = endpoint.url(params)?;
        info!(url = %url, "Opening WebSocket session");

        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = stream.split();
        Ok((
            Box::new(WebSocketOutbound { sink }),
            Box::new(WebSocketInbound {
                stream,
                finished: false,
            }),
        ))
    }
}

pub struct WebSocketOutbound {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl OutboundHalf for WebSocketOutbound {
    async fn send(&mut self, chunk: LogicalMessage) -> Result<(), SessionError> {
        let message = match chunk {
            LogicalMessage::Text(text) => Message::Text(text),
            LogicalMessage::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(SessionError::Transport(e.to_string())),
        }
    }
}

pub struct WebSocketInbound {
    stream: SplitStream<WsStream>,
    finished: bool,
}

#[async_trait]
impl InboundHalf for WebSocketInbound {
    async fn recv(&mut self) -> Result<Option<LogicalMessage>, SessionError> {
        while !self.finished {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(LogicalMessage::Text(text))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(LogicalMessage::Binary(Bytes::from(data))))
                }
                // Keep reading so the closing handshake completes.
                Some(Ok(Message::Close(frame))) => {
                    debug!(close = ?frame, "Remote closed the stream");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
                | None => self.finished = true,
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(SessionError::Transport(e.to_string()));
                }
            }
        }
        Ok(None)
    }
}
