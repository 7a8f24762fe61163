//! # Control-Frame Handling
//!
//! Decides what a connection does in response to ping, pong, close,
//! disconnect and unknown frames, and to protocol errors raised by the
//! reassembler. The handler only decides; the connection task carries the
//! decision out on its transport.
//!
//! ## Close handshake:
//! A close frame from the peer is acknowledged with the same code and reason,
//! unless this side already sent a close of its own. Every path (peer close,
//! local close, disconnect, protocol failure) ends in the same teardown, and
//! asking for teardown twice is harmless.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::error::ProtocolError;
use crate::protocol::frame::{CloseInfo, ConnectionId};
use crate::protocol::reassembler::ControlFrame;

/// What the connection task should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Nothing to do
    Ignore,
    /// Answer a ping
    Pong(Bytes),
    /// Send the given close frame (if any) and tear the connection down
    Close(Option<CloseInfo>),
    /// Tear down immediately without writing anything
    Teardown,
}

/// Per-connection close-handshake bookkeeping.
#[derive(Debug)]
pub struct ControlHandler {
    connection: ConnectionId,
    close_sent: bool,
    peer_close: Option<CloseInfo>,
}

impl ControlHandler {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            close_sent: false,
            peer_close: None,
        }
    }

    pub fn handle(&mut self, frame: ControlFrame) -> ControlAction {
        match frame {
            ControlFrame::Ping(payload) => {
                debug!(connection = %self.connection, payload_len = payload.len(), "Received ping");
                ControlAction::Pong(payload)
            }
            ControlFrame::Pong(payload) => {
                debug!(connection = %self.connection, payload_len = payload.len(), "Received pong");
                ControlAction::Ignore
            }
            ControlFrame::Close(info) => {
                info!(
                    connection = %self.connection,
                    code = info.code.0,
                    reason = %info.reason,
                    "Received close frame"
                );
                self.peer_close = Some(info.clone());
                ControlAction::Close(self.claim_close(info))
            }
            ControlFrame::Disconnect => {
                info!(connection = %self.connection, "Peer disconnected");
                self.close_sent = true;
                ControlAction::Teardown
            }
            ControlFrame::Unknown(kind) => {
                self.protocol_failure(&ProtocolError::UnknownFrame(kind))
            }
        }
    }

    /// Turn a protocol violation into a close with the matching status code.
    pub fn protocol_failure(&mut self, err: &ProtocolError) -> ControlAction {
        match err {
            ProtocolError::UnknownFrame(_) => {
                error!(connection = %self.connection, error = %err, "Terminating connection")
            }
            _ => warn!(connection = %self.connection, error = %err, "Protocol error, closing connection"),
        }
        let info = CloseInfo::new(err.close_code(), err.to_string());
        ControlAction::Close(self.claim_close(info))
    }

    /// Close initiated by this side (heartbeat timeout, shutdown).
    pub fn local_close(&mut self, info: CloseInfo) -> ControlAction {
        ControlAction::Close(self.claim_close(info))
    }

    /// Close frame the peer sent, if one arrived.
    pub fn peer_close(&self) -> Option<&CloseInfo> {
        self.peer_close.as_ref()
    }

    pub fn is_closing(&self) -> bool {
        self.close_sent
    }

    /// Returns the frame to send only the first time a close goes out.
    fn claim_close(&mut self, info: CloseInfo) -> Option<CloseInfo> {
        if self.close_sent {
            None
        } else {
            self.close_sent = true;
            Some(info)
        }
    }
}
