//! # Message Dispatch
//!
//! The seam between the reassembly machinery and application logic. A
//! `MessageHandler` receives each complete logical message together with the
//! registry it can reply or broadcast through. The relay ships two strategies:
//!
//! - **Echo** (default): text and binary messages go back to the originating
//!   connection only, unmodified.
//! - **Broadcast**: text messages fan out to every live connection; binary
//!   messages are still echoed point-to-point.
//!
//! A deployment that forwards messages to an inference backend supplies its
//! own `MessageHandler` and leaves the rest untouched.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::protocol::frame::{ConnectionId, LogicalMessage, OutboundFrame};
use crate::server::registry::{BroadcastReport, ConnectionRegistry};

/// What happened to one dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent back to the originating connection
    Replied,
    /// Fanned out to all live connections
    Broadcast(BroadcastReport),
    /// The reply could not be delivered; the target was dropped from the registry
    Undelivered(DeliveryError),
}

/// Application strategy for complete logical messages.
pub trait MessageHandler: Send + Sync {
    fn on_message(
        &self,
        origin: ConnectionId,
        message: LogicalMessage,
        registry: &ConnectionRegistry,
    ) -> DispatchOutcome;
}

/// Point-to-point echo of every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn on_message(
        &self,
        origin: ConnectionId,
        message: LogicalMessage,
        registry: &ConnectionRegistry,
    ) -> DispatchOutcome {
        debug!(connection = %origin, kind = %message.kind(), bytes = message.len(), "Echoing message");
        reply(origin, message, registry)
    }
}

/// Text fan-out; binary echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcastHandler;

impl MessageHandler for BroadcastHandler {
    fn on_message(
        &self,
        origin: ConnectionId,
        message: LogicalMessage,
        registry: &ConnectionRegistry,
    ) -> DispatchOutcome {
        match message {
            LogicalMessage::Text(text) => {
                let report = registry.broadcast(OutboundFrame::Text(text));
                if !report.failed.is_empty() {
                    warn!(
                        connection = %origin,
                        failed = report.failed.len(),
                        "Broadcast dropped unreachable connections"
                    );
                }
                DispatchOutcome::Broadcast(report)
            }
            binary @ LogicalMessage::Binary(_) => reply(origin, binary, registry),
        }
    }
}

fn reply(origin: ConnectionId, message: LogicalMessage, registry: &ConnectionRegistry) -> DispatchOutcome {
    match registry.send_to(origin, message.into()) {
        Ok(()) => DispatchOutcome::Replied,
        Err(err) => {
            warn!(connection = %origin, error = %err, "Reply failed");
            DispatchOutcome::Undelivered(err)
        }
    }
}

/// Built-in dispatch strategies, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Echo,
    Broadcast,
}

impl DispatchMode {
    pub fn handler(self) -> Arc<dyn MessageHandler> {
        match self {
            DispatchMode::Echo => Arc::new(EchoHandler),
            DispatchMode::Broadcast => Arc::new(BroadcastHandler),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "echo" => Ok(DispatchMode::Echo),
            "broadcast" => Ok(DispatchMode::Broadcast),
            _ => Err(format!("Unknown dispatch mode: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn connect(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add(id, tx);
        (id, rx)
    }

    #[test]
    fn test_echo_text_goes_back_to_origin_only() {
        let registry = ConnectionRegistry::new();
        let (origin, mut origin_rx) = connect(&registry);
        let (_other, mut other_rx) = connect(&registry);

        let outcome = EchoHandler.on_message(origin, LogicalMessage::Text("M".to_string()), &registry);

        assert_eq!(outcome, DispatchOutcome::Replied);
        assert_eq!(origin_rx.try_recv().unwrap(), OutboundFrame::Text("M".to_string()));
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_echo_binary_is_byte_exact() {
        let registry = ConnectionRegistry::new();
        let (origin, mut rx) = connect(&registry);
        let payload = Bytes::from_static(&[0, 255, 7, 0]);

        EchoHandler.on_message(origin, LogicalMessage::Binary(payload.clone()), &registry);

        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Binary(payload));
    }

    #[test]
    fn test_echo_to_closed_connection_is_not_fatal() {
        let registry = ConnectionRegistry::new();
        let (origin, rx) = connect(&registry);
        drop(rx);

        let outcome = EchoHandler.on_message(origin, LogicalMessage::Text("lost".to_string()), &registry);

        assert_eq!(outcome, DispatchOutcome::Undelivered(DeliveryError::Closed(origin)));
        assert!(!registry.contains(origin));
    }

    #[test]
    fn test_broadcast_mode_fans_out_text() {
        let registry = ConnectionRegistry::new();
        let (origin, mut origin_rx) = connect(&registry);
        let (_other, mut other_rx) = connect(&registry);

        let outcome = BroadcastHandler.on_message(origin, LogicalMessage::Text("all".to_string()), &registry);

        match outcome {
            DispatchOutcome::Broadcast(report) => assert_eq!(report.delivered.len(), 2),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(origin_rx.try_recv().unwrap(), OutboundFrame::Text("all".to_string()));
        assert_eq!(other_rx.try_recv().unwrap(), OutboundFrame::Text("all".to_string()));
    }

    #[test]
    fn test_broadcast_mode_echoes_binary() {
        let registry = ConnectionRegistry::new();
        let (origin, mut origin_rx) = connect(&registry);
        let (_other, mut other_rx) = connect(&registry);

        let outcome = BroadcastHandler.on_message(
            origin,
            LogicalMessage::Binary(Bytes::from_static(b"pcm")),
            &registry,
        );

        assert_eq!(outcome, DispatchOutcome::Replied);
        assert!(origin_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_mode_parsing() {
        assert_eq!("echo".parse::<DispatchMode>(), Ok(DispatchMode::Echo));
        assert_eq!("BROADCAST".parse::<DispatchMode>(), Ok(DispatchMode::Broadcast));
        assert!("fanout".parse::<DispatchMode>().is_err());
    }
}
