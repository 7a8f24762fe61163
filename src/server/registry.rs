//! # Connection Registry
//!
//! The set of live duplex connections, keyed by connection id. Supports
//! point-to-point replies and fan-out broadcast. A connection whose outbound
//! path has failed is removed as part of the send that discovered the failure.
//!
//! ## Thread Safety:
//! Every connection task can add, remove, reply or broadcast concurrently, so
//! the membership map sits behind an `RwLock`. Delivery itself happens outside
//! the lock: broadcast snapshots the members, delivers, then takes the write
//! lock once to drop the failures.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::protocol::frame::{ConnectionId, OutboundFrame};

/// The outbound path of one connection has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Write side of a connection, as seen by the registry.
///
/// Delivery only enqueues the frame; it must not block.
pub trait OutboundSink: Send + Sync {
    fn deliver(&self, frame: OutboundFrame) -> Result<(), SinkClosed>;
}

impl OutboundSink for mpsc::UnboundedSender<OutboundFrame> {
    fn deliver(&self, frame: OutboundFrame) -> Result<(), SinkClosed> {
        self.send(frame).map_err(|_| SinkClosed)
    }
}

/// Per-connection results of one broadcast pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    /// Connections that failed and were removed
    pub failed: Vec<ConnectionId>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, Arc<dyn OutboundSink>>>>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("live", &self.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Replaces any previous sink under the same id.
    pub fn add(&self, id: ConnectionId, sink: impl OutboundSink + 'static) {
        let live = {
            let mut connections = self.write();
            connections.insert(id, Arc::new(sink));
            connections.len()
        };
        info!(connection = %id, live, "Connection registered");
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let (removed, live) = {
            let mut connections = self.write();
            let removed = connections.remove(&id).is_some();
            (removed, connections.len())
        };
        if removed {
            info!(connection = %id, live, "Connection removed");
        }
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.read().keys().copied().collect()
    }

    /// Deliver a frame to one connection. A connection that cannot take the
    /// frame is removed and the failure is returned, never panicked on.
    pub fn send_to(&self, id: ConnectionId, frame: OutboundFrame) -> Result<(), DeliveryError> {
        let sink = self.read().get(&id).cloned();
        let Some(sink) = sink else {
            return Err(DeliveryError::Unknown(id));
        };

        match sink.deliver(frame) {
            Ok(()) => {
                debug!(connection = %id, "Frame delivered");
                Ok(())
            }
            Err(SinkClosed) => {
                warn!(connection = %id, "Delivery failed, dropping connection");
                self.remove(id);
                Err(DeliveryError::Closed(id))
            }
        }
    }

    /// Deliver a frame to every live connection.
    ///
    /// Failures do not stop delivery to the rest; failed connections are
    /// removed after the pass completes.
    pub fn broadcast(&self, frame: OutboundFrame) -> BroadcastReport {
        let members: Vec<(ConnectionId, Arc<dyn OutboundSink>)> = self
            .read()
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, sink) in members {
            match sink.deliver(frame.clone()) {
                Ok(()) => report.delivered.push(id),
                Err(SinkClosed) => {
                    warn!(connection = %id, "Broadcast delivery failed");
                    report.failed.push(id);
                }
            }
        }

        if !report.failed.is_empty() {
            let mut connections = self.write();
            for id in &report.failed {
                connections.remove(id);
            }
        }

        debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<dyn OutboundSink>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<dyn OutboundSink>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_connection(
        registry: &ConnectionRegistry,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add(id, tx);
        (id, rx)
    }

    fn dead_connection(registry: &ConnectionRegistry) -> ConnectionId {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
        drop(rx);
        registry.add(id, tx);
        id
    }

    #[test]
    fn test_add_remove_is_set_like() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = live_connection(&registry);
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_to_reaches_only_target() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = live_connection(&registry);
        let (_b, mut rx_b) = live_connection(&registry);

        registry.send_to(a, OutboundFrame::Text("hi".to_string())).unwrap();

        assert_eq!(rx_a.try_recv().unwrap(), OutboundFrame::Text("hi".to_string()));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_send_to_failure_removes_connection() {
        let registry = ConnectionRegistry::new();
        let dead = dead_connection(&registry);

        let result = registry.send_to(dead, OutboundFrame::Text("x".to_string()));
        assert_eq!(result, Err(DeliveryError::Closed(dead)));
        assert!(!registry.contains(dead));

        let result = registry.send_to(dead, OutboundFrame::Text("x".to_string()));
        assert_eq!(result, Err(DeliveryError::Unknown(dead)));
    }

    #[test]
    fn test_broadcast_removes_failures_and_reports() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(live_connection(&registry));
        }
        let dead: Vec<_> = (0..2).map(|_| dead_connection(&registry)).collect();

        let report = registry.broadcast(OutboundFrame::Text("all".to_string()));
        assert_eq!(report.attempted(), 5);
        assert_eq!(report.delivered.len(), 3);
        assert_eq!(report.failed.len(), 2);
        for id in &dead {
            assert!(report.failed.contains(id));
            assert!(!registry.contains(*id));
        }
        for (_, rx) in receivers.iter_mut() {
            assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Text("all".to_string()));
        }

        let second = registry.broadcast(OutboundFrame::Text("again".to_string()));
        assert_eq!(second.attempted(), 3);
        assert!(second.failed.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_membership_changes() {
        let registry = ConnectionRegistry::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = ConnectionId::new();
                let (tx, _rx) = mpsc::unbounded_channel();
                registry.add(id, tx);
                registry.broadcast(OutboundFrame::Binary(bytes::Bytes::from_static(b"x")));
                registry.remove(id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
