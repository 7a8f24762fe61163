//! # Shared Server State
//!
//! State shared by every HTTP handler and every WebSocket connection task:
//! the configuration, the connection registry, the dispatch strategy and a
//! set of counters for the health endpoint.
//!
//! ## Thread Safety:
//! `AppState` is cheap to clone. Immutable parts sit behind `Arc`; the
//! counters sit behind an `RwLock` because every request and every message
//! updates them; the registry does its own locking.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use crate::config::AppConfig;
use crate::server::dispatch::MessageHandler;
use crate::server::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: ConnectionRegistry,
    pub handler: Arc<dyn MessageHandler>,
    pub metrics: Arc<RwLock<RelayMetrics>>,
    pub start_time: Instant,
}

/// Counters collected across HTTP requests and WebSocket traffic.
#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub messages_dispatched: u64,
    pub protocol_errors: u64,

    /// Key: endpoint (e.g. "GET /ping")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build state using the dispatch strategy named in the configuration.
    pub fn new(config: AppConfig) -> Self {
        let handler = config.server.dispatch.handler();
        Self::with_handler(config, handler)
    }

    /// Build state around a custom message handler.
    pub fn with_handler(config: AppConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
            handler,
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.update_metrics(|metrics| {
            metrics.request_count += 1;
            if is_error {
                metrics.error_count += 1;
            }

            let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    pub fn record_connection_opened(&self) {
        self.update_metrics(|metrics| metrics.connections_opened += 1);
    }

    pub fn record_connection_closed(&self) {
        self.update_metrics(|metrics| metrics.connections_closed += 1);
    }

    pub fn record_message_dispatched(&self) {
        self.update_metrics(|metrics| metrics.messages_dispatched += 1);
    }

    pub fn record_protocol_error(&self) {
        self.update_metrics(|metrics| metrics.protocol_errors += 1);
    }

    /// Copy of the counters, taken under the read lock.
    pub fn metrics_snapshot(&self) -> RelayMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn update_metrics(&self, update: impl FnOnce(&mut RelayMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_request("GET /ping", 10, false);
        state.record_request("GET /ping", 30, true);

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);

        let ping = &metrics.endpoint_metrics["GET /ping"];
        assert_eq!(ping.average_duration_ms(), 20.0);
        assert_eq!(ping.error_rate(), 0.5);
    }

    #[test]
    fn test_connection_counters() {
        let state = AppState::new(AppConfig::default());
        state.record_connection_opened();
        state.record_connection_opened();
        state.record_connection_closed();
        state.record_protocol_error();

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.connections_opened, 2);
        assert_eq!(metrics.connections_closed, 1);
        assert_eq!(metrics.protocol_errors, 1);
    }

    #[test]
    fn test_empty_endpoint_metric_rates() {
        let metric = EndpointMetric::default();
        assert_eq!(metric.average_duration_ms(), 0.0);
        assert_eq!(metric.error_rate(), 0.0);
    }
}
