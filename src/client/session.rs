//! # Streaming Session
//!
//! Client side of one duplex session: chunked sends on the caller's task, a
//! background pump that forwards every response to a `ResponseSink`, and an
//! orderly shutdown that does not lose responses already in flight.
//!
//! ## Lifecycle:
//! ```text
//! Idle --start--> Active --send*--> Active --end--> Closing --(pump done)--> Closed
//! ```
//! - `start` is only legal from `Idle`; it returns once the pump is listening.
//! - `send` is only legal while `Active`.
//! - `end` half-closes the outbound side, then joins the pump for at most
//!   `pump_join_timeout`, cancelling it if the budget runs out. Calling it on
//!   a session that is not `Active` does nothing.
//!
//! ## Drain:
//! When the inbound stream reports its end, the pump still makes up to
//! `drain_attempts` receive attempts of `drain_attempt_timeout` each and stops
//! at the first one that yields nothing.
//!
//! ## Receive failures:
//! A failed receive ends the pump and is reported back to the session. From
//! then on `state()` reports `Closing`, and the next `send` shuts the session
//! down and returns the receive error.

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::client::sink::ResponseSink;
use crate::client::transport::{
    Endpoint, InboundHalf, OutboundHalf, StreamConnector, WebSocketConnector,
};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::frame::LogicalMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Closing,
    Closed,
}

/// Shutdown budget for the background pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    pub pump_join_timeout: Duration,
    pub attempts: u32,
    pub attempt_timeout: Duration,
}

impl From<&SessionConfig> for DrainPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            pump_join_timeout: Duration::from_millis(config.pump_join_timeout_ms),
            attempts: config.drain_attempts,
            attempt_timeout: Duration::from_millis(config.drain_attempt_timeout_ms),
        }
    }
}

/// What the pump saw before it finished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    /// Responses read before the stream reported its end
    pub received: u64,
    /// Responses caught by the drain attempts afterwards
    pub drained: u64,
}

impl PumpReport {
    pub fn total(&self) -> u64 {
        self.received + self.drained
    }
}

pub struct StreamingSession {
    connector: Arc<dyn StreamConnector>,
    config: SessionConfig,
    policy: DrainPolicy,
    state: SessionState,

    /// Handed to the pump on a successful `start`
    sink: Option<Box<dyn ResponseSink>>,

    endpoint: Option<Endpoint>,
    outbound: Option<Box<dyn OutboundHalf>>,
    pump: Option<JoinHandle<PumpReport>>,

    /// Set by the pump when a receive fails
    inbound_failure: Option<watch::Receiver<Option<SessionError>>>,

    chunks_sent: u64,
    report: Option<PumpReport>,
}

impl StreamingSession {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        config: SessionConfig,
        sink: impl ResponseSink,
    ) -> Self {
        let policy = DrainPolicy::from(&config);
        Self {
            connector,
            config,
            policy,
            state: SessionState::Idle,
            sink: Some(Box::new(sink)),
            endpoint: None,
            outbound: None,
            pump: None,
            inbound_failure: None,
            chunks_sent: 0,
            report: None,
        }
    }

    /// Session over a real WebSocket connection.
    pub fn websocket(config: SessionConfig, sink: impl ResponseSink) -> Self {
        Self::new(Arc::new(WebSocketConnector), config, sink)
    }

    pub fn state(&self) -> SessionState {
        if self.state == SessionState::Active && self.receive_failure().is_some() {
            SessionState::Closing
        } else {
            self.state
        }
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    /// Pump results, available once the session is `Closed` and the pump
    /// finished on its own.
    pub fn report(&self) -> Option<PumpReport> {
        self.report
    }

    /// Open the duplex channel and start the background pump.
    pub async fn start(
        &mut self,
        endpoint: Endpoint,
        params: &[(String, String)],
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Idle || self.sink.is_none() {
            return Err(SessionError::AlreadyActive);
        }

        let (outbound, inbound) = self.connector.connect(&endpoint, params).await?;
        let sink = self.sink.take().ok_or(SessionError::AlreadyActive)?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (failure_tx, failure_rx) = watch::channel(None);
        let pump = tokio::spawn(run_pump(inbound, sink, self.policy, ready_tx, failure_tx));
        if ready_rx.await.is_err() {
            pump.abort();
            self.state = SessionState::Closed;
            return Err(SessionError::Transport(
                "receive pump exited before it started listening".to_string(),
            ));
        }

        let settle = Duration::from_millis(self.config.start_settle_ms);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        info!(endpoint = %endpoint, params = params.len(), "Streaming session started");
        self.endpoint = Some(endpoint);
        self.outbound = Some(outbound);
        self.pump = Some(pump);
        self.inbound_failure = Some(failure_rx);
        self.state = SessionState::Active;
        Ok(())
    }

    /// Write one chunk to the outbound half.
    ///
    /// A transport failure in either direction ends the session before the
    /// error is returned.
    pub async fn send(&mut self, chunk: impl Into<LogicalMessage>) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        if let Some(err) = self.receive_failure() {
            error!(error = %err, "Inbound half failed, ending session");
            self.shutdown().await;
            return Err(err);
        }
        let outbound = self.outbound.as_mut().ok_or(SessionError::NotActive)?;

        let chunk = chunk.into();
        let bytes = chunk.len();
        match outbound.send(chunk).await {
            Ok(()) => {
                self.chunks_sent += 1;
                debug!(chunk = self.chunks_sent, bytes, "Sent chunk");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Send failed, ending session");
                self.shutdown().await;
                Err(err)
            }
        }
    }

    /// Send `chunks` in order, pausing `cadence` between consecutive chunks.
    /// Returns the number of chunks sent.
    pub async fn stream_chunks<I, C>(&mut self, chunks: I, cadence: Duration) -> Result<usize, SessionError>
    where
        I: IntoIterator<Item = C>,
        C: Into<LogicalMessage>,
    {
        let mut sent = 0;
        for chunk in chunks {
            if sent > 0 && !cadence.is_zero() {
                tokio::time::sleep(cadence).await;
            }
            self.send(chunk).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Stream a file as binary chunks of `chunk_size` bytes at `chunk_cadence`.
    pub async fn stream_file(&mut self, path: impl AsRef<Path>) -> Result<usize, SessionError> {
        let path = path.as_ref();
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        let chunk_size = self.config.chunk_size;
        if chunk_size == 0 {
            return Err(SessionError::InvalidConfig(
                "chunk size must be greater than 0".to_string(),
            ));
        }

        let data = Bytes::from(tokio::fs::read(path).await?);
        info!(
            path = %path.display(),
            bytes = data.len(),
            chunk_size,
            "Streaming file"
        );

        let chunks: Vec<Bytes> = (0..data.len())
            .step_by(chunk_size)
            .map(|offset| data.slice(offset..(offset + chunk_size).min(data.len())))
            .collect();
        self.stream_chunks(chunks, self.config.chunk_cadence()).await
    }

    /// Half-close, wait for the pump within the budget, then mark the session
    /// closed. No-op unless the session is `Active`.
    pub async fn end(&mut self) {
        if self.state != SessionState::Active {
            debug!(state = ?self.state, "end() on inactive session ignored");
            return;
        }
        self.shutdown().await;
    }

    fn receive_failure(&self) -> Option<SessionError> {
        self.inbound_failure
            .as_ref()
            .and_then(|failure| failure.borrow().clone())
    }

    async fn shutdown(&mut self) {
        self.state = SessionState::Closing;
        info!(chunks_sent = self.chunks_sent, "Ending streaming session");

        if let Some(mut outbound) = self.outbound.take() {
            if let Err(err) = outbound.close().await {
                warn!(error = %err, "Half-close failed");
            }
        }

        if let Some(mut pump) = self.pump.take() {
            match timeout(self.policy.pump_join_timeout, &mut pump).await {
                Ok(Ok(report)) => {
                    info!(
                        received = report.received,
                        drained = report.drained,
                        "Receive pump finished"
                    );
                    self.report = Some(report);
                }
                Ok(Err(err)) => error!(error = %err, "Receive pump failed"),
                Err(_) => {
                    warn!(
                        timeout_ms = self.policy.pump_join_timeout.as_millis() as u64,
                        "Receive pump did not finish in time, cancelling"
                    );
                    pump.abort();
                }
            }
        }

        self.state = SessionState::Closed;
        info!("Streaming session closed");
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn run_pump(
    mut inbound: Box<dyn InboundHalf>,
    mut sink: Box<dyn ResponseSink>,
    policy: DrainPolicy,
    ready: oneshot::Sender<()>,
    failure: watch::Sender<Option<SessionError>>,
) -> PumpReport {
    let mut report = PumpReport::default();
    if ready.send(()).is_err() {
        return report;
    }
    debug!("Receive pump listening");

    loop {
        match inbound.recv().await {
            Ok(Some(response)) => {
                report.received += 1;
                debug!(response = report.received, bytes = response.len(), "Received response");
                sink.on_response(response);
            }
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "Receive failed");
                failure.send_replace(Some(err));
                return report;
            }
        }
    }

    for attempt in 1..=policy.attempts {
        match timeout(policy.attempt_timeout, inbound.recv()).await {
            Ok(Ok(Some(response))) => {
                report.drained += 1;
                debug!(attempt, bytes = response.len(), "Drained late response");
                sink.on_response(response);
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                warn!(attempt, error = %err, "Drain receive failed");
                break;
            }
            Err(_) => break,
        }
    }

    report
}
