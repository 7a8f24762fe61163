//! # Configuration Management
//!
//! Loads relay configuration from multiple sources:
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `DUPLEX_` prefix, `__` between sections)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (hosting platforms set these)
//! 2. Environment variables (`DUPLEX_SERVER__PORT`, `DUPLEX_SESSION__DRAIN_ATTEMPTS`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (the `Default` impls below)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::server::dispatch::DispatchMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
}

/// Server-side settings: where to listen and how to treat inbound frames.
///
/// ## Fields:
/// - `max_frame_bytes`: largest single frame the transport will accept
/// - `max_message_bytes`: cap on a reassembled message; `None` means no cap
/// - `heartbeat_interval_secs`: how often the server pings each connection
/// - `client_timeout_secs`: silence after which a connection is dropped
/// - `dispatch`: `echo` (default) or `broadcast`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
    pub max_message_bytes: Option<usize>,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub dispatch: DispatchMode,
}

/// Client streaming-session settings.
///
/// ## Shutdown budget:
/// After the outbound half closes, the session waits up to
/// `pump_join_timeout_ms` for the receive pump to finish. Once the inbound
/// stream reports its end, the pump still makes up to `drain_attempts`
/// receive attempts of `drain_attempt_timeout_ms` each, stopping at the
/// first one that comes back empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub pump_join_timeout_ms: u64,
    pub drain_attempts: u32,
    pub drain_attempt_timeout_ms: u64,
    pub chunk_size: usize,
    pub chunk_cadence_ms: u64,
    pub start_settle_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_frame_bytes: 64 * 1024,
            max_message_bytes: None,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
            dispatch: DispatchMode::Echo,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pump_join_timeout_ms: 15_000,
            drain_attempts: 10,
            drain_attempt_timeout_ms: 500,
            chunk_size: 512_000,
            chunk_cadence_ms: 500,
            start_settle_ms: 100,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("DUPLEX")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.server.max_message_bytes == Some(0) {
            return Err(anyhow::anyhow!("Max message size must be greater than 0 when set"));
        }

        if self.server.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.server.client_timeout_secs <= self.server.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        self.session.validate()
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pump_join_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Pump join timeout must be greater than 0"));
        }

        if self.drain_attempt_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Drain attempt timeout must be greater than 0"));
        }

        if self.chunk_size == 0 {
            return Err(anyhow::anyhow!("Chunk size must be greater than 0"));
        }

        Ok(())
    }

    pub fn chunk_cadence(&self) -> Duration {
        Duration::from_millis(self.chunk_cadence_ms)
    }
}
