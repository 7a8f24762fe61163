//! # Duplex Relay Server
//!
//! Entry point for the relay's HTTP/WebSocket server.
//!
//! ## Startup:
//! 1. Load `.env`, then set up tracing
//! 2. Load and validate layered configuration
//! 3. Build shared state (registry + dispatch strategy + counters)
//! 4. Serve until the server fails or SIGINT/SIGTERM arrives, then stop gracefully

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duplex_relay::config::AppConfig;
use duplex_relay::middleware::RequestTelemetry;
use duplex_relay::state::AppState;
use duplex_relay::{configure_routes, STREAM_PATH};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        bind = %config.server.bind_addr(),
        dispatch = ?config.server.dispatch,
        max_frame_bytes = config.server.max_frame_bytes,
        max_message_bytes = ?config.server.max_message_bytes,
        "Configuration loaded"
    );

    let bind_addr = config.server.bind_addr();
    let app_state = AppState::new(config);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(RequestTelemetry)
            .configure(configure_routes)
    })
    .bind(&bind_addr)?
    .run();

    info!("Listening on {} (streaming endpoint {})", bind_addr, STREAM_PATH);

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to stdout. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duplex_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGTERM or SIGINT. Falls back to Ctrl+C alone if the Unix
/// handlers cannot be installed.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = signal(SignalKind::terminate())
        .and_then(|term| Ok((term, signal(SignalKind::interrupt())?)));

    match handlers {
        Ok((mut sigterm, mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        Err(e) => {
            warn!("Failed to install signal handlers: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}
