//! # Duplex Relay
//!
//! Bidirectional streaming over WebSocket, both ends:
//!
//! - **Server**: fragment reassembly, control-frame handling and message
//!   dispatch for every connection on `/invocations-bidirectional-stream`,
//!   next to the `/ping`, `/invocations` and `/health` HTTP endpoints.
//! - **Client**: a streaming session that pumps chunks out, drains responses
//!   in the background, and shuts down without dropping the last ones.

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod middleware;
pub mod protocol;
pub mod server;
pub mod state;

use actix_web::web;

/// Path of the streaming WebSocket endpoint.
pub const STREAM_PATH: &str = "/invocations-bidirectional-stream";

/// Register every route the relay serves.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ping", web::get().to(health::ping))
        .route("/ping", web::post().to(health::ping))
        .route("/invocations", web::post().to(health::invocations))
        .route("/health", web::get().to(health::health_check))
        .route(STREAM_PATH, web::get().to(server::stream_endpoint));
}
