//! # HTTP Surfaces
//!
//! The plain HTTP endpoints that sit next to the streaming WebSocket:
//! - `GET|POST /ping`: liveness probe for load balancers
//! - `POST /invocations`: one-shot JSON invocation, echoed back in a wrapper
//! - `GET /health`: uptime, live connections and traffic counters

use actix_web::{web, HttpResponse};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::AppResult;
use crate::state::AppState;

pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "response": "pong" }))
}

/// Echo the request JSON inside a success envelope. An empty body counts as `{}`.
pub async fn invocations(body: web::Bytes) -> AppResult<HttpResponse> {
    let request_data: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(&body)?
    };
    debug!(bytes = body.len(), "Invocation received");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Invocation processed",
        "request_data": request_data
    })))
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let config = &state.config;

    let mut endpoints: Vec<Value> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms()
            })
        })
        .collect();
    endpoints.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "dispatch": config.server.dispatch
        },
        "connections": {
            "live": state.registry.len(),
            "opened": metrics.connections_opened,
            "closed": metrics.connections_closed
        },
        "traffic": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "messages_dispatched": metrics.messages_dispatched,
            "protocol_errors": metrics.protocol_errors
        },
        "endpoints": endpoints
    }))
}
