//! Health and metrics endpoints.
//!
//! - `/health` - liveness probe: 200 while the process runs
//! - `/health/detailed` - liveness plus request counters and cache protection
//! - `/health/components` - per-component stats (pools, caches, queue, sessions)
//! - `/metrics` - the raw counter snapshot

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

use crate::server::AppState;

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// `GET /health`
pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        json!({
            "healthy": true,
            "status": "online",
            "version": env!("CARGO_PKG_VERSION"),
            "node_id": state.args.node_id,
            "uptime_secs": state.uptime().as_secs(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

/// `GET /health/detailed`
pub fn health_detailed(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let metrics = state.metrics.snapshot();
    let protection = state.cache.protection_stats();
    json_response(
        StatusCode::OK,
        json!({
            "healthy": true,
            "status": "online",
            "version": env!("CARGO_PKG_VERSION"),
            "node_id": state.args.node_id,
            "uptime_secs": state.uptime().as_secs(),
            "games": state.args.game_list(),
            "sessions_open": state.sessions.len(),
            "async_queue": state.tasks.stats(),
            "requests": metrics,
            "cache_protection": protection,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

/// `GET /health/components`
pub fn health_components(state: Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        json!({
            "pools": state.pools.stats_all(),
            "l1_cache": state.cache.l1_stats(),
            "l2_cache": state.cache.l2_stats(),
            "cache_protection": state.cache.protection_stats(),
            "async_queue": state.tasks.stats(),
            "sessions": { "open": state.sessions.len() },
            "routes": state.dispatcher.route_count(),
        }),
    )
}

/// `GET /metrics`
pub fn metrics_endpoint(state: Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        json!({
            "requests": state.metrics.snapshot(),
            "cache_protection": state.cache.protection_stats(),
            "pools": state.pools.stats_all(),
        }),
    )
}
