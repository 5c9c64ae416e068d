//! Health check endpoints
//!
//! Liveness, readiness and the Prometheus scrape endpoint.

use crate::metrics::GatewayMetrics;
use crate::nats::NatsPublisher;
use crate::shard::ShardState;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub cluster_id: u32,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub cluster_id: u32,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub nats_connected: bool,
    /// Mean heartbeat round trip; null until a shard measured one
    pub latency_ms: Option<u64>,
    pub packets_received: u64,
    pub events_routed: u64,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub nats: Option<Arc<NatsPublisher>>,
    pub metrics: Arc<GatewayMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        cluster_id: state.shard_state.cluster_id(),
    })
}

fn readiness(state: &ShardState, nats_connected: bool) -> ReadyResponse {
    let shards_ready = state.ready_shards();
    ReadyResponse {
        ready: shards_ready > 0 && nats_connected,
        cluster_id: state.cluster_id(),
        shards_total: state.shard_count(),
        shards_ready,
        nats_connected,
        latency_ms: state.mean_latency().map(|latency| latency.as_millis() as u64),
        packets_received: state.total_packets_received(),
        events_routed: state.total_events_routed(),
    }
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let nats_connected = state.nats.as_ref().map_or(true, |n| n.is_connected());
    let response = readiness(&state.shard_state, nats_connected);

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .set_shards(state.shard_state.ready_shards(), state.shard_state.shard_count());

    if let Some(ref nats) = state.nats {
        state.metrics.set_nats_connected(nats.is_connected());
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardStage;
    use std::time::Duration;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.3.0",
            cluster_id: 0,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
    }

    #[test]
    fn readiness_needs_a_ready_shard_and_nats() {
        let state = ShardState::new(1);
        state.register(25);
        state.register(26);

        let response = readiness(&state, true);
        assert!(!response.ready);
        assert_eq!(response.latency_ms, None);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"latency_ms\":null"));

        state.set_stage(25, ShardStage::Ready);
        state.record_latency(25, Duration::from_millis(42));
        let response = readiness(&state, true);
        assert!(response.ready);
        assert_eq!(response.shards_ready, 1);
        assert_eq!(response.shards_total, 2);
        assert_eq!(response.latency_ms, Some(42));
        assert_eq!(response.cluster_id, 1);

        assert!(!readiness(&state, false).ready);
    }
}
