//! Prometheus metrics module
//!
//! Thin wrapper over the `metrics` facade. Series are keyed by shard id where
//! the question is "which shard", and left unlabeled otherwise.

use crate::error::GatewayError;
use crate::protocol::OpCode;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    handle: Arc<PrometheusHandle>,
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder.
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Collector with no global recorder. Recording is a no-op and rendering
    /// yields an empty exposition; used by tests and embedders that bring
    /// their own recorder.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: Arc::new(recorder.handle()),
        }
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "gateway_packets_received_total",
            Unit::Count,
            "Gateway payloads received"
        );
        describe_counter!(
            "gateway_packets_sent_total",
            Unit::Count,
            "Gateway payloads sent"
        );
        describe_counter!(
            "gateway_events_routed_total",
            Unit::Count,
            "Dispatch events published to the event bus"
        );
        describe_counter!(
            "gateway_route_failures_total",
            Unit::Count,
            "Dispatch events the event bus rejected"
        );
        describe_counter!(
            "gateway_commands_total",
            Unit::Count,
            "Bus commands by outcome"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );

        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round trip"
        );
        describe_histogram!(
            "gateway_identify_wait_seconds",
            Unit::Seconds,
            "Time spent queued for an identify bucket"
        );
        describe_histogram!(
            "gateway_event_route_duration_seconds",
            Unit::Seconds,
            "Time to publish an event to the event bus"
        );

        describe_gauge!(
            "gateway_shards_alive",
            Unit::Count,
            "Shards in the ready state"
        );
        describe_gauge!(
            "gateway_shards_total",
            Unit::Count,
            "Shards owned by this process"
        );
        describe_gauge!(
            "gateway_nats_connected",
            Unit::Count,
            "NATS connection status (1=connected, 0=disconnected)"
        );
    }

    pub fn record_packet_received(&self, shard_id: u32, op: OpCode, event_type: Option<&str>) {
        counter!(
            "gateway_packets_received_total",
            "shard_id" => shard_id.to_string(),
            "op" => op.name(),
            "event_type" => event_type.unwrap_or("none").to_ascii_lowercase()
        )
        .increment(1);
    }

    pub fn record_packet_sent(&self, shard_id: u32, op: OpCode) {
        counter!(
            "gateway_packets_sent_total",
            "shard_id" => shard_id.to_string(),
            "op" => op.name()
        )
        .increment(1);
    }

    pub fn record_heartbeat_latency(&self, shard_id: u32, latency: Duration) {
        histogram!(
            "gateway_heartbeat_latency_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(latency.as_secs_f64());
    }

    pub fn record_identify_wait(&self, bucket: u16, waited: Duration) {
        histogram!(
            "gateway_identify_wait_seconds",
            "bucket" => bucket.to_string()
        )
        .record(waited.as_secs_f64());
    }

    /// Record successful publish to NATS
    pub fn record_route_success(&self, shard_id: u32, duration: Duration) {
        counter!(
            "gateway_events_routed_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);

        histogram!(
            "gateway_event_route_duration_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record failed publish
    pub fn record_route_failure(&self, shard_id: u32) {
        counter!(
            "gateway_route_failures_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a bus command outcome (`delivered`, `undeliverable`, `malformed`)
    pub fn record_command(&self, outcome: &'static str) {
        counter!("gateway_commands_total", "outcome" => outcome).increment(1);
    }

    /// Record gateway error with its error type label
    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    pub fn set_shards(&self, alive: usize, total: usize) {
        gauge!("gateway_shards_alive").set(alive as f64);
        gauge!("gateway_shards_total").set(total as f64);
    }

    /// Set NATS connection status
    pub fn set_nats_connected(&self, connected: bool) {
        gauge!("gateway_nats_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
