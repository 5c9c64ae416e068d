//! Shard health registry
//!
//! Shared, lock-free-ish view of every owned shard for the HTTP surface. Shard
//! runners write into it; handlers only read.

use super::ShardStage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub stage: ShardStage,
    pub latency: Option<Duration>,
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub events_routed: AtomicU64,
    pub route_failures: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub ready_since: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            stage: ShardStage::Idle,
            latency: None,
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            events_routed: AtomicU64::new(0),
            route_failures: AtomicU64::new(0),
            last_heartbeat_ack: None,
            ready_since: None,
        }
    }
}

/// Shared state across all shards of this process
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    cluster_id: u32,
    shards: DashMap<u32, ShardStateEntry>,
}

impl ShardState {
    pub fn new(cluster_id: u32) -> Self {
        Self {
            inner: Arc::new(ShardStateInner {
                cluster_id,
                shards: DashMap::new(),
            }),
        }
    }

    pub fn cluster_id(&self) -> u32 {
        self.inner.cluster_id
    }

    /// Start tracking a shard.
    pub fn register(&self, shard_id: u32) {
        self.inner.shards.entry(shard_id).or_default();
    }

    pub fn set_stage(&self, shard_id: u32, stage: ShardStage) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.stage = stage;
            match stage {
                ShardStage::Ready if entry.ready_since.is_none() => {
                    entry.ready_since = Some(Instant::now());
                }
                ShardStage::Ready => {}
                _ => entry.ready_since = None,
            }
        }
    }

    pub fn record_latency(&self, shard_id: u32, latency: Duration) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.latency = Some(latency);
            entry.last_heartbeat_ack = Some(Instant::now());
        }
    }

    /// Forget the measured latency once the connection is gone.
    pub fn clear_latency(&self, shard_id: u32) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.latency = None;
        }
    }

    pub fn record_received(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.packets_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sent(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_route(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_routed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_route_failure(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.route_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stage(&self, shard_id: u32) -> Option<ShardStage> {
        self.inner.shards.get(&shard_id).map(|e| e.stage)
    }

    pub fn total_packets_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.packets_received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn total_events_routed(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_routed.load(Ordering::Relaxed))
            .sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.stage == ShardStage::Ready)
            .count()
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Mean heartbeat latency over shards that have one.
    pub fn mean_latency(&self) -> Option<Duration> {
        let samples: Vec<Duration> = self.inner.shards.iter().filter_map(|e| e.latency).collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    /// Check if at least one shard is ready
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }
}
