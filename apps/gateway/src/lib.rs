//! Arrakis shard gateway
//!
//! Sharded Discord gateway client: one state machine per shard, identify
//! buckets shared across processes, sessions that survive reconnects, and a
//! NATS relay for events out and commands in.

pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod identify;
pub mod metrics;
pub mod nats;
pub mod protocol;
pub mod session;
pub mod shard;

pub use cluster::{Cluster, ShardingMode, Target};
pub use error::GatewayError;
pub use gateway::Gateway;
pub use shard::{ShardContext, ShardHandle, ShardSettings, ShardStage};
