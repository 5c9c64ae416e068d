//! Cluster manager
//!
//! Decides which shard ids this process owns, spawns one shard actor per id
//! and fans commands out to them.

use crate::error::GatewayError;
use crate::protocol::{shard_for_entity, GatewayPayload};
use crate::shard::{self, ShardContext, ShardHandle, ShardSettings, ShardState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use twilight_model::gateway::ShardId;

/// Default shard width of one clustered process
pub const SHARDS_PER_CLUSTER: u32 = 25;

/// Explicit shard selection in manual mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShardSelection {
    /// Every id in `[0, total)`.
    #[default]
    All,
    Ids(Vec<u32>),
    /// Inclusive range.
    Range { first: u32, last: u32 },
}

/// How this process picks its shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingMode {
    /// Own every shard the bootstrap endpoint suggests.
    Auto,
    Manual { total: u32, shards: ShardSelection },
    /// Own the contiguous slice `cluster_id * width ..` of `total` shards.
    /// `total` falls back to the suggested count.
    Clustered {
        total: Option<u32>,
        cluster_id: u32,
        width: u32,
    },
}

impl ShardingMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual { .. } => "manual",
            Self::Clustered { .. } => "clustered",
        }
    }

    /// Owned shard ids (sorted, unique) and the total shard count.
    pub fn shard_ids(&self, suggested: u32) -> Result<(Vec<u32>, u32), GatewayError> {
        match self {
            Self::Auto => {
                if suggested == 0 {
                    return Err(GatewayError::InvalidSharding(
                        "bootstrap suggested zero shards".to_string(),
                    ));
                }
                Ok(((0..suggested).collect(), suggested))
            }
            Self::Manual { total, shards } => {
                let total = *total;
                if total == 0 {
                    return Err(GatewayError::InvalidSharding("total shards must be > 0".to_string()));
                }
                let mut ids: Vec<u32> = match shards {
                    ShardSelection::All => (0..total).collect(),
                    ShardSelection::Ids(ids) => ids.clone(),
                    ShardSelection::Range { first, last } => {
                        if first > last {
                            return Err(GatewayError::InvalidSharding(format!(
                                "shard range {first}-{last} is reversed"
                            )));
                        }
                        (*first..=*last).collect()
                    }
                };
                if let Some(&bad) = ids.iter().find(|&&id| id >= total) {
                    return Err(GatewayError::InvalidSharding(format!(
                        "shard {bad} is out of range for {total} shards"
                    )));
                }
                ids.sort_unstable();
                ids.dedup();
                if ids.is_empty() {
                    return Err(GatewayError::InvalidSharding("no shards selected".to_string()));
                }
                Ok((ids, total))
            }
            Self::Clustered {
                total,
                cluster_id,
                width,
            } => {
                let total = total.unwrap_or(suggested);
                if total == 0 || *width == 0 {
                    return Err(GatewayError::InvalidSharding(
                        "clustered mode needs a non-zero total and width".to_string(),
                    ));
                }
                let first = u64::from(*cluster_id) * u64::from(*width);
                if first >= u64::from(total) {
                    return Err(GatewayError::InvalidSharding(format!(
                        "cluster {cluster_id} starts at shard {first}, past {total} shards"
                    )));
                }
                let last = (first + u64::from(*width) - 1).min(u64::from(total) - 1);
                let first = u32::try_from(first).map_err(|_| GatewayError::ShardIdOverflow { value: first })?;
                let last = u32::try_from(last).map_err(|_| GatewayError::ShardIdOverflow { value: last })?;
                Ok(((first..=last).collect(), total))
            }
        }
    }
}

/// Where a command should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Shard(u32),
    /// The shard owning this guild snowflake.
    Guild(u64),
    All,
}

/// The shards owned by this process
pub struct Cluster {
    total: u32,
    shards: BTreeMap<u32, ShardHandle>,
    state: ShardState,
}

impl Cluster {
    /// Spawn and connect every owned shard.
    ///
    /// Fails before anything is spawned when the layout is invalid.
    pub fn spawn(
        ctx: ShardContext,
        settings: ShardSettings,
        mode: &ShardingMode,
    ) -> Result<Self, GatewayError> {
        let suggested = ctx.gateway.suggested_shards();
        let (ids, total) = mode.shard_ids(suggested)?;

        info!(
            mode = mode.name(),
            total,
            first = ids.first().copied(),
            last = ids.last().copied(),
            shard_count = ids.len(),
            buckets = ctx.gateway.max_concurrency(),
            "Spawning shard cluster"
        );

        let settings = Arc::new(settings);
        let state = ctx.state.clone();
        let shards = ids
            .into_iter()
            .map(|id| {
                let handle = shard::spawn(ShardId::new(id, total), Arc::clone(&settings), ctx.clone());
                handle.connect();
                (id, handle)
            })
            .collect();

        Ok(Self { total, shards, state })
    }

    pub fn total_shards(&self) -> u32 {
        self.total
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.shards.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    pub fn shard(&self, shard_id: u32) -> Result<&ShardHandle, GatewayError> {
        self.shards
            .get(&shard_id)
            .ok_or(GatewayError::UnknownShard { shard_id })
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardHandle> {
        self.shards.values()
    }

    /// Queue `payload` on the target shard(s). False when no owned shard took
    /// it.
    pub fn route(&self, target: Target, payload: GatewayPayload) -> bool {
        let shard_id = match target {
            Target::All => return self.broadcast(payload),
            Target::Shard(shard_id) => shard_id,
            Target::Guild(guild_id) => shard_for_entity(guild_id, self.total),
        };

        match self.shard(shard_id) {
            Ok(handle) => handle.send(payload),
            Err(e) => {
                debug!(shard_id, error = %e, "Command for a shard owned elsewhere");
                false
            }
        }
    }

    /// Queue `payload` on every owned shard, in shard order.
    pub fn broadcast(&self, payload: GatewayPayload) -> bool {
        let mut delivered = false;
        for handle in self.shards.values() {
            delivered |= handle.send(payload.clone());
        }
        delivered
    }

    /// Mean heartbeat latency over shards that have measured one.
    pub fn latency(&self) -> Option<Duration> {
        let samples: Vec<Duration> = self.shards.values().filter_map(ShardHandle::latency).collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    /// Tear every shard down without reconnecting.
    pub async fn destroy(&self) {
        info!(shard_count = self.shards.len(), "Destroying shard cluster");
        for handle in self.shards.values() {
            handle.destroy().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_owns_every_suggested_shard() {
        let (ids, total) = ShardingMode::Auto.shard_ids(3).unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(total, 3);
        assert!(ShardingMode::Auto.shard_ids(0).is_err());
    }

    #[test]
    fn manual_selection_is_validated_and_deduplicated() {
        let mode = ShardingMode::Manual {
            total: 8,
            shards: ShardSelection::Ids(vec![5, 1, 5, 3]),
        };
        assert_eq!(mode.shard_ids(1).unwrap(), (vec![1, 3, 5], 8));

        let range = ShardingMode::Manual {
            total: 8,
            shards: ShardSelection::Range { first: 2, last: 4 },
        };
        assert_eq!(range.shard_ids(1).unwrap().0, vec![2, 3, 4]);

        let all = ShardingMode::Manual {
            total: 2,
            shards: ShardSelection::All,
        };
        assert_eq!(all.shard_ids(16).unwrap(), (vec![0, 1], 2));

        let out_of_range = ShardingMode::Manual {
            total: 4,
            shards: ShardSelection::Ids(vec![4]),
        };
        assert!(matches!(
            out_of_range.shard_ids(1),
            Err(GatewayError::InvalidSharding(_))
        ));

        let reversed = ShardingMode::Manual {
            total: 8,
            shards: ShardSelection::Range { first: 4, last: 2 },
        };
        assert!(reversed.shard_ids(1).is_err());
    }

    #[test]
    fn clustered_slices_are_contiguous_and_clamped() {
        let mode = |cluster_id| ShardingMode::Clustered {
            total: Some(60),
            cluster_id,
            width: SHARDS_PER_CLUSTER,
        };
        assert_eq!(mode(0).shard_ids(1).unwrap().0, (0..25).collect::<Vec<_>>());
        assert_eq!(mode(1).shard_ids(1).unwrap().0, (25..50).collect::<Vec<_>>());
        assert_eq!(mode(2).shard_ids(1).unwrap().0, (50..60).collect::<Vec<_>>());
        assert!(mode(3).shard_ids(1).is_err());
    }

    #[test]
    fn clustered_total_defaults_to_suggested() {
        let mode = ShardingMode::Clustered {
            total: None,
            cluster_id: 1,
            width: 4,
        };
        assert_eq!(mode.shard_ids(6).unwrap(), (vec![4, 5], 6));
    }
}
