//! Identify bucket coordination
//!
//! The remote allows `max_concurrency` identify handshakes at a time, one per
//! bucket (`shard_id % max_concurrency`), and each bucket must then cool down
//! for roughly five seconds. [`BucketCoordinator`] hands out one
//! [`IdentifyPermit`] per bucket at a time: an in-process gate, backed when
//! configured by an [`IdentifyLock`] lease shared by every process running
//! with the same token.

mod local;
mod nats;

pub use local::LocalLock;
pub use nats::NatsLock;

use crate::error::GatewayError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

/// Minimum spacing between two identifies on one bucket.
pub const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Cool-down actually applied: the interval plus a 9% safety margin.
pub const IDENTIFY_COOLDOWN: Duration = Duration::from_millis(5_450);

/// Proof that a bucket is held.
#[derive(Debug)]
pub struct LockHandle {
    pub bucket: u16,
    lease: Lease,
}

#[derive(Debug)]
enum Lease {
    Local(#[allow(dead_code)] OwnedSemaphorePermit),
    Remote { key: String, revision: u64 },
}

impl LockHandle {
    pub(crate) fn local(bucket: u16, permit: OwnedSemaphorePermit) -> Self {
        Self {
            bucket,
            lease: Lease::Local(permit),
        }
    }

    pub(crate) fn remote(bucket: u16, key: String, revision: u64) -> Self {
        Self {
            bucket,
            lease: Lease::Remote { key, revision },
        }
    }

    /// Key and revision of a remote lease.
    pub(crate) fn remote_lease(&self) -> Option<(&str, u64)> {
        match &self.lease {
            Lease::Remote { key, revision } => Some((key, *revision)),
            Lease::Local(_) => None,
        }
    }
}

/// Mutual exclusion over identify buckets.
#[async_trait]
pub trait IdentifyLock: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Provision buckets `0..count`.
    async fn create_buckets(&self, count: u16) -> Result<(), GatewayError>;

    /// Wait until `bucket` is free and take it.
    async fn acquire(&self, bucket: u16) -> Result<LockHandle, GatewayError>;

    /// Free a bucket immediately. Cool-down is applied by the caller.
    async fn release(&self, handle: LockHandle) -> Result<(), GatewayError>;
}

/// A held identify bucket.
///
/// Releasing, explicitly or by dropping, keeps the bucket closed for
/// [`IDENTIFY_COOLDOWN`] before the next holder gets in.
pub struct IdentifyPermit {
    bucket: u16,
    cooldown: Duration,
    held: Option<Held>,
}

/// The in-process gate, plus the shared lease when the backend granted one.
struct Held {
    gate: LockHandle,
    lease: Option<(LockHandle, Arc<dyn IdentifyLock>)>,
}

impl IdentifyPermit {
    pub fn bucket(&self) -> u16 {
        self.bucket
    }

    /// Whether a cross-process lease backs this permit.
    pub fn is_shared(&self) -> bool {
        self.held.as_ref().is_some_and(|held| held.lease.is_some())
    }

    /// Start the cool-down. The bucket frees itself once it elapses.
    pub fn release(mut self) {
        self.schedule_release();
    }

    fn schedule_release(&mut self) {
        let Some(Held { gate, lease }) = self.held.take() else {
            return;
        };
        let cooldown = self.cooldown;
        let bucket = self.bucket;

        // Without a runtime the handles are dropped in place, which frees the
        // gate immediately and lets a remote lease expire.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                tokio::time::sleep(cooldown).await;
                if let Some((handle, lock)) = lease {
                    if let Err(e) = lock.release(handle).await {
                        warn!(bucket, error = %e, "Identify bucket release failed, lease will expire");
                    }
                }
                // The gate goes last so no local waiter races the lease.
                drop(gate);
                debug!(bucket, "Identify bucket released");
            });
        }
    }
}

impl Drop for IdentifyPermit {
    fn drop(&mut self) {
        self.schedule_release();
    }
}

impl std::fmt::Debug for IdentifyPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifyPermit")
            .field("bucket", &self.bucket)
            .field("held", &self.held.is_some())
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Bucket assignment over an in-process gate and an optional shared backend.
///
/// Every acquire passes the gate first, so a shard of this process never
/// shares a bucket with another one even while the backend is failing.
pub struct BucketCoordinator {
    gate: LocalLock,
    shared: Option<Arc<dyn IdentifyLock>>,
    buckets: u16,
    cooldown: Duration,
}

impl BucketCoordinator {
    /// Provision `buckets` buckets on `shared`. A backend that cannot be
    /// provisioned is left out and only the gate is used.
    pub async fn new(shared: Arc<dyn IdentifyLock>, buckets: u16) -> Self {
        let mut coordinator = Self::local(buckets).await;
        match shared.create_buckets(coordinator.buckets).await {
            Ok(()) => coordinator.shared = Some(shared),
            Err(e) => warn!(
                backend = shared.name(),
                error = %e,
                "Identify lock backend unavailable, using in-process buckets"
            ),
        }
        debug!(backend = coordinator.backend(), buckets = coordinator.buckets, "Identify buckets created");
        coordinator
    }

    /// In-process buckets only.
    pub async fn local(buckets: u16) -> Self {
        let buckets = buckets.max(1);
        let gate = LocalLock::new();
        // Local provisioning cannot fail.
        let _ = gate.create_buckets(buckets).await;
        Self {
            gate,
            shared: None,
            buckets,
            cooldown: IDENTIFY_COOLDOWN,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn buckets(&self) -> u16 {
        self.buckets
    }

    pub fn backend(&self) -> &'static str {
        match &self.shared {
            Some(shared) => shared.name(),
            None => self.gate.name(),
        }
    }

    pub fn bucket_for(&self, shard_id: u32) -> u16 {
        (shard_id % u32::from(self.buckets)) as u16
    }

    /// Wait for the shard's bucket: the in-process gate, then the shared
    /// lease. A failing backend leaves the permit backed by the gate alone.
    pub async fn acquire(&self, shard_id: u32) -> Result<IdentifyPermit, GatewayError> {
        let bucket = self.bucket_for(shard_id);
        let gate = self.gate.acquire(bucket).await?;

        let lease = match &self.shared {
            Some(shared) => match shared.acquire(bucket).await {
                Ok(handle) => Some((handle, shared.clone())),
                Err(e) => {
                    warn!(
                        shard_id,
                        bucket,
                        backend = shared.name(),
                        error = %e,
                        "Identify lock failed, holding the in-process bucket only"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(IdentifyPermit {
            bucket,
            cooldown: self.cooldown,
            held: Some(Held { gate, lease }),
        })
    }
}
