//! Distributed identify buckets on NATS JetStream key-value
//!
//! A bucket is held by creating its key (`bucket.{n}`); creation fails while
//! another process holds it. The key-value bucket ages entries out after the
//! lease TTL, so a crashed holder cannot block a bucket forever.

use super::{IdentifyLock, LockHandle};
use crate::error::GatewayError;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// How long a lease survives without an explicit release.
pub const LEASE_TTL: Duration = Duration::from_secs(10);

/// Pause between attempts on a held bucket.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Random spread added to each retry, both directions.
pub const RETRY_JITTER: Duration = Duration::from_millis(200);

pub struct NatsLock {
    kv: kv::Store,
    owner: String,
}

impl NatsLock {
    /// Open the lease bucket, creating it on first use.
    pub async fn open(js: &jetstream::Context, bucket: &str) -> Result<Self, GatewayError> {
        let kv = match js.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    description: "Identify bucket leases".to_string(),
                    history: 1,
                    max_age: LEASE_TTL,
                    ..Default::default()
                })
                .await
                .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?,
        };

        let owner = Uuid::new_v4().to_string();
        info!(bucket, owner = %owner, "Identify lease bucket ready");
        Ok(Self { kv, owner })
    }
}

pub(crate) fn lease_key(bucket: u16) -> String {
    format!("bucket.{bucket}")
}

/// Retry delay with jitter applied.
pub(crate) fn retry_delay() -> Duration {
    let jitter = RETRY_JITTER.as_millis() as i64;
    let offset = rand::rng().random_range(-jitter..=jitter);
    let millis = RETRY_DELAY.as_millis() as i64 + offset;
    Duration::from_millis(millis.max(0) as u64)
}

#[async_trait]
impl IdentifyLock for NatsLock {
    fn name(&self) -> &'static str {
        "nats-kv"
    }

    async fn create_buckets(&self, count: u16) -> Result<(), GatewayError> {
        // Keys are created lazily on acquire; probing the bucket proves the
        // backend is reachable before any shard relies on it.
        self.kv
            .status()
            .await
            .map_err(|e| GatewayError::IdentifyLock {
                bucket: 0,
                source: Box::new(e),
            })?;
        debug!(count, "Identify leases available");
        Ok(())
    }

    async fn acquire(&self, bucket: u16) -> Result<LockHandle, GatewayError> {
        let key = lease_key(bucket);
        loop {
            match self
                .kv
                .create(&key, Bytes::from(self.owner.clone()))
                .await
            {
                Ok(revision) => {
                    trace!(bucket, revision, "Identify lease taken");
                    return Ok(LockHandle::remote(bucket, key, revision));
                }
                Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                    let delay = retry_delay();
                    trace!(bucket, delay_ms = delay.as_millis() as u64, "Identify lease held elsewhere");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(GatewayError::IdentifyLock {
                        bucket,
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), GatewayError> {
        let Some((key, revision)) = handle.remote_lease() else {
            return Ok(());
        };

        // Only delete our own revision; an expired lease may already belong to
        // someone else.
        self.kv
            .delete_expect_revision(key, Some(revision))
            .await
            .map_err(|e| GatewayError::IdentifyLock {
                bucket: handle.bucket,
                source: Box::new(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_keys_name_the_bucket() {
        assert_eq!(lease_key(0), "bucket.0");
        assert_eq!(lease_key(15), "bucket.15");
    }

    #[test]
    fn retry_delay_stays_within_jitter() {
        for _ in 0..100 {
            let delay = retry_delay();
            assert!(delay >= RETRY_DELAY - RETRY_JITTER);
            assert!(delay <= RETRY_DELAY + RETRY_JITTER);
        }
    }
}
