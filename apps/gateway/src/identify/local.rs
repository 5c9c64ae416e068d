//! In-process identify buckets
//!
//! One single-permit semaphore per bucket. Tokio semaphores admit waiters in
//! FIFO order, so no shard starves. Only correct while a single process owns
//! the token.

use super::{IdentifyLock, LockHandle};
use crate::error::GatewayError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
pub struct LocalLock {
    buckets: DashMap<u16, Arc<Semaphore>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, bucket: u16) -> Arc<Semaphore> {
        self.buckets
            .entry(bucket)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

#[async_trait]
impl IdentifyLock for LocalLock {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_buckets(&self, count: u16) -> Result<(), GatewayError> {
        for bucket in 0..count {
            self.gate(bucket);
        }
        Ok(())
    }

    async fn acquire(&self, bucket: u16) -> Result<LockHandle, GatewayError> {
        let permit = self
            .gate(bucket)
            .acquire_owned()
            .await
            .map_err(|e| GatewayError::IdentifyLock {
                bucket,
                source: Box::new(e),
            })?;
        Ok(LockHandle::local(bucket, permit))
    }

    async fn release(&self, handle: LockHandle) -> Result<(), GatewayError> {
        drop(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn bucket_is_exclusive_until_released() {
        let lock = LocalLock::new();
        lock.create_buckets(2).await.unwrap();

        let held = lock.acquire(0).await.unwrap();
        let mut waiter = task::spawn(lock.acquire(0));
        assert_pending!(waiter.poll());

        // Another bucket is unaffected.
        let other = lock.acquire(1).await.unwrap();
        assert_eq!(other.bucket, 1);

        lock.release(held).await.unwrap();
        assert!(waiter.is_woken());
        let again = assert_ready!(waiter.poll()).unwrap();
        assert_eq!(again.bucket, 0);
    }

    #[tokio::test]
    async fn unprovisioned_buckets_are_created_on_demand() {
        let lock = LocalLock::new();
        let handle = lock.acquire(9).await.unwrap();
        assert_eq!(handle.bucket, 9);
        assert!(handle.remote_lease().is_none());
    }
}
