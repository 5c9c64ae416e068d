//! Gateway facade
//!
//! What shards need from the cluster: the bootstrap answer, session
//! persistence and identify queueing. Backend failures are absorbed here so a
//! broken key-value service degrades to process-local state instead of taking
//! shards down.

mod bootstrap;

pub use bootstrap::{Bootstrap, BootstrapInfo, DiscordBootstrap, SessionStartLimit, StaticBootstrap};

use crate::error::GatewayError;
use crate::identify::{BucketCoordinator, IdentifyLock, IdentifyPermit};
use crate::session::{MemorySessionStore, SessionField, SessionRecord, SessionStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Gateway {
    info: BootstrapInfo,
    sessions: Arc<dyn SessionStore>,
    fallback_sessions: MemorySessionStore,
    buckets: BucketCoordinator,
}

pub struct GatewayBuilder {
    bootstrap: Arc<dyn Bootstrap>,
    sessions: Arc<dyn SessionStore>,
    identify_lock: Option<Arc<dyn IdentifyLock>>,
    identify_cooldown: Option<Duration>,
}

impl GatewayBuilder {
    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn identify_lock(mut self, lock: Arc<dyn IdentifyLock>) -> Self {
        self.identify_lock = Some(lock);
        self
    }

    pub fn identify_cooldown(mut self, cooldown: Duration) -> Self {
        self.identify_cooldown = Some(cooldown);
        self
    }

    /// Run the bootstrap call and provision identify buckets.
    ///
    /// A failed bootstrap is reported as [`GatewayError::BadCredential`] and no
    /// gateway is built.
    pub async fn build(self) -> Result<Gateway, GatewayError> {
        let info = self.bootstrap.fetch().await.map_err(|e| match e {
            GatewayError::BadCredential(_) => e,
            other => GatewayError::BadCredential(Box::new(other)),
        })?;

        let max_concurrency = info.session_start_limit.max_concurrency;
        let mut buckets = match self.identify_lock {
            Some(lock) => BucketCoordinator::new(lock, max_concurrency).await,
            None => BucketCoordinator::local(max_concurrency).await,
        };
        if let Some(cooldown) = self.identify_cooldown {
            buckets = buckets.with_cooldown(cooldown);
        }

        info!(
            shards = info.shards,
            buckets = buckets.buckets(),
            identify_backend = buckets.backend(),
            session_backend = self.sessions.name(),
            "Gateway ready"
        );

        Ok(Gateway {
            info,
            sessions: self.sessions,
            fallback_sessions: MemorySessionStore::new(),
            buckets,
        })
    }
}

impl Gateway {
    /// In-memory sessions and in-process buckets until told otherwise.
    pub fn builder(bootstrap: Arc<dyn Bootstrap>) -> GatewayBuilder {
        GatewayBuilder {
            bootstrap,
            sessions: Arc::new(MemorySessionStore::new()),
            identify_lock: None,
            identify_cooldown: None,
        }
    }

    pub fn info(&self) -> &BootstrapInfo {
        &self.info
    }

    pub fn suggested_shards(&self) -> u32 {
        self.info.shards
    }

    pub fn max_concurrency(&self) -> u16 {
        self.buckets.buckets()
    }

    pub fn bucket_for(&self, shard_id: u32) -> u16 {
        self.buckets.bucket_for(shard_id)
    }

    /// Last known session; an unreadable store reads as the local copy.
    pub async fn session(&self, shard_id: u32) -> SessionRecord {
        match self.sessions.get(shard_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(shard_id, error = %e, "Session store read failed, using local copy");
                self.fallback_sessions.get(shard_id).await.unwrap_or_default()
            }
        }
    }

    pub async fn set_session_field(&self, shard_id: u32, field: SessionField) {
        // The local copy is always current so a later primary outage can
        // still resume.
        let _ = self.fallback_sessions.set_field(shard_id, field.clone()).await;
        if let Err(e) = self.sessions.set_field(shard_id, field).await {
            warn!(shard_id, error = %e, "Session store write failed");
        }
    }

    pub async fn invalidate_session(&self, shard_id: u32) {
        let _ = self.fallback_sessions.delete(shard_id).await;
        if let Err(e) = self.sessions.delete(shard_id).await {
            warn!(shard_id, error = %e, "Session store delete failed");
        }
    }

    /// Queue for the shard's identify bucket.
    pub async fn acquire_identify(&self, shard_id: u32) -> Result<IdentifyPermit, GatewayError> {
        self.buckets.acquire(shard_id).await
    }
}
