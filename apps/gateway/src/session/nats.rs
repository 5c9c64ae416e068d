//! Session store on a NATS JetStream key-value bucket
//!
//! Each field lives under its own key (`shards.{id}.session_id`,
//! `shards.{id}.sequence`) so field writes stay atomic without a
//! read-modify-write cycle.

use super::{SessionField, SessionRecord, SessionStore};
use crate::error::GatewayError;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

const SESSION_ID: &str = "session_id";
const SEQUENCE: &str = "sequence";

pub struct NatsSessionStore {
    kv: kv::Store,
}

impl NatsSessionStore {
    /// Open the bucket, creating it on first use.
    pub async fn open(js: &jetstream::Context, bucket: &str) -> Result<Self, GatewayError> {
        let kv = match js.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    description: "Resumable gateway sessions per shard".to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?,
        };

        info!(bucket, "Session store bucket ready");
        Ok(Self { kv })
    }

    fn store_error(
        op: &'static str,
        shard_id: u32,
    ) -> impl FnOnce(Box<dyn std::error::Error + Send + Sync>) -> GatewayError {
        move |source| GatewayError::SessionStore {
            op,
            shard_id,
            source,
        }
    }

    async fn read(&self, shard_id: u32, field: &str) -> Result<Option<Bytes>, GatewayError> {
        self.kv
            .get(session_key(shard_id, field))
            .await
            .map_err(|e| Self::store_error("get", shard_id)(Box::new(e)))
    }
}

pub(crate) fn session_key(shard_id: u32, field: &str) -> String {
    format!("shards.{shard_id}.{field}")
}

#[async_trait]
impl SessionStore for NatsSessionStore {
    fn name(&self) -> &'static str {
        "nats-kv"
    }

    async fn get(&self, shard_id: u32) -> Result<SessionRecord, GatewayError> {
        let session_id = self
            .read(shard_id, SESSION_ID)
            .await?
            .filter(|value| !value.is_empty())
            .map(|value| String::from_utf8_lossy(&value).into_owned());

        let sequence = match self.read(shard_id, SEQUENCE).await? {
            Some(value) if !value.is_empty() => {
                let text = String::from_utf8_lossy(&value);
                let sequence = text
                    .parse::<u64>()
                    .map_err(|e| Self::store_error("get", shard_id)(Box::new(e)))?;
                Some(sequence)
            }
            _ => None,
        };

        Ok(SessionRecord {
            session_id,
            sequence,
        })
    }

    async fn set_field(&self, shard_id: u32, field: SessionField) -> Result<(), GatewayError> {
        let (key, value) = match field {
            SessionField::SessionId(id) => (session_key(shard_id, SESSION_ID), Bytes::from(id)),
            SessionField::Sequence(sequence) => (
                session_key(shard_id, SEQUENCE),
                Bytes::from(sequence.to_string()),
            ),
        };

        self.kv
            .put(key, value)
            .await
            .map(|_revision| ())
            .map_err(|e| Self::store_error("set", shard_id)(Box::new(e)))
    }

    async fn delete(&self, shard_id: u32) -> Result<(), GatewayError> {
        for field in [SESSION_ID, SEQUENCE] {
            self.kv
                .purge(session_key(shard_id, field))
                .await
                .map_err(|e| Self::store_error("delete", shard_id)(Box::new(e)))?;
        }
        Ok(())
    }
}
