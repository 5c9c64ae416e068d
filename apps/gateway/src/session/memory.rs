//! In-process session store
//!
//! Not durable: everything is lost on restart, and other processes cannot see
//! it. Used when no key-value backend is configured and as the fallback when
//! one fails.

use super::{SessionField, SessionRecord, SessionStore};
use crate::error::GatewayError;
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<u32, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, shard_id: u32) -> Result<SessionRecord, GatewayError> {
        Ok(self
            .sessions
            .get(&shard_id)
            .map(|record| record.clone())
            .unwrap_or_default())
    }

    async fn set_field(&self, shard_id: u32, field: SessionField) -> Result<(), GatewayError> {
        let mut record = self.sessions.entry(shard_id).or_default();
        match field {
            SessionField::SessionId(id) => record.session_id = Some(id),
            SessionField::Sequence(sequence) => record.sequence = Some(sequence),
        }
        Ok(())
    }

    async fn delete(&self, shard_id: u32) -> Result<(), GatewayError> {
        self.sessions.remove(&shard_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_shard_has_an_empty_session() {
        let store = MemorySessionStore::new();
        assert_eq!(store.get(4).await.unwrap(), SessionRecord::default());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn fields_are_written_independently() {
        let store = MemorySessionStore::new();
        store
            .set_field(1, SessionField::Sequence(42))
            .await
            .unwrap();
        assert_eq!(
            store.get(1).await.unwrap(),
            SessionRecord {
                session_id: None,
                sequence: Some(42)
            }
        );

        store
            .set_field(1, SessionField::SessionId("abc".to_string()))
            .await
            .unwrap();
        store
            .set_field(1, SessionField::Sequence(43))
            .await
            .unwrap();

        let record = store.get(1).await.unwrap();
        assert_eq!(record.session_id.as_deref(), Some("abc"));
        assert_eq!(record.sequence, Some(43));
        assert_eq!(store.get(2).await.unwrap(), SessionRecord::default());
    }

    #[tokio::test]
    async fn delete_clears_only_that_shard() {
        let store = MemorySessionStore::new();
        store
            .set_field(0, SessionField::SessionId("a".to_string()))
            .await
            .unwrap();
        store
            .set_field(1, SessionField::SessionId("b".to_string()))
            .await
            .unwrap();

        store.delete(0).await.unwrap();
        assert_eq!(store.get(0).await.unwrap(), SessionRecord::default());
        assert_eq!(store.get(1).await.unwrap().session_id.as_deref(), Some("b"));
        assert_eq!(store.len(), 1);
    }
}
