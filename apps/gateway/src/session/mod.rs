//! Session persistence
//!
//! Resumable sessions are cached per shard id so a reconnect (or another
//! process taking over the shard) can resume instead of identifying again.

mod memory;
mod nats;

pub use memory::MemorySessionStore;
pub use nats::NatsSessionStore;

use crate::error::GatewayError;
use async_trait::async_trait;

/// Last known session of one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
}

impl SessionRecord {
    /// A resume needs both halves.
    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }
}

/// A single field write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionField {
    SessionId(String),
    Sequence(u64),
}

impl SessionField {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionId(_) => "session_id",
            Self::Sequence(_) => "sequence",
        }
    }
}

/// Field-level session storage keyed by shard id.
///
/// Implementations must be safe under concurrent use from every shard task.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, shard_id: u32) -> Result<SessionRecord, GatewayError>;

    async fn set_field(&self, shard_id: u32, field: SessionField) -> Result<(), GatewayError>;

    async fn delete(&self, shard_id: u32) -> Result<(), GatewayError>;
}
