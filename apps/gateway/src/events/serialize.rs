//! Event serialization for the message broker
//!
//! Wraps a raw dispatch payload in the envelope consumers read from NATS.

use crate::protocol::{GatewayPayload, OpCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope published for every forwarded dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub event_id: String,
    /// Dispatch name as sent by the remote (`GUILD_CREATE`, ...)
    pub event_type: String,
    pub shard_id: u32,
    pub sequence: Option<u64>,
    /// Milliseconds since the Unix epoch at receipt
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub data: Value,
}

impl DispatchEvent {
    /// Build the envelope for a dispatch payload.
    ///
    /// Returns None for anything that is not a named dispatch.
    pub fn from_payload(shard_id: u32, payload: &GatewayPayload) -> Option<Self> {
        if payload.op != OpCode::Dispatch {
            return None;
        }
        let event_type = payload.event_name()?.to_string();

        Some(Self {
            event_id: Uuid::new_v4().to_string(),
            guild_id: guild_id(&event_type, &payload.d),
            event_type,
            shard_id,
            sequence: payload.s,
            timestamp: now_millis(),
            data: payload.d.clone(),
        })
    }

    /// NATS subject for this event: `events.<name in lower case>`.
    pub fn subject(&self) -> String {
        format!("events.{}", self.event_type.to_ascii_lowercase())
    }
}

/// Guild events carry the guild as `id`, everything else as `guild_id`.
fn guild_id(event_type: &str, data: &Value) -> Option<String> {
    let field = match event_type {
        "GUILD_CREATE" | "GUILD_UPDATE" | "GUILD_DELETE" => "id",
        _ => "guild_id",
    };
    match data.get(field)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
