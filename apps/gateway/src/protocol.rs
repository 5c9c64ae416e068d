//! Gateway control protocol
//!
//! Opcodes, close codes and the payload envelope exchanged with the remote
//! gateway, plus builders for the frames a shard sends on its own behalf.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use twilight_model::gateway::Intents;

/// Close code used when we drop a socket but intend to resume the session.
///
/// The remote invalidates sessions closed with 1000 or 1001, any other code
/// keeps them resumable.
pub const RESUMABLE_CLOSE_CODE: u16 = 4420;

/// Normal closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Going away, used when a shard gives up or the cluster shuts down.
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;

/// Name sent as `browser` / `device` in identify properties.
const CLIENT_NAME: &str = "arrakis-shard-gateway";

/// Payload opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
    RequestSoundboardSounds,
}

impl OpCode {
    pub fn code(self) -> u8 {
        match self {
            Self::Dispatch => 0,
            Self::Heartbeat => 1,
            Self::Identify => 2,
            Self::PresenceUpdate => 3,
            Self::VoiceStateUpdate => 4,
            Self::Resume => 6,
            Self::Reconnect => 7,
            Self::RequestGuildMembers => 8,
            Self::InvalidSession => 9,
            Self::Hello => 10,
            Self::HeartbeatAck => 11,
            Self::RequestSoundboardSounds => 31,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            31 => Self::RequestSoundboardSounds,
            _ => return None,
        })
    }

    /// Static label for metrics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Heartbeat => "heartbeat",
            Self::Identify => "identify",
            Self::PresenceUpdate => "presence_update",
            Self::VoiceStateUpdate => "voice_state_update",
            Self::Resume => "resume",
            Self::Reconnect => "reconnect",
            Self::RequestGuildMembers => "request_guild_members",
            Self::InvalidSession => "invalid_session",
            Self::Hello => "hello",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::RequestSoundboardSounds => "request_soundboard_sounds",
        }
    }

    /// Frames the shard itself produces; they jump the outbound command queue.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Heartbeat | Self::Identify | Self::Resume)
    }
}

impl Serialize for OpCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown opcode {code}")))
    }
}

/// Gateway close codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    UnknownError,
    UnknownOpcode,
    DecodeError,
    NotAuthenticated,
    AuthenticationFailed,
    AlreadyAuthenticated,
    InvalidSequence,
    RateLimited,
    SessionTimedOut,
    InvalidShard,
    ShardingRequired,
    InvalidApiVersion,
    InvalidIntents,
    DisallowedIntents,
}

impl CloseCode {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSequence,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimedOut,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::InvalidApiVersion,
            4013 => Self::InvalidIntents,
            4014 => Self::DisallowedIntents,
            _ => return None,
        })
    }

    /// Human readable reason, used in close logs.
    pub fn reason(self) -> &'static str {
        match self {
            Self::UnknownError => "gateway encountered an unknown error",
            Self::UnknownOpcode => "gateway received an invalid opcode",
            Self::DecodeError => "gateway received an invalid payload",
            Self::NotAuthenticated => "payload sent before identifying",
            Self::AuthenticationFailed => "authentication failed",
            Self::AlreadyAuthenticated => "shard already authenticated",
            Self::InvalidSequence => "invalid sequence sent when resuming",
            Self::RateLimited => "send rate limit exceeded",
            Self::SessionTimedOut => "session timed out",
            Self::InvalidShard => "invalid shard sent when identifying",
            Self::ShardingRequired => "sharding is required",
            Self::InvalidApiVersion => "invalid gateway version",
            Self::InvalidIntents => "invalid intents",
            Self::DisallowedIntents => "disallowed intents",
        }
    }
}

/// What a shard does after the remote closed its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseAction {
    pub reconnect: bool,
    pub invalidate_session: bool,
}

/// Classify a close code. Unknown codes (including transport codes such as
/// 1006) reconnect and keep the session.
pub fn classify_close(code: Option<u16>) -> CloseAction {
    let Some(code) = code.and_then(CloseCode::from_code) else {
        return CloseAction {
            reconnect: true,
            invalidate_session: false,
        };
    };

    match code {
        CloseCode::AuthenticationFailed
        | CloseCode::InvalidShard
        | CloseCode::ShardingRequired
        | CloseCode::InvalidApiVersion
        | CloseCode::InvalidIntents
        | CloseCode::DisallowedIntents => CloseAction {
            reconnect: false,
            invalidate_session: true,
        },
        CloseCode::NotAuthenticated | CloseCode::InvalidSequence | CloseCode::SessionTimedOut => {
            CloseAction {
                reconnect: true,
                invalidate_session: true,
            }
        }
        CloseCode::UnknownError
        | CloseCode::UnknownOpcode
        | CloseCode::DecodeError
        | CloseCode::AlreadyAuthenticated
        | CloseCode::RateLimited => CloseAction {
            reconnect: true,
            invalidate_session: false,
        },
    }
}

/// Opcode-tagged payload, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: OpCode,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self { op, d, s: None, t: None }
    }

    /// Dispatch event name, if any.
    pub fn event_name(&self) -> Option<&str> {
        self.t.as_deref()
    }
}

/// Everything identify needs beyond the session.
#[derive(Debug, Clone)]
pub struct IdentifyInfo<'a> {
    pub token: &'a str,
    pub shard_id: u32,
    pub shard_total: u32,
    pub intents: Intents,
    pub large_threshold: Option<u8>,
}

pub fn identify(info: &IdentifyInfo<'_>) -> GatewayPayload {
    let mut d = json!({
        "token": info.token,
        "intents": info.intents.bits(),
        "shard": [info.shard_id, info.shard_total],
        "compress": false,
        "properties": {
            "os": std::env::consts::OS,
            "browser": CLIENT_NAME,
            "device": CLIENT_NAME,
        },
    });
    if let Some(threshold) = info.large_threshold {
        d["large_threshold"] = json!(threshold);
    }

    GatewayPayload::new(OpCode::Identify, d)
}

pub fn resume(token: &str, session_id: &str, sequence: u64) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::Resume,
        json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        }),
    )
}

pub fn heartbeat(sequence: Option<u64>) -> GatewayPayload {
    GatewayPayload::new(OpCode::Heartbeat, json!(sequence))
}

/// Shard owning a snowflake-keyed entity (guilds).
pub fn shard_for_entity(entity_id: u64, shard_total: u32) -> u32 {
    if shard_total == 0 {
        return 0;
    }
    ((entity_id >> 22) % u64::from(shard_total)) as u32
}
