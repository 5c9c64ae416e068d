//! Gateway configuration module
//!
//! Settings come from an optional `gateway.toml` (path in `GATEWAY_CONFIG`)
//! overlaid by environment variables, after `.env` has been loaded. Keys are
//! the lower-cased variable names, so `TOTAL_SHARDS` and `total_shards = 4`
//! in the file mean the same thing.

use crate::cluster::{ShardSelection, ShardingMode, SHARDS_PER_CLUSTER};
use crate::codec::{Compression, Encoding};
use crate::error::GatewayError;
use crate::events::EventFilter;
use crate::shard::{ShardSettings, API_VERSION};
use config::{Config, Environment, File, FileFormat};
use std::str::FromStr;
use std::time::Duration;
use twilight_model::gateway::Intents;

/// Every intent that does not need approval (all but `GUILD_MEMBERS` and
/// `GUILD_PRESENCES` up to `DIRECT_MESSAGE_TYPING`).
pub const DEFAULT_INTENTS: u64 = 32509;

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    pub sharding: ShardingMode,

    /// Overrides the URL returned by the bootstrap call
    pub gateway_url: Option<String>,
    pub gateway_version: u8,
    pub encoding: Encoding,
    pub compression: Option<Compression>,
    pub intents: Intents,

    /// `None` retries forever
    pub max_reconnects: Option<u32>,
    pub ready_timeout: Duration,
    pub send_queue_capacity: usize,

    /// Dispatch names forwarded to the event bus
    pub events: EventFilter,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,
    pub session_bucket: String,
    pub identify_bucket: String,
    pub commands_subject: String,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// HTTP proxy base for REST calls
    pub api_proxy: Option<String>,
}

impl GatewayConfig {
    /// Load `.env`, the optional TOML file and the environment.
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "gateway.toml".to_string());
        let source = Config::builder()
            .add_source(File::new(&path, FileFormat::Toml).required(false))
            .add_source(Environment::default())
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to read configuration: {e}")))?;

        Self::from_source(&source)
    }

    /// Build from an already-layered source.
    pub fn from_source(source: &Config) -> Result<Self, GatewayError> {
        let discord_token = string(source, "discord_token")
            .or_else(|| string(source, "discord_bot_token"))
            .ok_or_else(|| GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string()))?;

        let max_reconnects = match parsed::<i64>(source, "max_reconnects")?.unwrap_or(10) {
            -1 => None,
            n => Some(u32::try_from(n).map_err(|_| {
                GatewayError::Config(format!("MAX_RECONNECTS must be -1 or a non-negative number, got {n}"))
            })?),
        };

        Ok(Self {
            discord_token,
            sharding: sharding_mode(source)?,
            gateway_url: string(source, "gateway_url"),
            gateway_version: parsed(source, "gateway_version")?.unwrap_or(API_VERSION),
            encoding: parsed(source, "gateway_encoding")?.unwrap_or_default(),
            compression: match string(source, "gateway_compression") {
                Some(value) => Compression::parse_optional(&value)?,
                None => None,
            },
            intents: match string(source, "intents") {
                Some(value) => parse_intents(&value)?,
                None => Intents::from_bits_truncate(DEFAULT_INTENTS),
            },
            max_reconnects,
            ready_timeout: Duration::from_millis(parsed(source, "ready_timeout_ms")?.unwrap_or(15_000)),
            send_queue_capacity: parsed(source, "send_queue_capacity")?.unwrap_or(4096),
            events: parsed(source, "events")?.unwrap_or_default(),
            nats_url: string(source, "nats_url"),
            session_bucket: string(source, "session_bucket").unwrap_or_else(|| "gateway_sessions".to_string()),
            identify_bucket: string(source, "identify_bucket").unwrap_or_else(|| "gateway_identify".to_string()),
            commands_subject: string(source, "commands_subject")
                .unwrap_or_else(|| "gateway.commands.>".to_string()),
            http_port: parsed(source, "http_port")?
                .or(parsed(source, "metrics_port")?)
                .unwrap_or(9090),
            log_level: string(source, "log_level").unwrap_or_else(|| "info".to_string()),
            api_proxy: string(source, "api_proxy"),
        })
    }

    /// Per-shard settings against `bootstrap_url`, unless a URL is configured.
    pub fn shard_settings(&self, bootstrap_url: &str) -> ShardSettings {
        let url = self
            .gateway_url
            .clone()
            .or_else(|| (!bootstrap_url.is_empty()).then(|| bootstrap_url.to_string()))
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());

        let mut settings = ShardSettings::new(self.discord_token.clone(), url);
        settings.version = self.gateway_version;
        settings.encoding = self.encoding;
        settings.compression = self.compression;
        settings.intents = self.intents;
        settings.max_reconnects = self.max_reconnects;
        settings.ready_timeout = self.ready_timeout;
        settings.send_queue_capacity = self.send_queue_capacity;
        settings
    }
}

/// Non-empty string value.
fn string(source: &Config, key: &str) -> Option<String> {
    source
        .get_string(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed<T>(source: &Config, key: &str) -> Result<Option<T>, GatewayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    string(source, key)
        .map(|value| {
            value.parse().map_err(|e| {
                GatewayError::Config(format!("{} is invalid ('{value}'): {e}", key.to_ascii_uppercase()))
            })
        })
        .transpose()
}

fn sharding_mode(source: &Config) -> Result<ShardingMode, GatewayError> {
    let mode = string(source, "sharding_mode").unwrap_or_else(|| "auto".to_string());
    match mode.to_ascii_lowercase().as_str() {
        "auto" => Ok(ShardingMode::Auto),
        "manual" => {
            let total = parsed(source, "total_shards")?
                .ok_or_else(|| GatewayError::Config("manual sharding requires TOTAL_SHARDS".to_string()))?;
            let shards = if let Some(ids) = string(source, "shard_ids") {
                ShardSelection::Ids(parse_shard_ids(&ids)?)
            } else if let Some(range) = string(source, "shard_range") {
                parse_shard_range(&range)?
            } else {
                ShardSelection::All
            };
            Ok(ShardingMode::Manual { total, shards })
        }
        "clustered" => Ok(ShardingMode::Clustered {
            total: parsed(source, "total_shards")?,
            cluster_id: parsed(source, "cluster_id")?
                .or(parsed(source, "pool_id")?)
                .unwrap_or(0),
            width: parsed(source, "shards_per_cluster")?.unwrap_or(SHARDS_PER_CLUSTER),
        }),
        other => Err(GatewayError::Config(format!(
            "SHARDING_MODE must be auto, manual or clustered, got '{other}'"
        ))),
    }
}

fn parse_shard_ids(value: &str) -> Result<Vec<u32>, GatewayError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            id.parse()
                .map_err(|e| GatewayError::Config(format!("SHARD_IDS entry '{id}' is invalid: {e}")))
        })
        .collect()
}

fn parse_shard_range(value: &str) -> Result<ShardSelection, GatewayError> {
    let invalid = || GatewayError::Config(format!("SHARD_RANGE must look like 'first-last', got '{value}'"));
    let (first, last) = value.split_once('-').ok_or_else(invalid)?;
    Ok(ShardSelection::Range {
        first: first.trim().parse().map_err(|_| invalid())?,
        last: last.trim().parse().map_err(|_| invalid())?,
    })
}

/// A raw bitmask, `all`, `-1` for the non-privileged default, or a comma list
/// of intent names (`GUILDS,GUILD_MESSAGES`).
pub fn parse_intents(value: &str) -> Result<Intents, GatewayError> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("all") {
        return Ok(Intents::all());
    }
    if value == "-1" {
        return Ok(Intents::from_bits_truncate(DEFAULT_INTENTS));
    }
    if let Ok(bits) = value.parse::<u64>() {
        return Ok(Intents::from_bits_truncate(bits));
    }

    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .try_fold(Intents::empty(), |acc, name| {
            Intents::from_name(&name.to_ascii_uppercase())
                .map(|intent| acc | intent)
                .ok_or_else(|| GatewayError::Config(format!("unknown intent '{name}'")))
        })
}
