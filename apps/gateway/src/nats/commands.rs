//! Command bus consumer
//!
//! Pulls commands from the COMMANDS stream and routes them to the owning
//! shard. A command is acknowledged once a shard queued it and terminated
//! (no redelivery) when nothing here could take it.

use super::publisher::streams;
use crate::cluster::{Cluster, Target};
use crate::metrics::GatewayMetrics;
use crate::protocol::GatewayPayload;
use anyhow::{Context, Result};
use async_nats::jetstream::consumer::{pull, AckPolicy, PullConsumer};
use async_nats::jetstream::{AckKind, Context as JsContext};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Durable consumer name shared by every process of the cluster
pub const CONSUMER_NAME: &str = "gateway-commands";

/// Snowflakes arrive both as strings and as numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Snowflake {
    Number(u64),
    #[serde(deserialize_with = "snowflake_from_str")]
    Text(u64),
}

fn snowflake_from_str<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl Snowflake {
    fn get(self) -> u64 {
        match self {
            Self::Number(id) | Self::Text(id) => id,
        }
    }
}

/// A command message as published on the bus
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BusCommand {
    #[serde(default)]
    pub shard_id: Option<u32>,
    #[serde(default)]
    guild_id: Option<Snowflake>,
    pub payload: GatewayPayload,
}

impl BusCommand {
    pub fn guild_id(&self) -> Option<u64> {
        self.guild_id.map(Snowflake::get)
    }

    /// An explicit shard wins over a guild; neither means every shard.
    pub fn target(&self) -> Target {
        match (self.shard_id, self.guild_id()) {
            (Some(shard_id), _) => Target::Shard(shard_id),
            (None, Some(guild_id)) => Target::Guild(guild_id),
            (None, None) => Target::All,
        }
    }
}

/// What happened to one bus message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Delivered,
    Undeliverable,
    Malformed,
}

impl CommandOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Undeliverable => "undeliverable",
            Self::Malformed => "malformed",
        }
    }
}

/// Decode one message and hand it to `route`.
pub fn dispatch(bytes: &[u8], route: impl FnOnce(Target, GatewayPayload) -> bool) -> CommandOutcome {
    let command: BusCommand = match serde_json::from_slice(bytes) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "Malformed bus command");
            return CommandOutcome::Malformed;
        }
    };

    let target = command.target();
    if route(target, command.payload) {
        CommandOutcome::Delivered
    } else {
        debug!(?target, "No owned shard accepted the command");
        CommandOutcome::Undeliverable
    }
}

/// Create (or reuse) the durable pull consumer over `subject`.
pub async fn consumer(js: &JsContext, subject: &str) -> Result<PullConsumer> {
    let stream = js
        .get_stream(streams::COMMANDS)
        .await
        .context("COMMANDS stream is missing")?;

    stream
        .get_or_create_consumer(
            CONSUMER_NAME,
            pull::Config {
                durable_name: Some(CONSUMER_NAME.to_string()),
                filter_subject: subject.to_string(),
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            },
        )
        .await
        .context("Failed to create command consumer")
}

/// Route commands until the message stream ends.
pub async fn run(consumer: PullConsumer, cluster: Arc<Cluster>, metrics: Arc<GatewayMetrics>) -> Result<()> {
    let mut messages = consumer
        .messages()
        .await
        .context("Failed to start the command stream")?;
    info!(consumer = CONSUMER_NAME, "Consuming bus commands");

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Command stream error");
                continue;
            }
        };

        let outcome = dispatch(&message.payload, |target, payload| cluster.route(target, payload));
        metrics.record_command(outcome.as_str());

        let acked = match outcome {
            CommandOutcome::Delivered => message.ack().await,
            CommandOutcome::Undeliverable | CommandOutcome::Malformed => message.ack_with(AckKind::Term).await,
        };
        if let Err(e) = acked {
            warn!(subject = %message.subject, error = %e, "Failed to acknowledge command");
        }
    }

    info!("Command stream closed");
    Ok(())
}
