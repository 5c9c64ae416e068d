//! NATS event publisher
//!
//! Publishes forwarded dispatch events to JetStream and provisions the
//! streams the gateway reads from and writes to.

use crate::error::GatewayError;
use crate::events::{DispatchEvent, EventSink};
use anyhow::{Context, Result};
use async_nats::connection::State;
use async_nats::jetstream::{self, Context as JsContext};
use async_nats::Client;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Stream names
pub mod streams {
    /// Commands addressed to shards
    pub const COMMANDS: &str = "COMMANDS";
    /// Forwarded dispatch events
    pub const EVENTS: &str = "EVENTS";
}

/// Every dispatch subject lives under this prefix
pub const EVENTS_SUBJECTS: &str = "events.>";

/// NATS publisher for gateway events
pub struct NatsPublisher {
    client: Client,
    jetstream: JsContext,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS server
    pub async fn connect(servers: &str) -> Result<Arc<Self>> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            client,
            jetstream,
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    pub fn jetstream(&self) -> &JsContext {
        &self.jetstream
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    /// Get total messages published
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Get total publish failures
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    async fn publish_bytes(&self, subject: String, payload: Vec<u8>) -> Result<(), GatewayError> {
        let failed = |source: Box<dyn std::error::Error + Send + Sync>| GatewayError::NatsPublishFailed {
            subject: subject.clone(),
            source,
        };

        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| failed(Box::new(e)))?
            .await
            .map_err(|e| failed(Box::new(e)))?;

        debug!(subject, stream = %ack.stream, seq = ack.sequence, "Event published");
        Ok(())
    }

    /// Flush pending publishes before shutdown
    pub async fn close(&self) {
        info!("Closing NATS connection");
        if let Err(e) = self.client.flush().await {
            debug!(error = %e, "NATS flush on shutdown failed");
        }
    }
}

#[async_trait]
impl EventSink for NatsPublisher {
    async fn publish(&self, event: &DispatchEvent) -> Result<(), GatewayError> {
        let subject = event.subject();
        let payload = serde_json::to_vec(event).map_err(|e| GatewayError::Encode(e.to_string()))?;

        debug!(
            event_type = %event.event_type,
            subject,
            event_id = %event.event_id,
            shard_id = event.shard_id,
            "Publishing event"
        );

        match self.publish_bytes(subject, payload).await {
            Ok(()) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// Ensure streams exist with correct configuration
///
/// Idempotent; run at startup before the command consumer is created.
pub async fn ensure_streams(js: &JsContext, commands_subject: &str) -> Result<()> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    // COMMANDS - work queue, each command is taken by exactly one consumer
    js.get_or_create_stream(Config {
        name: streams::COMMANDS.to_string(),
        subjects: vec![commands_subject.to_string()],
        retention: RetentionPolicy::WorkQueue,
        max_age: Duration::from_secs(60),
        storage: StorageType::Memory,
        ..Default::default()
    })
    .await
    .context("Failed to provision COMMANDS stream")?;
    debug!(subject = commands_subject, "COMMANDS stream ready");

    // EVENTS - memory storage, 5min retention for event processing
    js.get_or_create_stream(Config {
        name: streams::EVENTS.to_string(),
        subjects: vec![EVENTS_SUBJECTS.to_string()],
        retention: RetentionPolicy::Limits,
        max_age: Duration::from_secs(300),
        storage: StorageType::Memory,
        ..Default::default()
    })
    .await
    .context("Failed to provision EVENTS stream")?;

    info!("NATS streams configured");
    Ok(())
}
