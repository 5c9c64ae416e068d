//! Shard management module
//!
//! One actor task per shard owns the connection lifecycle (see
//! [`connection`]). Everything else talks to it through a cloneable
//! [`ShardHandle`].

mod connection;
mod heartbeat;
mod limiter;
mod state;
mod transport;

pub use connection::{backoff, INITIAL_BACKOFF, MAX_BACKOFF};
pub use heartbeat::{Beat, Heartbeater};
pub use limiter::{SendLimiter, SEND_CAPACITY, SEND_WINDOW};
pub use state::{ShardState, ShardStateEntry};
pub use transport::{Connector, Socket, SocketCommand, SocketEvent, SocketPeer, WebSocketConnector};

use crate::codec::{Compression, Encoding};
use crate::events::{EventFilter, EventSink, NullSink};
use crate::gateway::Gateway;
use crate::metrics::GatewayMetrics;
use crate::protocol::GatewayPayload;
use connection::ShardRunner;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use twilight_model::gateway::{Intents, ShardId};

/// Gateway API version spoken by default.
pub const API_VERSION: u8 = 10;

/// Lifecycle stage of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShardStage {
    #[default]
    Idle,
    Connecting,
    Reconnecting,
    Identifying,
    Resuming,
    Ready,
    Disconnecting,
    Disconnected,
    /// Terminal; the task has stopped.
    Destroyed,
}

impl ShardStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Reconnecting => "reconnecting",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Connection settings, fixed for the life of a shard.
#[derive(Debug, Clone)]
pub struct ShardSettings {
    pub token: String,
    /// Base gateway URL, without query.
    pub url: String,
    pub version: u8,
    pub encoding: Encoding,
    pub compression: Option<Compression>,
    pub intents: Intents,
    pub large_threshold: Option<u8>,
    /// Consecutive reconnects before giving up; `None` retries forever.
    pub max_reconnects: Option<u32>,
    /// How long an identify may take to reach `READY`.
    pub ready_timeout: Duration,
    /// Commands kept while not ready; the oldest is dropped beyond this.
    pub send_queue_capacity: usize,
}

impl ShardSettings {
    pub fn new(token: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            url: url.into(),
            version: API_VERSION,
            encoding: Encoding::Json,
            compression: None,
            intents: Intents::GUILDS | Intents::GUILD_MEMBERS,
            large_threshold: None,
            max_reconnects: Some(10),
            ready_timeout: Duration::from_secs(15),
            send_queue_capacity: 4096,
        }
    }

    /// Full connection URL for a base (configured or resume) URL.
    pub fn connect_url(&self, base: &str) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{separator}v={}&encoding={}",
            base.trim_end_matches('/'),
            self.version,
            self.encoding
        );
        if let Some(compression) = self.compression {
            url.push_str("&compress=");
            url.push_str(compression.as_str());
        }
        url
    }
}

/// Shared collaborators handed to every shard.
#[derive(Clone)]
pub struct ShardContext {
    pub gateway: Arc<Gateway>,
    pub connector: Arc<dyn Connector>,
    pub sink: Arc<dyn EventSink>,
    pub filter: Arc<EventFilter>,
    pub metrics: Arc<GatewayMetrics>,
    pub state: ShardState,
}

impl ShardContext {
    /// Events dropped, no metrics recorder, fresh health registry.
    pub fn new(gateway: Arc<Gateway>, connector: Arc<dyn Connector>) -> Self {
        Self {
            gateway,
            connector,
            sink: Arc::new(NullSink),
            filter: Arc::new(EventFilter::All),
            metrics: Arc::new(GatewayMetrics::detached()),
            state: ShardState::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_state(mut self, state: ShardState) -> Self {
        self.state = state;
        self
    }
}

/// How to tear a connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Schedule a reconnect afterwards.
    pub reconnect: bool,
    /// Invalidate the session; the next connect identifies.
    pub fatal: bool,
    /// Close code when the session is not being kept.
    pub code: Option<u16>,
}

impl DisconnectOptions {
    pub fn reconnect() -> Self {
        Self {
            reconnect: true,
            fatal: false,
            code: None,
        }
    }

    pub fn shutdown() -> Self {
        Self {
            reconnect: false,
            fatal: false,
            code: None,
        }
    }
}

/// Snapshot published by a shard on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardStatus {
    pub stage: ShardStage,
    pub latency: Option<Duration>,
}

#[derive(Debug)]
pub(crate) enum ShardCommand {
    Send(GatewayPayload),
    Connect,
    Disconnect(DisconnectOptions),
    Destroy,
}

/// Cloneable handle on a running shard.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    id: ShardId,
    commands: mpsc::UnboundedSender<ShardCommand>,
    status: watch::Receiver<ShardStatus>,
}

impl ShardHandle {
    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn status(&self) -> ShardStatus {
        *self.status.borrow()
    }

    pub fn stage(&self) -> ShardStage {
        self.status.borrow().stage
    }

    /// Last measured heartbeat round trip.
    pub fn latency(&self) -> Option<Duration> {
        self.status.borrow().latency
    }

    /// Queue a command for the remote. Returns false once the shard is
    /// destroyed; the command is dropped.
    pub fn send(&self, payload: GatewayPayload) -> bool {
        self.commands.send(ShardCommand::Send(payload)).is_ok()
    }

    /// Connect now. No-op while connected and after destroy.
    pub fn connect(&self) -> bool {
        self.commands.send(ShardCommand::Connect).is_ok()
    }

    pub fn disconnect(&self, options: DisconnectOptions) -> bool {
        self.commands.send(ShardCommand::Disconnect(options)).is_ok()
    }

    /// Disconnect for good and wait for the task to stop.
    pub async fn destroy(&self) {
        if self.commands.send(ShardCommand::Destroy).is_err() {
            return;
        }
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.stage == ShardStage::Destroyed).await;
    }

    /// Wait until the shard reaches `stage`. False on timeout or if the
    /// shard stopped first.
    pub async fn wait_for(&self, stage: ShardStage, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        let result = tokio::time::timeout(timeout, status.wait_for(|s| s.stage == stage)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Observe every status change.
    pub fn subscribe(&self) -> watch::Receiver<ShardStatus> {
        self.status.clone()
    }
}

/// Start the actor for one shard. The shard stays idle until
/// [`ShardHandle::connect`].
pub fn spawn(id: ShardId, settings: Arc<ShardSettings>, ctx: ShardContext) -> ShardHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ShardStatus::default());

    ctx.state.register(id.number());
    let runner = ShardRunner::new(id, settings, ctx, commands_rx, status_tx);
    tokio::spawn(runner.run());

    ShardHandle {
        id,
        commands: commands_tx,
        status: status_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_carries_version_encoding_and_compression() {
        let mut settings = ShardSettings::new("token", "wss://gateway.discord.gg");
        assert_eq!(
            settings.connect_url("wss://gateway.discord.gg"),
            "wss://gateway.discord.gg?v=10&encoding=json"
        );

        settings.encoding = Encoding::Etf;
        settings.compression = Some(Compression::ZlibStream);
        assert_eq!(
            settings.connect_url("wss://gateway-us-east1-b.discord.gg/"),
            "wss://gateway-us-east1-b.discord.gg?v=10&encoding=etf&compress=zlib-stream"
        );
    }

    #[test]
    fn connect_url_extends_an_existing_query() {
        let settings = ShardSettings::new("token", "wss://proxy.local/?region=eu");
        assert_eq!(
            settings.connect_url("wss://proxy.local/?region=eu"),
            "wss://proxy.local/?region=eu&v=10&encoding=json"
        );
    }
}
