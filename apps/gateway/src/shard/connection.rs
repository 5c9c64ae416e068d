//! Connection state machine
//!
//! A [`ShardRunner`] is the single owner of one shard's connection. Its loop
//! waits on everything that can move the shard forward (commands, socket
//! events, the heartbeat timer, an identify bucket, the ready deadline, a
//! scheduled reconnect, the send limiter) and handles one wake-up at a time,
//! so inbound frames are processed strictly in arrival order and no state is
//! shared with other shards.
//!
//! Nothing in the loop blocks on a timer: backoff, identify queueing and the
//! connect itself are pending futures or deadlines polled alongside the
//! socket, which keeps destroy and disconnect responsive at every point.

use super::heartbeat::{Beat, Heartbeater};
use super::limiter::SendLimiter;
use super::transport::{Socket, SocketEvent};
use super::{DisconnectOptions, ShardCommand, ShardContext, ShardSettings, ShardStage, ShardStatus};
use crate::codec::{Codec, Frame, Inflater, WireMessage};
use crate::error::GatewayError;
use crate::events::DispatchEvent;
use crate::identify::IdentifyPermit;
use crate::protocol::{
    self, classify_close, CloseCode, GatewayPayload, IdentifyInfo, OpCode, GOING_AWAY_CLOSE_CODE,
    NORMAL_CLOSE_CODE, RESUMABLE_CLOSE_CODE,
};
use crate::session::SessionField;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::pending;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use twilight_model::gateway::ShardId;

/// First reconnect delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Reconnect delays never grow past this.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Service restart; sent when the remote stopped acknowledging heartbeats.
const MISSED_HEARTBEAT_CLOSE_CODE: u16 = 1012;

/// Delay before reconnect attempt `attempt` (zero based).
pub fn backoff(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Locally cached session.
#[derive(Debug, Default)]
struct LocalSession {
    id: Option<String>,
    sequence: Option<u64>,
    /// Sequence at the moment the last socket closed.
    closing_sequence: Option<u64>,
    resume_url: Option<String>,
}

impl LocalSession {
    fn is_resumable(&self) -> bool {
        self.id.is_some() && self.sequence.is_some()
    }
}

/// Why the loop woke up.
enum Wake {
    Command(Option<ShardCommand>),
    Connected(Result<Socket, GatewayError>),
    Socket(SocketEvent),
    Heartbeat,
    Identify(Result<IdentifyPermit, GatewayError>),
    ReadyTimeout,
    Reconnect,
    Flush,
}

type PendingConnect = BoxFuture<'static, Result<Socket, GatewayError>>;
type PendingIdentify = BoxFuture<'static, Result<IdentifyPermit, GatewayError>>;

pub(crate) struct ShardRunner {
    id: ShardId,
    settings: Arc<ShardSettings>,
    ctx: ShardContext,
    commands: mpsc::UnboundedReceiver<ShardCommand>,
    status: watch::Sender<ShardStatus>,
    stage: ShardStage,
    codec: Codec,
    socket: Option<Socket>,
    inflater: Option<Inflater>,
    connecting: Option<PendingConnect>,
    identify: Option<PendingIdentify>,
    identify_requested_at: Option<Instant>,
    heartbeater: Heartbeater,
    limiter: SendLimiter,
    /// Heartbeat, identify and resume; sent whenever a socket is open.
    control: VecDeque<GatewayPayload>,
    /// Caller commands; sent only while ready.
    outbound: VecDeque<GatewayPayload>,
    session: LocalSession,
    ready_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    attempts: u32,
    user_logged: bool,
}

impl ShardRunner {
    pub(crate) fn new(
        id: ShardId,
        settings: Arc<ShardSettings>,
        ctx: ShardContext,
        commands: mpsc::UnboundedReceiver<ShardCommand>,
        status: watch::Sender<ShardStatus>,
    ) -> Self {
        Self {
            id,
            codec: Codec::new(settings.encoding),
            settings,
            ctx,
            commands,
            status,
            stage: ShardStage::Idle,
            socket: None,
            inflater: None,
            connecting: None,
            identify: None,
            identify_requested_at: None,
            heartbeater: Heartbeater::new(),
            limiter: SendLimiter::default(),
            control: VecDeque::new(),
            outbound: VecDeque::new(),
            session: LocalSession::default(),
            ready_deadline: None,
            reconnect_at: None,
            attempts: 0,
            user_logged: false,
        }
    }

    fn shard_id(&self) -> u32 {
        self.id.number()
    }

    pub(crate) async fn run(mut self) {
        debug!(shard_id = self.shard_id(), total = self.id.total(), "Shard task started");
        loop {
            let wake = self.next_wake().await;
            if self.handle(wake).await.is_break() {
                break;
            }
        }
        debug!(shard_id = self.shard_id(), "Shard task stopped");
    }

    async fn next_wake(&mut self) -> Wake {
        let flush_at = self.flush_deadline();
        let Self {
            commands,
            socket,
            connecting,
            identify,
            heartbeater,
            ready_deadline,
            reconnect_at,
            ..
        } = self;

        tokio::select! {
            command = commands.recv() => Wake::Command(command),
            result = poll_pending(connecting) => Wake::Connected(result),
            event = recv_socket(socket) => Wake::Socket(event),
            _ = heartbeater.tick() => Wake::Heartbeat,
            permit = poll_pending(identify) => Wake::Identify(permit),
            _ = sleep_opt(*ready_deadline) => Wake::ReadyTimeout,
            _ = sleep_opt(*reconnect_at) => Wake::Reconnect,
            _ = sleep_opt(flush_at) => Wake::Flush,
        }
    }

    async fn handle(&mut self, wake: Wake) -> ControlFlow<()> {
        match wake {
            Wake::Command(None) => {
                // Every handle is gone; nobody can observe or steer the shard.
                self.destroy().await;
                return ControlFlow::Break(());
            }
            Wake::Command(Some(ShardCommand::Destroy)) => {
                self.destroy().await;
                return ControlFlow::Break(());
            }
            Wake::Command(Some(ShardCommand::Send(payload))) => self.enqueue(payload),
            Wake::Command(Some(ShardCommand::Connect)) => self.connect(),
            Wake::Command(Some(ShardCommand::Disconnect(options))) => self.disconnect(options).await,
            Wake::Connected(result) => {
                self.connecting = None;
                self.on_connected(result).await;
            }
            Wake::Socket(event) => self.on_socket_event(event).await,
            Wake::Heartbeat => self.heartbeat(false).await,
            Wake::Identify(result) => {
                self.identify = None;
                self.on_identify_permit(result).await;
            }
            Wake::ReadyTimeout => {
                self.ready_deadline = None;
                self.on_ready_timeout().await;
            }
            Wake::Reconnect => {
                self.reconnect_at = None;
                self.connect();
            }
            Wake::Flush => {}
        }

        self.flush();
        ControlFlow::Continue(())
    }

    fn set_stage(&mut self, stage: ShardStage) {
        if self.stage == stage {
            return;
        }
        trace!(
            shard_id = self.shard_id(),
            from = self.stage.name(),
            to = stage.name(),
            "Shard stage changed"
        );
        self.stage = stage;
        self.ctx.state.set_stage(self.shard_id(), stage);
        self.status.send_modify(|status| status.stage = stage);
    }

    fn connect(&mut self) {
        let shard_id = self.shard_id();
        if self.stage == ShardStage::Destroyed {
            debug!(shard_id, "Ignoring connect on a destroyed shard");
            return;
        }
        if self.socket.is_some() || self.connecting.is_some() {
            trace!(shard_id, "Already connected or connecting");
            return;
        }

        self.reconnect_at = None;
        let stage = if self.stage == ShardStage::Disconnected {
            ShardStage::Reconnecting
        } else {
            ShardStage::Connecting
        };
        self.set_stage(stage);

        let base = match (&self.session.resume_url, self.session.is_resumable()) {
            (Some(resume_url), true) => resume_url.as_str(),
            _ => self.settings.url.as_str(),
        };
        let url = self.settings.connect_url(base);
        info!(shard_id, url = %url, stage = stage.name(), "Connecting to gateway");

        let connector = self.ctx.connector.clone();
        let id = self.id;
        self.connecting = Some(Box::pin(async move { connector.connect(id, &url).await }));
    }

    async fn on_connected(&mut self, result: Result<Socket, GatewayError>) {
        let shard_id = self.shard_id();
        match result {
            Ok(socket) => {
                self.socket = Some(socket);
                self.inflater = self.settings.compression.map(|_| Inflater::new());
                self.limiter.reset();
                self.attempts = 0;
                debug!(shard_id, "Gateway socket opened");
            }
            Err(e) => {
                warn!(shard_id, error = %e, attempt = self.attempts, "Gateway connection failed");
                self.ctx.metrics.record_error(shard_id, e.error_type_label());
                self.settle(DisconnectOptions::reconnect()).await;
            }
        }
    }

    async fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Message(message) => self.on_message(message).await,
            SocketEvent::Closed { code, reason } => self.on_close(code, reason).await,
        }
    }

    async fn on_message(&mut self, message: WireMessage) {
        let shard_id = self.shard_id();
        let decoded = match message {
            WireMessage::Text(text) => self.codec.decode(Frame::Text(&text)),
            WireMessage::Binary(bytes) => {
                let inflated = match self.inflater.as_mut().map(|inflater| inflater.push(&bytes)) {
                    None => None,
                    Some(Ok(Some(inflated))) => Some(inflated),
                    Some(Ok(None)) => return,
                    Some(Err(source)) => {
                        let err = GatewayError::Decompress { shard_id, source };
                        error!(shard_id, error = %err, "Compressed stream is corrupt, reconnecting");
                        self.ctx.metrics.record_error(shard_id, err.error_type_label());
                        self.disconnect(DisconnectOptions::reconnect()).await;
                        return;
                    }
                };
                match inflated {
                    Some(buffer) => self.codec.decode(Frame::Binary(&buffer)),
                    None => self.codec.decode(Frame::Binary(&bytes)),
                }
            }
        };

        let payload = match decoded {
            Ok(payload) => payload,
            Err(e) => {
                warn!(shard_id, error = %e, "Dropping undecodable frame");
                self.ctx.metrics.record_error(shard_id, e.error_type_label());
                return;
            }
        };

        self.ctx
            .metrics
            .record_packet_received(shard_id, payload.op, payload.event_name());
        self.ctx.state.record_received(shard_id);
        self.on_payload(payload).await;
    }

    async fn on_payload(&mut self, payload: GatewayPayload) {
        let shard_id = self.shard_id();
        match payload.op {
            OpCode::Hello => {
                let Some(interval) = payload.d.get("heartbeat_interval").and_then(Value::as_u64) else {
                    warn!(shard_id, "Hello without a heartbeat interval");
                    return;
                };
                debug!(shard_id, interval_ms = interval, "Hello received");
                self.heartbeater.start(Duration::from_millis(interval));
                self.set_stage(ShardStage::Identifying);
                self.identify_or_resume().await;
            }
            OpCode::Dispatch => self.on_dispatch(payload).await,
            OpCode::Heartbeat => self.heartbeat(true).await,
            OpCode::HeartbeatAck => {
                if let Some(latency) = self.heartbeater.acknowledge() {
                    trace!(shard_id, latency_ms = latency.as_millis() as u64, "Heartbeat acknowledged");
                    self.ctx.metrics.record_heartbeat_latency(shard_id, latency);
                    self.ctx.state.record_latency(shard_id, latency);
                    self.status.send_modify(|status| status.latency = Some(latency));
                }
            }
            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                warn!(shard_id, resumable, "Session invalidated by the gateway");
                if resumable && self.session.is_resumable() {
                    self.set_stage(ShardStage::Resuming);
                    self.queue_resume();
                } else {
                    self.invalidate_session().await;
                    self.set_stage(ShardStage::Identifying);
                    self.identify_or_resume().await;
                }
            }
            OpCode::Reconnect => {
                info!(shard_id, "Gateway requested a reconnect");
                self.disconnect(DisconnectOptions::reconnect()).await;
            }
            other => debug!(shard_id, op = other.name(), "Ignoring unexpected opcode"),
        }
    }

    async fn on_dispatch(&mut self, payload: GatewayPayload) {
        let shard_id = self.shard_id();
        if let Some(sequence) = payload.s {
            self.update_sequence(sequence).await;
        }

        match payload.event_name() {
            Some("READY") => {
                let session_id = payload
                    .d
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                self.session.resume_url = payload
                    .d
                    .get("resume_gateway_url")
                    .and_then(Value::as_str)
                    .map(str::to_owned);

                if let Some(id) = session_id.clone() {
                    self.session.id = Some(id.clone());
                    self.ctx
                        .gateway
                        .set_session_field(shard_id, SessionField::SessionId(id))
                        .await;
                }

                if !self.user_logged {
                    if let Some(user) = payload.d.get("user") {
                        info!(
                            shard_id,
                            user_id = user.get("id").and_then(serde_json::Value::as_str).unwrap_or_default(),
                            username = user.get("username").and_then(serde_json::Value::as_str).unwrap_or_default(),
                            "Logged in"
                        );
                        self.user_logged = true;
                    }
                }

                self.ready_deadline = None;
                self.set_stage(ShardStage::Ready);
                info!(shard_id, session_id = ?session_id, "Shard ready");
                self.heartbeat(true).await;
            }
            Some("RESUMED") => {
                self.ready_deadline = None;
                self.set_stage(ShardStage::Ready);
                info!(shard_id, sequence = ?self.session.sequence, "Session resumed");
                self.heartbeat(true).await;
            }
            _ => {}
        }

        self.forward(&payload).await;
    }

    /// Keep the highest sequence seen. Gaps are reported, not repaired.
    async fn update_sequence(&mut self, sequence: u64) {
        let shard_id = self.shard_id();
        if let Some(previous) = self.session.sequence {
            if sequence > previous.saturating_add(1) {
                warn!(shard_id, previous, sequence, "Sequence gap");
            }
            if sequence <= previous {
                return;
            }
        }

        self.session.sequence = Some(sequence);
        self.ctx
            .gateway
            .set_session_field(shard_id, SessionField::Sequence(sequence))
            .await;
    }

    async fn forward(&mut self, payload: &GatewayPayload) {
        let shard_id = self.shard_id();
        let Some(event) = DispatchEvent::from_payload(shard_id, payload) else {
            return;
        };
        if !self.ctx.filter.allows(&event.event_type) {
            return;
        }

        let started = Instant::now();
        match self.ctx.sink.publish(&event).await {
            Ok(()) => {
                self.ctx.state.record_route(shard_id);
                self.ctx.metrics.record_route_success(shard_id, started.elapsed());
            }
            Err(e) => {
                self.ctx.state.record_route_failure(shard_id);
                self.ctx.metrics.record_route_failure(shard_id);
                warn!(shard_id, event_type = %event.event_type, error = %e, "Failed to publish event");
            }
        }
    }

    /// Resume when a session is known, otherwise queue for an identify bucket.
    async fn identify_or_resume(&mut self) {
        if self.session.id.is_none() {
            let stored = self.ctx.gateway.session(self.shard_id()).await;
            self.session.id = stored.session_id;
            self.session.sequence = self.session.sequence.max(stored.sequence);
        }

        if self.session.is_resumable() {
            self.set_stage(ShardStage::Resuming);
            self.queue_resume();
        } else {
            self.request_identify();
        }
    }

    fn queue_resume(&mut self) {
        let (Some(session_id), Some(sequence)) = (self.session.id.as_deref(), self.session.sequence) else {
            return;
        };
        info!(
            shard_id = self.shard_id(),
            sequence,
            closing_sequence = ?self.session.closing_sequence,
            "Resuming session"
        );
        let resume = protocol::resume(&self.settings.token, session_id, sequence);
        self.control.push_back(resume);
    }

    fn request_identify(&mut self) {
        if self.identify.is_some() {
            return;
        }
        let shard_id = self.shard_id();
        let gateway = self.ctx.gateway.clone();
        debug!(shard_id, bucket = gateway.bucket_for(shard_id), "Waiting for identify bucket");

        self.identify_requested_at = Some(Instant::now());
        self.identify = Some(Box::pin(async move { gateway.acquire_identify(shard_id).await }));
    }

    async fn on_identify_permit(&mut self, result: Result<IdentifyPermit, GatewayError>) {
        let shard_id = self.shard_id();
        let waited = self
            .identify_requested_at
            .take()
            .map(|requested| requested.elapsed())
            .unwrap_or_default();

        let permit = match result {
            Ok(permit) => permit,
            Err(e) => {
                warn!(shard_id, error = %e, "Identify bucket unavailable");
                self.ctx.metrics.record_error(shard_id, e.error_type_label());
                self.disconnect(DisconnectOptions::reconnect()).await;
                return;
            }
        };

        let bucket = permit.bucket();
        self.ctx.metrics.record_identify_wait(bucket, waited);
        if self.socket.is_none() || self.stage != ShardStage::Identifying {
            permit.release();
            return;
        }

        let identify = protocol::identify(&IdentifyInfo {
            token: &self.settings.token,
            shard_id,
            shard_total: self.id.total(),
            intents: self.settings.intents,
            large_threshold: self.settings.large_threshold,
        });
        self.control.push_back(identify);
        self.flush();
        permit.release();

        self.ready_deadline = Some(Instant::now() + self.settings.ready_timeout);
        info!(shard_id, bucket, waited_ms = waited.as_millis() as u64, "Identifying");
    }

    async fn on_ready_timeout(&mut self) {
        if self.stage == ShardStage::Ready {
            return;
        }
        let shard_id = self.shard_id();
        warn!(
            shard_id,
            timeout_ms = self.settings.ready_timeout.as_millis() as u64,
            "Shard did not become ready after identify"
        );
        self.ctx.metrics.record_error(shard_id, "ready_timeout");
        self.disconnect(DisconnectOptions {
            reconnect: true,
            fatal: true,
            code: None,
        })
        .await;
    }

    async fn heartbeat(&mut self, ignore_if_unacked: bool) {
        if self.socket.is_none() {
            return;
        }
        let shard_id = self.shard_id();
        match self.heartbeater.beat(ignore_if_unacked) {
            Beat::Send => {
                trace!(shard_id, sequence = ?self.session.sequence, "Heartbeat");
                self.control.push_front(protocol::heartbeat(self.session.sequence));
            }
            Beat::Missed => {
                warn!(shard_id, "Heartbeat was not acknowledged, reconnecting");
                self.ctx.metrics.record_error(shard_id, "heartbeat_missed");
                self.disconnect(DisconnectOptions {
                    reconnect: true,
                    fatal: false,
                    code: Some(MISSED_HEARTBEAT_CLOSE_CODE),
                })
                .await;
            }
        }
    }

    async fn on_close(&mut self, code: Option<u16>, reason: String) {
        let shard_id = self.shard_id();
        self.teardown();

        let action = classify_close(code);
        let reason = code
            .and_then(CloseCode::from_code)
            .map(|known| known.reason().to_string())
            .unwrap_or(reason);

        if !action.reconnect {
            error!(shard_id, code = ?code, reason = %reason, "Unrecoverable close, shard stopped");
            self.ctx.metrics.record_error(shard_id, "unrecoverable_close");
        } else if action.invalidate_session {
            warn!(shard_id, code = ?code, reason = %reason, "Gateway closed the session");
        } else {
            info!(shard_id, code = ?code, reason = %reason, "Gateway socket closed");
        }

        self.settle(DisconnectOptions {
            reconnect: action.reconnect,
            fatal: action.invalidate_session,
            code,
        })
        .await;
    }

    /// Drop the live socket and everything bound to it.
    fn teardown(&mut self) -> Option<Socket> {
        self.heartbeater.reset();
        self.ctx.state.clear_latency(self.shard_id());
        self.status.send_if_modified(|status| status.latency.take().is_some());
        self.inflater = None;
        self.control.clear();
        self.identify = None;
        self.identify_requested_at = None;
        self.ready_deadline = None;
        if self.session.sequence.is_some() {
            self.session.closing_sequence = self.session.sequence;
        }
        self.socket.take()
    }

    async fn disconnect(&mut self, options: DisconnectOptions) {
        let shard_id = self.shard_id();
        if self.socket.is_none() {
            // No live socket; only what is pending can be cancelled.
            if !options.reconnect {
                let connecting = self.connecting.take().is_some();
                let scheduled = self.reconnect_at.take().is_some();
                if options.fatal {
                    self.invalidate_session().await;
                }
                if connecting || scheduled {
                    self.set_stage(ShardStage::Disconnected);
                }
            }
            return;
        }

        self.set_stage(ShardStage::Disconnecting);
        let keep_session = options.reconnect && !options.fatal && self.session.id.is_some();
        // 1000 and 1001 end the session remotely; anything else keeps it.
        let code = if keep_session {
            options
                .code
                .filter(|&code| code != NORMAL_CLOSE_CODE && code != GOING_AWAY_CLOSE_CODE)
                .unwrap_or(RESUMABLE_CLOSE_CODE)
        } else {
            options.code.unwrap_or(NORMAL_CLOSE_CODE)
        };

        if let Some(socket) = self.teardown() {
            socket.close(code, if keep_session { "resuming" } else { "disconnecting" });
        }
        debug!(
            shard_id,
            code,
            reconnect = options.reconnect,
            fatal = options.fatal,
            "Closed gateway socket"
        );

        self.settle(options).await;
    }

    /// Common tail of every teardown.
    async fn settle(&mut self, options: DisconnectOptions) {
        self.set_stage(ShardStage::Disconnected);
        if options.fatal {
            self.invalidate_session().await;
        }
        if options.reconnect {
            self.schedule_reconnect().await;
        } else {
            info!(shard_id = self.shard_id(), "Shard disconnected");
        }
    }

    async fn schedule_reconnect(&mut self) {
        let shard_id = self.shard_id();
        if let Some(max) = self.settings.max_reconnects {
            if self.attempts >= max {
                error!(shard_id, attempts = self.attempts, "Reconnect attempts exhausted, giving up");
                self.ctx.metrics.record_error(shard_id, "reconnects_exhausted");
                self.reconnect_at = None;
                self.invalidate_session().await;
                return;
            }
        }

        let delay = backoff(self.attempts);
        self.attempts += 1;
        self.reconnect_at = Some(Instant::now() + delay);
        info!(
            shard_id,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
    }

    async fn invalidate_session(&mut self) {
        self.session = LocalSession::default();
        self.ctx.gateway.invalidate_session(self.shard_id()).await;
        debug!(shard_id = self.shard_id(), "Session invalidated");
    }

    async fn destroy(&mut self) {
        self.disconnect(DisconnectOptions {
            reconnect: false,
            fatal: true,
            code: Some(NORMAL_CLOSE_CODE),
        })
        .await;
        self.connecting = None;
        self.reconnect_at = None;
        self.outbound.clear();
        self.set_stage(ShardStage::Destroyed);
        info!(shard_id = self.shard_id(), "Shard destroyed");
    }

    /// Keep at most `send_queue_capacity` caller commands, dropping the oldest.
    fn enqueue(&mut self, payload: GatewayPayload) {
        let capacity = self.settings.send_queue_capacity.max(1);
        if self.outbound.len() >= capacity {
            self.outbound.pop_front();
            warn!(shard_id = self.shard_id(), capacity, "Send queue full, dropped oldest command");
            self.ctx.metrics.record_error(self.shard_id(), "send_queue_overflow");
        }
        self.outbound.push_back(payload);
    }

    /// Write as much as the limiter allows: control frames first, caller
    /// commands only once ready.
    fn flush(&mut self) {
        let shard_id = self.shard_id();
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        loop {
            let from_control = !self.control.is_empty();
            if !from_control && (self.stage != ShardStage::Ready || self.outbound.is_empty()) {
                break;
            }
            if !self.limiter.try_acquire() {
                trace!(shard_id, "Send rate limited");
                break;
            }

            let payload = if from_control {
                self.control.pop_front()
            } else {
                self.outbound.pop_front()
            };
            let Some(payload) = payload else {
                break;
            };

            match self.codec.encode(&payload) {
                Ok(message) => {
                    if !socket.send(message) {
                        break;
                    }
                    self.ctx.metrics.record_packet_sent(shard_id, payload.op);
                    self.ctx.state.record_sent(shard_id);
                }
                Err(e) => {
                    warn!(shard_id, op = payload.op.name(), error = %e, "Dropping payload that failed to encode");
                    self.ctx.metrics.record_error(shard_id, e.error_type_label());
                }
            }
        }
    }

    /// When the limiter will let queued payloads through, if any are waiting.
    fn flush_deadline(&self) -> Option<Instant> {
        if self.socket.is_none() {
            return None;
        }
        let waiting = !self.control.is_empty()
            || (self.stage == ShardStage::Ready && !self.outbound.is_empty());
        if waiting {
            self.limiter.ready_at()
        } else {
            None
        }
    }
}

async fn poll_pending<T>(pending_future: &mut Option<BoxFuture<'static, T>>) -> T {
    match pending_future {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn recv_socket(socket: &mut Option<Socket>) -> SocketEvent {
    match socket {
        Some(socket) => socket.recv().await,
        None => pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
