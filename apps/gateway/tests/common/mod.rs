//! In-memory gateway for integration tests
//!
//! `MockConnector` hands every opened socket to the test as a [`Connection`],
//! which plays the remote end: it sends hello/dispatch frames and reads what
//! the shard writes.

#![allow(dead_code)]

use arrakis_shard_gateway::codec::WireMessage;
use arrakis_shard_gateway::events::{DispatchEvent, EventSink};
use arrakis_shard_gateway::gateway::{Gateway, StaticBootstrap};
use arrakis_shard_gateway::protocol::{GatewayPayload, OpCode};
use arrakis_shard_gateway::shard::{
    self, Connector, ShardContext, ShardHandle, ShardSettings, Socket, SocketCommand, SocketEvent,
    SocketPeer,
};
use arrakis_shard_gateway::GatewayError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use twilight_model::gateway::ShardId;

pub const GATEWAY_URL: &str = "wss://gateway.test";
pub const RESUME_URL: &str = "wss://resume.test";
pub const HEARTBEAT_INTERVAL_MS: u64 = 41_250;

/// The remote end of one socket.
pub struct Connection {
    pub shard_id: u32,
    pub url: String,
    peer: SocketPeer,
}

impl Connection {
    pub fn send(&self, payload: &GatewayPayload) {
        let text = serde_json::to_string(payload).unwrap();
        self.send_raw(WireMessage::Text(text));
    }

    pub fn send_raw(&self, message: WireMessage) {
        let _ = self.peer.events.send(SocketEvent::Message(message));
    }

    pub fn hello(&self, interval_ms: u64) {
        self.send(&GatewayPayload::new(
            OpCode::Hello,
            json!({ "heartbeat_interval": interval_ms }),
        ));
    }

    pub fn dispatch(&self, event: &str, sequence: u64, d: Value) {
        let mut payload = GatewayPayload::new(OpCode::Dispatch, d);
        payload.s = Some(sequence);
        payload.t = Some(event.to_string());
        self.send(&payload);
    }

    pub fn ready(&self, session_id: &str, sequence: u64) {
        self.dispatch(
            "READY",
            sequence,
            json!({
                "v": 10,
                "session_id": session_id,
                "resume_gateway_url": RESUME_URL,
                "user": { "id": "80351110224678912", "username": "arrakis" },
                "guilds": [],
            }),
        );
    }

    pub fn close(&self, code: u16) {
        let _ = self.peer.events.send(SocketEvent::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    /// Next thing the shard wrote, including closes.
    pub async fn next_command(&mut self) -> Option<SocketCommand> {
        self.peer.commands.recv().await
    }

    /// Next payload, heartbeats included.
    pub async fn next_payload_raw(&mut self) -> GatewayPayload {
        match self.next_command().await {
            Some(SocketCommand::Send(WireMessage::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text payload, got {other:?}"),
        }
    }

    /// Next payload that is not a heartbeat.
    pub async fn next_payload(&mut self) -> GatewayPayload {
        loop {
            let payload = self.next_payload_raw().await;
            if payload.op != OpCode::Heartbeat {
                return payload;
            }
        }
    }

    pub async fn expect(&mut self, op: OpCode) -> GatewayPayload {
        let payload = self.next_payload().await;
        assert_eq!(payload.op, op, "unexpected payload {payload:?}");
        payload
    }

    /// Skip everything until the shard closes the socket.
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            match self.next_command().await {
                Some(SocketCommand::Close { code, .. }) => return code,
                Some(SocketCommand::Send(_)) => continue,
                None => panic!("socket dropped without a close frame"),
            }
        }
    }
}

/// Connector whose sockets end up in the test.
pub struct MockConnector {
    opened: mpsc::UnboundedSender<Connection>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Connection>) {
        let (opened, connections) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            opened,
            fail_next: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        (connector, connections)
    }

    /// Refuse the next `count` connects.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, shard: ShardId, url: &str) -> Result<Socket, GatewayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(GatewayError::Connect {
                shard_id: shard.number(),
                url: url.to_string(),
                source: "connection refused".into(),
            });
        }

        let (socket, peer) = Socket::pair();
        let _ = self.opened.send(Connection {
            shard_id: shard.number(),
            url: url.to_string(),
            peer,
        });
        Ok(socket)
    }
}

/// Sink that keeps every published event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event_type).collect()
    }

    /// Wait until at least `count` events arrived.
    pub async fn wait_for(&self, count: usize) {
        for _ in 0..1_000 {
            if self.events.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {count} events, got {:?}", self.event_types());
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &DispatchEvent) -> Result<(), GatewayError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub connector: Arc<MockConnector>,
    pub connections: mpsc::UnboundedReceiver<Connection>,
    pub sink: Arc<RecordingSink>,
    pub ctx: ShardContext,
}

impl Harness {
    pub async fn new(shards: u32, max_concurrency: u16) -> Self {
        let gateway = Gateway::builder(Arc::new(StaticBootstrap::new(GATEWAY_URL, shards, max_concurrency)))
            .build()
            .await
            .unwrap();
        let gateway = Arc::new(gateway);
        let (connector, connections) = MockConnector::new();
        let sink = Arc::new(RecordingSink::default());
        let ctx = ShardContext::new(Arc::clone(&gateway), connector.clone())
            .with_sink(sink.clone());

        Self {
            gateway,
            connector,
            connections,
            sink,
            ctx,
        }
    }

    pub fn settings() -> ShardSettings {
        ShardSettings::new("test-token", GATEWAY_URL)
    }

    /// Spawn shard `id` of `total` without connecting it.
    pub fn spawn(&self, id: u32, total: u32, settings: ShardSettings) -> ShardHandle {
        shard::spawn(ShardId::new(id, total), Arc::new(settings), self.ctx.clone())
    }

    pub async fn next_connection(&mut self) -> Connection {
        self.connections.recv().await.expect("connector dropped")
    }

    /// Connect, identify and reach ready on a fresh socket.
    pub async fn ready_shard(&mut self, settings: ShardSettings) -> (ShardHandle, Connection) {
        let handle = self.spawn(0, 1, settings);
        handle.connect();
        let mut connection = self.next_connection().await;
        connection.hello(HEARTBEAT_INTERVAL_MS);
        connection.expect(OpCode::Identify).await;
        connection.ready("session-1", 1);
        assert!(handle.wait_for(arrakis_shard_gateway::ShardStage::Ready, Duration::from_secs(1)).await);
        (handle, connection)
    }
}
