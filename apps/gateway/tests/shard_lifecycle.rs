//! Shard state machine, driven end to end over in-memory sockets
//!
//! Every test runs on paused time so backoff, heartbeat and identify
//! cool-down delays elapse instantly but in order.

mod common;

use arrakis_shard_gateway::codec::{Compression, WireMessage};
use arrakis_shard_gateway::protocol::{GatewayPayload, OpCode};
use arrakis_shard_gateway::shard::{DisconnectOptions, SocketCommand};
use arrakis_shard_gateway::ShardStage;
use common::{Harness, GATEWAY_URL, HEARTBEAT_INTERVAL_MS, RESUME_URL};
use flate2::write::ZlibEncoder;
use serde_json::json;
use std::io::Write;
use std::time::Duration;
use tokio::time::Instant;

const SECOND: Duration = Duration::from_secs(1);

#[tokio::test(start_paused = true)]
async fn identifies_and_becomes_ready() {
    let mut harness = Harness::new(1, 1).await;
    let handle = harness.spawn(0, 1, Harness::settings());
    assert_eq!(handle.stage(), ShardStage::Idle);

    handle.connect();
    let mut connection = harness.next_connection().await;
    assert_eq!(connection.url, format!("{GATEWAY_URL}?v=10&encoding=json"));

    connection.hello(HEARTBEAT_INTERVAL_MS);
    let identify = connection.expect(OpCode::Identify).await;
    assert_eq!(identify.d["token"], "test-token");
    assert_eq!(identify.d["shard"], json!([0, 1]));
    assert!(identify.d["properties"]["os"].is_string());

    connection.ready("session-1", 1);
    assert!(handle.wait_for(ShardStage::Ready, SECOND).await);

    // A heartbeat goes out right after the handshake, carrying the sequence.
    let heartbeat = connection.next_payload_raw().await;
    assert_eq!(heartbeat.op, OpCode::Heartbeat);
    assert_eq!(heartbeat.d, json!(1));

    harness.sink.wait_for(1).await;
    assert_eq!(harness.sink.event_types(), vec!["READY"]);

    let session = harness.gateway.session(0).await;
    assert_eq!(session.session_id.as_deref(), Some("session-1"));
    assert_eq!(session.sequence, Some(1));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_ack_measures_latency() {
    let mut harness = Harness::new(1, 1).await;
    let (handle, mut connection) = harness.ready_shard(Harness::settings()).await;
    assert_eq!(handle.latency(), None);

    let heartbeat = connection.next_payload_raw().await;
    assert_eq!(heartbeat.op, OpCode::Heartbeat);

    tokio::time::sleep(Duration::from_millis(40)).await;
    connection.send(&GatewayPayload::new(OpCode::HeartbeatAck, json!(null)));

    let mut status = handle.subscribe();
    status.wait_for(|s| s.latency.is_some()).await.unwrap();
    let latency = handle.latency().unwrap();
    assert!(latency >= Duration::from_millis(40), "latency {latency:?}");
    assert_eq!(harness.ctx.state.mean_latency(), Some(latency));
}

#[tokio::test(start_paused = true)]
async fn sequence_only_moves_forward() {
    let mut harness = Harness::new(1, 1).await;
    let (_handle, mut connection) = harness.ready_shard(Harness::settings()).await;

    connection.dispatch("GUILD_CREATE", 5, json!({ "id": "41771983423143937" }));
    // Replayed, older frame.
    connection.dispatch("MESSAGE_CREATE", 3, json!({ "guild_id": "41771983423143937" }));
    harness.sink.wait_for(3).await;

    let events = harness.sink.events();
    assert_eq!(events[1].guild_id.as_deref(), Some("41771983423143937"));
    assert_eq!(events[2].sequence, Some(3));
    assert_eq!(harness.gateway.session(0).await.sequence, Some(5));

    // The remote asks for a beat; it carries the highest sequence seen.
    connection.send(&GatewayPayload::new(OpCode::Heartbeat, json!(null)));
    loop {
        let payload = connection.next_payload_raw().await;
        if payload.op == OpCode::Heartbeat && payload.d == json!(5) {
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn event_filter_limits_what_is_published() {
    let mut harness = Harness::new(1, 1).await;
    harness.ctx = harness.ctx.clone().with_filter("guild_create".parse().unwrap());
    let (_handle, connection) = harness.ready_shard(Harness::settings()).await;

    connection.dispatch("TYPING_START", 2, json!({}));
    connection.dispatch("GUILD_CREATE", 3, json!({ "id": "1" }));
    harness.sink.wait_for(1).await;
    assert_eq!(harness.sink.event_types(), vec!["GUILD_CREATE"]);
}

#[tokio::test(start_paused = true)]
async fn resumes_on_the_resume_url_after_a_recoverable_close() {
    let mut harness = Harness::new(1, 1).await;
    let (handle, connection) = harness.ready_shard(Harness::settings()).await;

    let closed_at = Instant::now();
    connection.close(4000);

    let mut connection = harness.next_connection().await;
    assert!(closed_at.elapsed() >= Duration::from_secs(5));
    assert_eq!(connection.url, format!("{RESUME_URL}?v=10&encoding=json"));
    assert_eq!(handle.stage(), ShardStage::Reconnecting);

    connection.hello(HEARTBEAT_INTERVAL_MS);
    let resume = connection.expect(OpCode::Resume).await;
    assert_eq!(resume.d["session_id"], "session-1");
    assert_eq!(resume.d["seq"], 1);
    assert_eq!(resume.d["token"], "test-token");

    connection.dispatch("RESUMED", 2, json!({}));
    assert!(handle.wait_for(ShardStage::Ready, SECOND).await);
}

#[tokio::test(start_paused = true)]
async fn non_resumable_invalid_session_identifies_again() {
    let mut harness = Harness::new(1, 1).await;
    let (handle, mut connection) = harness.ready_shard(Harness::settings()).await;

    connection.send(&GatewayPayload::new(OpCode::InvalidSession, json!(false)));
    let identify = connection.expect(OpCode::Identify).await;
    assert_eq!(identify.d["shard"], json!([0, 1]));
    assert_eq!(handle.stage(), ShardStage::Identifying);
    assert_eq!(harness.gateway.session(0).await.session_id, None);

    connection.ready("session-2", 1);
    assert!(handle.wait_for(ShardStage::Ready, SECOND).await);
}

#[tokio::test(start_paused = true)]
async fn resumable_invalid_session_resumes_in_place() {
    let mut harness = Harness::new(1, 1).await;
    let (_handle, mut connection) = harness.ready_shard(Harness::settings()).await;

    connection.send(&GatewayPayload::new(OpCode::InvalidSession, json!(true)));
    let resume = connection.expect(OpCode::Resume).await;
    assert_eq!(resume.d["session_id"], "session-1");
}

#[tokio::test(start_paused = true)]
async fn authentication_failure_stops_the_shard() {
    let mut harness = Harness::new(1, 1).await;
    let handle = harness.spawn(0, 1, Harness::settings());
    handle.connect();

    let mut connection = harness.next_connection().await;
    connection.hello(HEARTBEAT_INTERVAL_MS);
    connection.expect(OpCode::Identify).await;
    connection.close(4004);

    assert!(handle.wait_for(ShardStage::Disconnected, SECOND).await);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(harness.connections.try_recv().is_err(), "no reconnect after 4004");
    assert_eq!(harness.connector.attempts(), 1);
    assert_eq!(harness.gateway.session(0).await.session_id, None);

    // Disconnected is not destroyed; an explicit connect starts over.
    handle.connect();
    let mut connection = harness.next_connection().await;
    assert_eq!(connection.url, format!("{GATEWAY_URL}?v=10&encoding=json"));
    connection.hello(HEARTBEAT_INTERVAL_MS);
    connection.expect(OpCode::Identify).await;
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeat_reconnects_and_resumes() {
    let mut harness = Harness::new(1, 1).await;
    let handle = harness.spawn(0, 1, Harness::settings());
    handle.connect();

    let mut connection = harness.next_connection().await;
    connection.hello(1_000);
    connection.expect(OpCode::Identify).await;
    connection.ready("session-1", 1);
    assert!(handle.wait_for(ShardStage::Ready, SECOND).await);

    // The post-handshake heartbeat is never acknowledged.
    assert_eq!(connection.expect_close().await, 1012);

    let mut connection = harness.next_connection().await;
    connection.hello(HEARTBEAT_INTERVAL_MS);
    connection.expect(OpCode::Resume).await;
}

#[tokio::test(start_paused = true)]
async fn gateway_reconnect_request_keeps_the_session() {
    let mut harness = Harness::new(1, 1).await;
    let (_handle, mut connection) = harness.ready_shard(Harness::settings()).await;

    connection.send(&GatewayPayload::new(OpCode::Reconnect, json!(null)));
    assert_eq!(connection.expect_close().await, 4420);

    let mut connection = harness.next_connection().await;
    connection.hello(HEARTBEAT_INTERVAL_MS);
    connection.expect(OpCode::Resume).await;
}

#[tokio::test(start_paused = true)]
async fn ready_timeout_forces_a_fresh_identify() {
    let mut harness = Harness::new(1, 1).await;
    let handle = harness.spawn(0, 1, Harness::settings());
    handle.connect();

    let mut connection = harness.next_connection().await;
    connection.hello(HEARTBEAT_INTERVAL_MS);
    connection.expect(OpCode::Identify).await;

    let identified_at = Instant::now();
    assert_eq!(connection.expect_close().await, 1000);
    assert!(identified_at.elapsed() >= Duration::from_secs(15));

    let mut connection = harness.next_connection().await;
    assert_eq!(connection.url, format!("{GATEWAY_URL}?v=10&encoding=json"));
    connection.hello(HEARTBEAT_INTERVAL_MS);
    connection.expect(OpCode::Identify).await;
    assert_eq!(handle.stage(), ShardStage::Identifying);
}

#[tokio::test(start_paused = true)]
async fn reconnects_back_off_and_give_up() {
    let mut harness = Harness::new(1, 1).await;
    harness.connector.fail_next(usize::MAX);
    let mut settings = Harness::settings();
    settings.max_reconnects = Some(2);

    let started = Instant::now();
    let handle = harness.spawn(0, 1, settings);
    handle.connect();

    // Attempts at 0s, 5s and 15s; then the shard gives up.
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(harness.connector.attempts(), 3);
    assert_eq!(handle.stage(), ShardStage::Disconnected);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(harness.connector.attempts(), 3);
    assert!(started.elapsed() >= Duration::from_secs(316));
}

#[tokio::test(start_paused = true)]
async fn commands_wait_for_ready_and_overflow_drops_oldest() {
    let mut harness = Harness::new(1, 1).await;
    let mut settings = Harness::settings();
    settings.send_queue_capacity = 2;
    let handle = harness.spawn(0, 1, settings);

    for n in 1..=3 {
        assert!(handle.send(GatewayPayload::new(OpCode::PresenceUpdate, json!({ "n": n }))));
    }

    handle.connect();
    let mut connection = harness.next_connection().await;
    connection.hello(HEARTBEAT_INTERVAL_MS);
    connection.expect(OpCode::Identify).await;
    connection.ready("session-1", 1);

    let first = connection.expect(OpCode::PresenceUpdate).await;
    let second = connection.expect(OpCode::PresenceUpdate).await;
    assert_eq!(first.d["n"], 2);
    assert_eq!(second.d["n"], 3);
}

#[tokio::test(start_paused = true)]
async fn zlib_stream_frames_are_reassembled() {
    let mut harness = Harness::new(1, 1).await;
    let mut settings = Harness::settings();
    settings.compression = Some(Compression::ZlibStream);
    let handle = harness.spawn(0, 1, settings);
    handle.connect();

    let mut connection = harness.next_connection().await;
    assert!(connection.url.ends_with("&compress=zlib-stream"));

    let hello = serde_json::to_vec(&GatewayPayload::new(
        OpCode::Hello,
        json!({ "heartbeat_interval": HEARTBEAT_INTERVAL_MS }),
    ))
    .unwrap();
    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&hello).unwrap();
    encoder.flush().unwrap();
    let compressed = encoder.get_ref().clone();

    let (head, tail) = compressed.split_at(compressed.len() / 2);
    connection.send_raw(WireMessage::Binary(head.to_vec()));
    connection.send_raw(WireMessage::Binary(tail.to_vec()));

    connection.expect(OpCode::Identify).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_reconnect_closes_normally() {
    let mut harness = Harness::new(1, 1).await;
    let (handle, mut connection) = harness.ready_shard(Harness::settings()).await;

    handle.disconnect(DisconnectOptions::shutdown());
    assert_eq!(connection.expect_close().await, 1000);
    assert!(handle.wait_for(ShardStage::Disconnected, SECOND).await);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(harness.connections.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn destroy_is_terminal() {
    let mut harness = Harness::new(1, 1).await;
    let (handle, mut connection) = harness.ready_shard(Harness::settings()).await;

    handle.destroy().await;
    assert_eq!(handle.stage(), ShardStage::Destroyed);
    assert_eq!(connection.expect_close().await, 1000);
    assert_eq!(harness.gateway.session(0).await.session_id, None);

    tokio::task::yield_now().await;
    assert!(!handle.send(GatewayPayload::new(OpCode::PresenceUpdate, json!({}))));
    assert!(!handle.connect());

    let closed = connection.next_command().await;
    assert!(matches!(closed, None | Some(SocketCommand::Send(_))));
}

#[tokio::test(start_paused = true)]
async fn latency_is_forgotten_when_the_socket_closes() {
    let mut harness = Harness::new(1, 1).await;
    let (handle, mut connection) = harness.ready_shard(Harness::settings()).await;

    assert_eq!(connection.next_payload_raw().await.op, OpCode::Heartbeat);
    tokio::time::sleep(Duration::from_millis(250)).await;
    connection.send(&GatewayPayload::new(OpCode::HeartbeatAck, json!(null)));
    let mut status = handle.subscribe();
    status.wait_for(|s| s.latency.is_some()).await.unwrap();
    assert!(harness.ctx.state.mean_latency().is_some());

    connection.close(4004);
    assert!(handle.wait_for(ShardStage::Disconnected, SECOND).await);
    assert_eq!(handle.latency(), None);
    assert_eq!(harness.ctx.state.mean_latency(), None);
}

#[tokio::test(start_paused = true)]
async fn undecodable_frames_are_dropped_without_reconnecting() {
    let mut harness = Harness::new(1, 1).await;
    let (handle, mut connection) = harness.ready_shard(Harness::settings()).await;

    connection.send_raw(WireMessage::Text("{\"op\": 0, \"d\": ".to_string()));
    connection.send_raw(WireMessage::Text("not a payload".to_string()));
    connection.dispatch("GUILD_CREATE", 2, json!({ "id": "1" }));

    harness.sink.wait_for(2).await;
    assert_eq!(harness.sink.event_types(), vec!["READY", "GUILD_CREATE"]);
    assert_eq!(handle.stage(), ShardStage::Ready);

    connection.send(&GatewayPayload::new(OpCode::Heartbeat, json!(null)));
    loop {
        match connection.next_command().await {
            Some(SocketCommand::Send(WireMessage::Text(text))) => {
                let payload: GatewayPayload = serde_json::from_str(&text).unwrap();
                if payload.op == OpCode::Heartbeat && payload.d == json!(2) {
                    break;
                }
            }
            other => panic!("socket should stay open, got {other:?}"),
        }
    }
    assert_eq!(harness.connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn corrupt_compressed_stream_reconnects() {
    let mut harness = Harness::new(1, 1).await;
    let mut settings = Harness::settings();
    settings.compression = Some(Compression::ZlibStream);
    let handle = harness.spawn(0, 1, settings);
    handle.connect();

    let mut connection = harness.next_connection().await;
    // Not a zlib header, but terminated like a complete frame.
    connection.send_raw(WireMessage::Binary(vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0xff, 0xff]));
    assert_eq!(connection.expect_close().await, 1000);

    let connection = harness.next_connection().await;
    assert!(connection.url.ends_with("&compress=zlib-stream"));
    assert_eq!(harness.connector.attempts(), 2);
    assert_eq!(handle.stage(), ShardStage::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn session_ending_closes_reconnect_with_a_fresh_identify() {
    for code in [4003, 4007, 4009] {
        let mut harness = Harness::new(1, 1).await;
        let (handle, connection) = harness.ready_shard(Harness::settings()).await;

        connection.close(code);
        let mut connection = harness.next_connection().await;
        assert_eq!(connection.url, format!("{GATEWAY_URL}?v=10&encoding=json"), "close {code}");
        assert_eq!(harness.gateway.session(0).await.session_id, None, "close {code}");

        connection.hello(HEARTBEAT_INTERVAL_MS);
        let identify = connection.expect(OpCode::Identify).await;
        assert_eq!(identify.d["shard"], json!([0, 1]), "close {code}");
        assert_eq!(handle.stage(), ShardStage::Identifying, "close {code}");
    }
}

#[tokio::test(start_paused = true)]
async fn sequence_at_the_integer_limit_is_kept() {
    let mut harness = Harness::new(1, 1).await;
    let (handle, connection) = harness.ready_shard(Harness::settings()).await;

    connection.dispatch("GUILD_CREATE", u64::MAX, json!({ "id": "1" }));
    connection.dispatch("GUILD_UPDATE", 5, json!({ "id": "1" }));
    harness.sink.wait_for(3).await;

    assert_eq!(handle.stage(), ShardStage::Ready);
    assert_eq!(harness.gateway.session(0).await.sequence, Some(u64::MAX));
}
