//! Heartbeat timer tests under the paused tokio clock: the outgoing pulse,
//! its re-arming on real traffic, and the receive-side watchdog.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockTransport, connected_payload, establish, settle};
use osmium_stomp::{
    ConnectConfig, Connection, ConnectionStatus, Frame, FrameType, StompClient,
};

async fn connected_with_heartbeats(
    transport: &Arc<MockTransport>,
    server_heartbeat: &str,
) -> Connection {
    let connection = Connection::v11("c1", transport.clone());
    let config = ConnectConfig::new()
        .heartbeat(Duration::from_secs(1), Duration::from_secs(1));
    establish(
        &connection,
        transport,
        config,
        &connected_payload(&[("version", "1.2"), ("heart-beat", server_heartbeat)]),
    )
    .await;
    transport.clear_sent();
    connection
}

fn heartbeats_sent(transport: &MockTransport) -> usize {
    transport.sent_text().iter().filter(|s| s.as_str() == "\n").count()
}

// ============================================================================
// Outgoing pulse
// ============================================================================

#[tokio::test(start_paused = true)]
async fn idle_connection_sends_heartbeats_at_the_negotiated_interval() {
    let transport = MockTransport::open();
    // server wants to receive every 1s, sends nothing itself
    let _connection = connected_with_heartbeats(&transport, "0,1000").await;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 2);
}

#[tokio::test(start_paused = true)]
async fn real_traffic_rearms_the_outgoing_pulse() {
    let transport = MockTransport::open();
    let connection = connected_with_heartbeats(&transport, "0,1000").await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    connection
        .send(Frame::new(FrameType::Send).header("destination", "/q"))
        .await
        .unwrap();
    transport.clear_sent();

    // the tick half a second later finds recent traffic and stays quiet
    tokio::time::sleep(Duration::from_millis(600)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 0);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 1);
}

#[tokio::test(start_paused = true)]
async fn pulse_follows_within_one_interval_of_late_traffic() {
    let transport = MockTransport::open();
    let connection = connected_with_heartbeats(&transport, "0,1000").await;

    tokio::time::sleep(Duration::from_millis(1050)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 1);

    // a real frame just after the pulse moves the deadline to ~2050ms;
    // a fixed ticker would stay quiet until 3000ms
    connection
        .send(Frame::new(FrameType::Send).header("destination", "/q"))
        .await
        .unwrap();
    transport.clear_sent();

    tokio::time::sleep(Duration::from_millis(990)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 1);
}

#[tokio::test(start_paused = true)]
async fn no_heartbeats_without_agreement() {
    let transport = MockTransport::open();
    let connection = connected_with_heartbeats(&transport, "0,0").await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 0);
    assert_eq!(connection.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn legacy_sessions_never_run_heartbeat_timers() {
    let transport = MockTransport::open();
    let connection = Connection::v10("c1", transport.clone());
    establish(
        &connection,
        &transport,
        ConnectConfig::new().heartbeat(Duration::from_secs(1), Duration::from_secs(1)),
        &connected_payload(&[("heart-beat", "1000,1000")]),
    )
    .await;
    transport.clear_sent();

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 0);
    assert_eq!(connection.status(), ConnectionStatus::Connected);
}

// ============================================================================
// Receive-side watchdog
// ============================================================================

#[tokio::test(start_paused = true)]
async fn silent_broker_trips_the_watchdog() {
    let transport = MockTransport::open();
    // server promises a pulse every 1s; the mock never sends one
    let connection = connected_with_heartbeats(&transport, "1000,0").await;

    tokio::time::sleep(Duration::from_millis(2600)).await;
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert!(connection.session_info().is_none());
}

#[tokio::test(start_paused = true)]
async fn inbound_heartbeats_keep_the_session_alive() {
    let transport = MockTransport::open();
    let connection = connected_with_heartbeats(&transport, "1000,0").await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(800)).await;
        transport.inject_text("\n");
        settle().await;
    }
    assert_eq!(connection.status(), ConnectionStatus::Connected);

    // silence past the allowance still trips it afterwards
    tokio::time::sleep(Duration::from_millis(2600)).await;
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn inbound_frames_also_feed_the_watchdog() {
    let transport = MockTransport::open();
    let connection = connected_with_heartbeats(&transport, "1000,0").await;

    for i in 0..4 {
        tokio::time::sleep(Duration::from_millis(800)).await;
        transport.inject_text(&format!(
            "MESSAGE\ndestination:/q\nmessage-id:{i}\n\nx\0"
        ));
        settle().await;
    }
    assert_eq!(connection.status(), ConnectionStatus::Connected);
}

// ============================================================================
// ERROR frames
// ============================================================================

#[tokio::test(start_paused = true)]
async fn error_frame_cancels_the_timers_but_keeps_the_session() {
    let transport = MockTransport::open();
    let connection = connected_with_heartbeats(&transport, "0,1000").await;

    transport.inject_text("ERROR\nmessage:broker complaint\n\n\0");
    settle().await;
    transport.clear_sent();

    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;
    assert_eq!(heartbeats_sent(&transport), 0);
    assert_eq!(connection.status(), ConnectionStatus::Connected);
}
