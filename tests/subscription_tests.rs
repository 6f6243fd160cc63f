//! Subscription tests: header injection, delivery filtering, the ack
//! protocol, and cascading teardown.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{MockTransport, connected_payload, establish, settle};
use osmium_stomp::{
    AckMode, ConnectConfig, Connection, StompClient, StompError, Subscription,
    SubscriptionStatus, TransportStatus,
};

async fn connected_v12(transport: &Arc<MockTransport>) -> Connection {
    let connection = Connection::v11("c1", transport.clone());
    establish(
        &connection,
        transport,
        ConnectConfig::new(),
        &connected_payload(&[("version", "1.2")]),
    )
    .await;
    transport.clear_sent();
    connection
}

fn subscription(connection: &Connection, ack_mode: AckMode) -> Subscription {
    Subscription::new(
        Arc::new(connection.clone()),
        "/q",
        Some("ABC".to_string()),
        ack_mode,
    )
}

// ============================================================================
// SUBSCRIBE / UNSUBSCRIBE
// ============================================================================

#[tokio::test]
async fn subscribe_injects_id_destination_and_ack_mode() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);

    let receipt = sub.subscribe(None).await.unwrap();
    assert!(receipt.is_none());
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Subscribed);
    assert_eq!(
        transport.last_sent_text().unwrap(),
        "SUBSCRIBE\nid:ABC\ndestination:/q\nack:auto\ncontent-length:0\n\n\0"
    );
}

#[tokio::test]
async fn subscribe_with_receipt_waits_for_confirmation() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);

    let s = sub.clone();
    let task = tokio::spawn(async move { s.subscribe(Some("r1")).await });
    settle().await;
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Uninitialized);
    transport.inject_text("RECEIPT\nreceipt-id:r1\n\n\0");

    let confirmation = task.await.unwrap().unwrap();
    assert_eq!(
        confirmation.unwrap().get_header("receipt-id"),
        Some("r1")
    );
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Subscribed);
}

#[tokio::test]
async fn error_during_the_subscribe_receipt_forces_unsubscribed() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);

    let s = sub.clone();
    let task = tokio::spawn(async move { s.subscribe(Some("r1")).await });
    settle().await;
    transport.inject_text("ERROR\nmessage:subscribe refused\n\n\0");

    let result = task.await.unwrap();
    assert!(matches!(result, Err(StompError::Protocol(_))));
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Unsubscribed);
}

#[tokio::test]
async fn unsubscribe_with_receipt_waits_for_confirmation() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    sub.subscribe(None).await.unwrap();

    let s = sub.clone();
    let task = tokio::spawn(async move { s.unsubscribe(Some("r-un")).await });
    settle().await;
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Subscribed);
    transport.inject_text("RECEIPT\nreceipt-id:r-un\n\n\0");

    let confirmation = task.await.unwrap().unwrap();
    assert_eq!(confirmation.unwrap().get_header("receipt-id"), Some("r-un"));
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Unsubscribed);
    assert_eq!(
        transport.last_sent_text().unwrap(),
        "UNSUBSCRIBE\nreceipt:r-un\nid:ABC\ncontent-length:0\n\n\0"
    );
}

#[tokio::test]
async fn subscribe_twice_is_a_no_op() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);

    sub.subscribe(None).await.unwrap();
    sub.subscribe(None).await.unwrap();
    assert_eq!(transport.sent_text().len(), 1);
}

#[tokio::test]
async fn unsubscribe_prefers_the_subscription_id() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    sub.subscribe(None).await.unwrap();

    sub.unsubscribe(None).await.unwrap();
    assert_eq!(
        transport.last_sent_text().unwrap(),
        "UNSUBSCRIBE\nid:ABC\ncontent-length:0\n\n\0"
    );
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Unsubscribed);
}

#[tokio::test]
async fn unsubscribe_before_subscribe_is_a_no_op() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);

    let receipt = sub.unsubscribe(None).await.unwrap();
    assert!(receipt.is_none());
    assert!(transport.sent_text().is_empty());
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Uninitialized);
}

// ============================================================================
// Delivery filtering
// ============================================================================

#[tokio::test]
async fn matching_delivery_is_republished() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    sub.subscribe(None).await.unwrap();

    let mut rx = sub.message_stream();
    transport.inject_text("MESSAGE\ndestination:/q\nmessage-id:1\nsubscription:ABC\n\nhello\0");

    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.body.as_deref(), Some("hello"));
}

#[tokio::test]
async fn foreign_subscription_id_is_filtered_out() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    sub.subscribe(None).await.unwrap();

    let mut rx = sub.message_stream();
    transport.inject_text("MESSAGE\ndestination:/q\nmessage-id:1\nsubscription:XYZ\n\nhello\0");
    settle().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn foreign_destination_is_filtered_out() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    sub.subscribe(None).await.unwrap();

    let mut rx = sub.message_stream();
    transport.inject_text("MESSAGE\ndestination:/other\nmessage-id:1\nsubscription:ABC\n\nx\0");
    settle().await;
    assert!(rx.try_recv().is_err());
}

// ============================================================================
// Acknowledgement protocol
// ============================================================================

#[tokio::test]
async fn auto_mode_never_sends_acks() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    sub.subscribe(None).await.unwrap();
    transport.clear_sent();

    let mut rx = sub.message_stream();
    transport.inject_text(
        "MESSAGE\ndestination:/q\nmessage-id:1\nsubscription:ABC\nack:ack-1\n\nhello\0",
    );
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(transport.sent_text().is_empty());
}

#[tokio::test]
async fn client_mode_acks_the_delivery_by_ack_id() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Client);
    sub.subscribe(None).await.unwrap();
    transport.clear_sent();

    let mut rx = sub.message_stream();
    transport.inject_text(
        "MESSAGE\ndestination:/q\nmessage-id:1\nsubscription:ABC\nack:ack-1\n\nhello\0",
    );
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    settle().await;
    assert_eq!(
        transport.last_sent_text().unwrap(),
        "ACK\nid:ack-1\ncontent-length:0\n\n\0"
    );
}

#[tokio::test]
async fn failed_handler_nacks_and_withholds_the_delivery() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Client);
    sub.set_response_handler(Box::new(|_frame| Err("handler refused".into())));
    sub.subscribe(None).await.unwrap();
    transport.clear_sent();

    let mut rx = sub.message_stream();
    transport.inject_text(
        "MESSAGE\ndestination:/q\nmessage-id:1\nsubscription:ABC\nack:ack-1\n\nhello\0",
    );
    settle().await;
    assert_eq!(
        transport.last_sent_text().unwrap(),
        "NACK\nid:ack-1\ncontent-length:0\n\n\0"
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn delivery_without_ack_header_passes_through_unacked() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Client);
    sub.subscribe(None).await.unwrap();
    transport.clear_sent();

    let mut rx = sub.message_stream();
    transport.inject_text("MESSAGE\ndestination:/q\nmessage-id:1\nsubscription:ABC\n\nhello\0");
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(transport.sent_text().is_empty());
}

#[tokio::test]
async fn legacy_client_mode_acks_by_message_id() {
    let transport = MockTransport::open();
    let connection = Connection::v10("c1", transport.clone());
    establish(&connection, &transport, ConnectConfig::new(), &connected_payload(&[])).await;
    // 1.0 subscription without an explicit id
    let sub = Subscription::new(Arc::new(connection.clone()), "/q", None, AckMode::Client);
    sub.subscribe(None).await.unwrap();
    transport.clear_sent();

    let mut rx = sub.message_stream();
    transport.inject_text("MESSAGE\ndestination:/q\nmessage-id:m-7\n\nhello\0");
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    settle().await;
    assert_eq!(
        transport.last_sent_text().unwrap(),
        "ACK\nmessage-id:m-7\ncontent-length:0\n\n\0"
    );
}

#[tokio::test]
async fn legacy_failed_handler_withholds_the_ack() {
    let transport = MockTransport::open();
    let connection = Connection::v10("c1", transport.clone());
    establish(&connection, &transport, ConnectConfig::new(), &connected_payload(&[])).await;
    let sub = Subscription::new(Arc::new(connection.clone()), "/q", None, AckMode::Client);
    sub.set_response_handler(Box::new(|_frame| Err("handler refused".into())));
    sub.subscribe(None).await.unwrap();
    transport.clear_sent();

    let mut rx = sub.message_stream();
    transport.inject_text("MESSAGE\ndestination:/q\nmessage-id:m-7\n\nhello\0");
    settle().await;
    // 1.0 has no NACK: failure leaves the broker to redeliver
    assert!(transport.sent_text().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn response_handler_sees_every_matching_delivery() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    sub.set_response_handler(Box::new(move |_frame| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    sub.subscribe(None).await.unwrap();

    transport.inject_text("MESSAGE\ndestination:/q\nmessage-id:1\nsubscription:ABC\n\na\0");
    transport.inject_text("MESSAGE\ndestination:/q\nmessage-id:2\nsubscription:XYZ\n\nb\0");
    transport.inject_text("MESSAGE\ndestination:/q\nmessage-id:3\nsubscription:ABC\n\nc\0");
    settle().await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

// ============================================================================
// SEND through the subscription
// ============================================================================

#[tokio::test]
async fn send_through_subscription_injects_the_destination() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    sub.subscribe(None).await.unwrap();
    transport.clear_sent();

    use osmium_stomp::{Frame, FrameType};
    sub.send(Frame::new(FrameType::Send).body("payload")).await.unwrap();
    assert_eq!(
        transport.last_sent_text().unwrap(),
        "SEND\ndestination:/q\ncontent-length:7\n\npayload\0"
    );
}

// ============================================================================
// Cascading teardown
// ============================================================================

#[tokio::test]
async fn connection_loss_forces_unsubscribed() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);
    sub.subscribe(None).await.unwrap();

    let mut status = sub.subscription_status_stream();
    transport.set_status(TransportStatus::Closed);
    let unsubscribed = tokio::time::timeout(
        Duration::from_secs(1),
        status.wait_for(SubscriptionStatus::Unsubscribed),
    )
    .await
    .unwrap();
    assert!(unsubscribed);
}

#[tokio::test]
async fn never_subscribed_subscription_survives_connection_loss() {
    let transport = MockTransport::open();
    let connection = connected_v12(&transport).await;
    let sub = subscription(&connection, AckMode::Auto);

    transport.set_status(TransportStatus::Closed);
    settle().await;
    assert_eq!(sub.subscription_status(), SubscriptionStatus::Uninitialized);
}
