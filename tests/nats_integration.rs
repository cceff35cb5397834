//! NATS integration tests
//!
//! These tests require a running NATS server with JetStream enabled:
//!   nats-server -js
//!
//! Tests are skipped automatically if NATS is not available. The server
//! URL can be overridden with `NATS_PUBSUB_TEST_URL`.

use nats_pubsub::{
    JetStreamConfig, Message, Publisher, PublisherConfig, Subscriber, SubscriberConfig,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_url() -> String {
    std::env::var("NATS_PUBSUB_TEST_URL")
        .unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string())
}

/// Try to reach the server. Returns false (and skips the test) when it
/// is not running.
async fn nats_available() -> bool {
    match async_nats::connect(test_url()).await {
        Ok(_) => true,
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            false
        }
    }
}

fn unique_topic(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn core_echo_round_trip() {
    if !nats_available().await {
        return;
    }

    let topic = unique_topic("echo");

    let subscriber = Subscriber::connect(SubscriberConfig {
        url: test_url(),
        ..Default::default()
    })
    .await
    .unwrap();

    let mut rx = subscriber
        .subscribe(CancellationToken::new(), &topic)
        .await
        .unwrap();

    let publisher = Publisher::connect(PublisherConfig {
        url: test_url(),
        ..Default::default()
    })
    .await
    .unwrap();

    // Give the server a moment to register the subscription interest.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sent = Message::with_generated_uuid("Hello, world!").with_header("lang", "en");
    let uuid = sent.uuid.clone();
    publisher.publish(&topic, &[sent]).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within timeout")
        .expect("channel open");
    assert_eq!(received.uuid, uuid);
    assert_eq!(received.payload.as_ref(), b"Hello, world!");
    assert_eq!(received.headers["lang"], "en");

    // Core frames have no reply subject; the ack is a local no-op.
    received.ack();

    subscriber.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn jetstream_auto_provision_and_ack() {
    if !nats_available().await {
        return;
    }

    let topic = unique_topic("js_ack");
    let jet_stream = JetStreamConfig {
        enabled: true,
        auto_provision: true,
        domain: None,
    };

    let subscriber = Subscriber::connect(SubscriberConfig {
        url: test_url(),
        queue_group: "workers".to_string(),
        ack_wait_timeout: Duration::from_secs(5),
        jet_stream: jet_stream.clone(),
        ..Default::default()
    })
    .await
    .unwrap();

    let mut rx = subscriber
        .subscribe(CancellationToken::new(), &topic)
        .await
        .unwrap();

    let publisher = Publisher::connect(PublisherConfig {
        url: test_url(),
        jet_stream,
        ..Default::default()
    })
    .await
    .unwrap();

    let sent = Message::with_generated_uuid("persisted");
    let uuid = sent.uuid.clone();
    publisher.publish(&topic, &[sent]).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within timeout")
        .expect("channel open");
    assert_eq!(received.uuid, uuid);
    assert!(received.ack());

    // An acked message must not come back within the ack-wait window.
    let redelivery = tokio::time::timeout(Duration::from_secs(6), rx.recv()).await;
    assert!(redelivery.is_err(), "acked message was redelivered");

    subscriber.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn jetstream_nack_triggers_redelivery() {
    if !nats_available().await {
        return;
    }

    let topic = unique_topic("js_nak");
    let jet_stream = JetStreamConfig {
        enabled: true,
        auto_provision: true,
        domain: None,
    };

    let subscriber = Subscriber::connect(SubscriberConfig {
        url: test_url(),
        queue_group: "retriers".to_string(),
        ack_wait_timeout: Duration::from_secs(10),
        jet_stream: jet_stream.clone(),
        ..Default::default()
    })
    .await
    .unwrap();

    let mut rx = subscriber
        .subscribe(CancellationToken::new(), &topic)
        .await
        .unwrap();

    let publisher = Publisher::connect(PublisherConfig {
        url: test_url(),
        jet_stream,
        ..Default::default()
    })
    .await
    .unwrap();

    let sent = Message::with_generated_uuid("try again");
    let uuid = sent.uuid.clone();
    publisher.publish(&topic, &[sent]).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first delivery within timeout")
        .expect("channel open");
    assert_eq!(first.uuid, uuid);
    assert!(first.nack());

    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("redelivery within timeout")
        .expect("channel open");
    assert_eq!(second.uuid, uuid);
    assert!(second.ack());

    subscriber.close().await.unwrap();
    publisher.close().await.unwrap();
}
