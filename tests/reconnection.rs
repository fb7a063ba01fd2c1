//! Reconnection and re-binding integration tests
//!
//! Exercises the recovery guarantees against the in-memory mock broker:
//! - consumers are re-applied exactly once per reconnection
//! - a publish after recovery reaches exactly one handler invocation
//! - connect/disconnect are idempotent

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lorabus::testing::mocks::{MockBroker, MockTransport};
use lorabus::protocol::UplinkMessage;
use lorabus::{ClientConfig, ConnectionManager, Publisher, Subscriber};

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("mock://broker");
    config.connect_retries = 3;
    config.retry_delay_ms = 10;
    config
}

fn manager(broker: &Arc<MockBroker>) -> ConnectionManager {
    ConnectionManager::new(Arc::new(MockTransport::new(broker.clone())), test_config())
}

/// Waits until a fresh dial happened and rebinding finished. The connected
/// state is only re-published after every binder has been rebound, so the
/// pair of conditions brackets a full recovery cycle.
async fn wait_for_recovery(
    broker: &Arc<MockBroker>,
    client: &ConnectionManager,
    prior_dials: usize,
) {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if broker.dial_count().await > prior_dials && client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("recovery within bound");
}

#[tokio::test]
async fn test_reconnection_reapplies_each_consumer_exactly_once() {
    // Arrange: three consumers on distinct device scopes
    let broker = MockBroker::new();
    let client = manager(&broker);
    client.connect().await.unwrap();
    let subscriber = Subscriber::open(&client).await.unwrap();

    let counters: Vec<Arc<AtomicUsize>> =
        (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for (index, counter) in counters.iter().enumerate() {
        let seen = counter.clone();
        let dev = format!("dev-{index}");
        let token = subscriber.subscribe_uplink(Some("app"), Some(&dev), move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(token.wait().await.is_none());
    }

    // Act: unsolicited close, then recovery
    let prior_dials = broker.dial_count().await;
    broker.drop_connections("link reset").await;
    wait_for_recovery(&broker, &client, prior_dials).await;

    // Assert: the fresh session saw exactly one subscribe per filter
    let sessions = broker.live_sessions().await;
    assert_eq!(sessions.len(), 1);
    let counts = broker.subscribe_counts(sessions[0]).await;
    assert_eq!(counts.len(), 3);
    for (filter, count) in counts {
        assert_eq!(count, 1, "filter {filter} re-applied once");
    }

    // Assert: a publish matching one consumer reaches exactly one handler
    let publisher = Publisher::open(&client).await.unwrap();
    let uplink = UplinkMessage {
        app_id: "app".to_string(),
        dev_id: "dev-1".to_string(),
        payload_raw: vec![0x2a],
        ..Default::default()
    };
    assert!(publisher.publish_uplink(&uplink).wait().await.is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(counters[0].load(Ordering::SeqCst), 0);
    assert_eq!(counters[1].load(Ordering::SeqCst), 1, "no duplicates, no loss");
    assert_eq!(counters[2].load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_consumer_survives_multiple_reconnects() {
    let broker = MockBroker::new();
    let client = manager(&broker);
    client.connect().await.unwrap();
    let subscriber = Subscriber::open(&client).await.unwrap();
    let publisher = Publisher::open(&client).await.unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let seen = received.clone();
    subscriber
        .subscribe_uplink(Some("app"), None, move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .wait()
        .await;

    for round in 1..=3 {
        let prior_dials = broker.dial_count().await;
        broker.drop_connections("flap").await;
        wait_for_recovery(&broker, &client, prior_dials).await;

        let uplink = UplinkMessage {
            app_id: "app".to_string(),
            dev_id: "test".to_string(),
            counter: round,
            ..Default::default()
        };
        assert!(publisher.publish_uplink(&uplink).wait().await.is_none());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(received.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_connect_is_idempotent_and_reuses_session() {
    let broker = MockBroker::new();
    let client = manager(&broker);

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    client.connect().await.unwrap();

    assert_eq!(broker.dial_count().await, 1);
    assert_eq!(broker.live_sessions().await.len(), 1);
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_stops_recovery() {
    let broker = MockBroker::new();
    let client = manager(&broker);

    // No-op before connect
    client.disconnect().await.unwrap();

    client.connect().await.unwrap();
    let subscriber = Subscriber::open(&client).await.unwrap();
    subscriber
        .subscribe_uplink(Some("app"), None, |_, _, _| {})
        .wait()
        .await;

    client.disconnect().await.unwrap();
    client.disconnect().await.unwrap();

    assert!(!client.is_connected());
    assert!(broker.live_sessions().await.is_empty());

    // A graceful disconnect must not trigger the reconnect path
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!client.is_connected());
    assert_eq!(broker.dial_count().await, 1);
}

#[tokio::test]
async fn test_new_binder_opens_once_recovery_completes() {
    // Opening a binder during a reconnect storm either waits on the registry
    // lock or fails fast on the stale session; within a bounded window after
    // the drop it must succeed again.
    let broker = MockBroker::new();
    let client = manager(&broker);
    client.connect().await.unwrap();
    let subscriber = Subscriber::open(&client).await.unwrap();
    subscriber
        .subscribe_uplink(Some("app"), None, |_, _, _| {})
        .wait()
        .await;

    broker.drop_connections("link reset").await;
    let publisher = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match Publisher::open(&client).await {
                Ok(publisher) => break publisher,
                Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await
    .expect("binder opens after recovery");

    let uplink = UplinkMessage {
        app_id: "app".to_string(),
        dev_id: "test".to_string(),
        ..Default::default()
    };
    assert!(publisher.publish_uplink(&uplink).wait().await.is_none());
}
