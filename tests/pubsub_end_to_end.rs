//! End-to-end publish/subscribe scenarios against the mock broker

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use lorabus::testing::mocks::{MockBroker, MockTransport};
use lorabus::protocol::{
    Activation, ApplicationEvent, DownlinkMessage, ScheduleMode, UplinkMessage,
};
use lorabus::{ClientConfig, ConnectionManager, Publisher, Subscriber};

async fn connected(broker: &Arc<MockBroker>) -> (ConnectionManager, Publisher, Subscriber) {
    let mut config = ClientConfig::new("mock://broker");
    config.retry_delay_ms = 10;
    let client = ConnectionManager::new(Arc::new(MockTransport::new(broker.clone())), config);
    client.connect().await.unwrap();
    let publisher = Publisher::open(&client).await.unwrap();
    let subscriber = Subscriber::open(&client).await.unwrap();
    (client, publisher, subscriber)
}

#[tokio::test]
async fn test_wildcard_subscription_receives_uplink() {
    // Arrange: subscribe on the wildcard device-uplink address for one app
    let broker = MockBroker::new();
    let (_client, publisher, subscriber) = connected(&broker).await;

    let (tx, mut rx) = mpsc::channel(1);
    let token = subscriber.subscribe_uplink(Some("app"), None, move |app_id, dev_id, uplink| {
        let _ = tx.try_send((app_id.to_string(), dev_id.to_string(), uplink));
    });
    assert!(token.wait().await.is_none());

    // Act: publish an uplink for a concrete device
    let uplink = UplinkMessage {
        app_id: "app".to_string(),
        dev_id: "test".to_string(),
        payload_raw: vec![0x01, 0x08],
        ..Default::default()
    };
    assert!(publisher.publish_uplink(&uplink).wait().await.is_none());

    // Assert: handler sees the concrete IDs and payload within the bound
    let (app_id, dev_id, received) = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("delivery within 200ms")
        .expect("handler invoked");
    assert_eq!(app_id, "app");
    assert_eq!(dev_id, "test");
    assert_eq!(received.payload_raw, vec![0x01, 0x08]);
}

#[tokio::test]
async fn test_unmatched_scope_is_not_delivered() {
    let broker = MockBroker::new();
    let (_client, publisher, subscriber) = connected(&broker).await;

    let (tx, mut rx) = mpsc::channel(1);
    subscriber
        .subscribe_uplink(Some("app"), None, move |_, _, uplink| {
            let _ = tx.try_send(uplink);
        })
        .wait()
        .await;

    let foreign = UplinkMessage {
        app_id: "other".to_string(),
        dev_id: "test".to_string(),
        payload_raw: vec![0xff],
        ..Default::default()
    };
    assert!(publisher.publish_uplink(&foreign).wait().await.is_none());

    let outcome = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(outcome.is_err(), "no delivery for a foreign app scope");
}

#[tokio::test]
async fn test_downlink_round_trip_preserves_schedule() {
    let broker = MockBroker::new();
    let (_client, publisher, subscriber) = connected(&broker).await;

    let (tx, mut rx) = mpsc::channel(1);
    subscriber
        .subscribe_downlink(Some("app"), Some("test"), move |_, _, downlink| {
            let _ = tx.try_send(downlink);
        })
        .wait()
        .await;

    let downlink = DownlinkMessage {
        app_id: "app".to_string(),
        dev_id: "test".to_string(),
        port: 2,
        confirmed: true,
        schedule: ScheduleMode::First,
        payload_raw: vec![0xca, 0xfe],
        ..Default::default()
    };
    assert!(publisher.publish_downlink(&downlink).wait().await.is_none());

    let received = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.schedule, ScheduleMode::First);
    assert_eq!(received.payload_raw, vec![0xca, 0xfe]);
    assert!(received.confirmed);
}

#[tokio::test]
async fn test_activation_and_app_event_streams() {
    let broker = MockBroker::new();
    let (_client, publisher, subscriber) = connected(&broker).await;

    let (activation_tx, mut activation_rx) = mpsc::channel(1);
    subscriber
        .subscribe_activations(None, None, move |app_id, dev_id, activation| {
            let _ = activation_tx.try_send((app_id.to_string(), dev_id.to_string(), activation));
        })
        .wait()
        .await;

    let (event_tx, mut event_rx) = mpsc::channel(1);
    subscriber
        .subscribe_app_events(Some("app"), None, move |_, event| {
            let _ = event_tx.try_send(event);
        })
        .wait()
        .await;

    let activation = Activation {
        app_id: "app".to_string(),
        dev_id: "test".to_string(),
        dev_addr: "26001f00".to_string(),
        ..Default::default()
    };
    assert!(publisher
        .publish_activation(&activation)
        .wait()
        .await
        .is_none());

    let event = ApplicationEvent {
        app_id: "app".to_string(),
        event: "create".to_string(),
        data: serde_json::json!({"name": "my-app"}),
    };
    assert!(publisher.publish_app_event(&event).wait().await.is_none());

    let (app_id, dev_id, received) =
        tokio::time::timeout(Duration::from_millis(200), activation_rx.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(app_id, "app");
    assert_eq!(dev_id, "test");
    assert_eq!(received.dev_addr, "26001f00");

    let received = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.event, "create");
    assert_eq!(received.data["name"], "my-app");
}

#[tokio::test]
async fn test_unsubscribe_stops_dispatch() {
    let broker = MockBroker::new();
    let (_client, publisher, subscriber) = connected(&broker).await;

    let (tx, mut rx) = mpsc::channel(4);
    subscriber
        .subscribe_uplink(Some("app"), Some("test"), move |_, _, uplink| {
            let _ = tx.try_send(uplink);
        })
        .wait()
        .await;

    let uplink = UplinkMessage {
        app_id: "app".to_string(),
        dev_id: "test".to_string(),
        counter: 1,
        ..Default::default()
    };
    assert!(publisher.publish_uplink(&uplink).wait().await.is_none());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_ok()
    );

    let token = subscriber.unsubscribe_uplink(Some("app"), Some("test"));
    assert!(token.wait().await.is_none());
    assert!(broker.subscribed_filters().await.is_empty());

    assert!(publisher.publish_uplink(&uplink).wait().await.is_none());
    let outcome = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    match outcome {
        Ok(None) | Err(_) => {}
        Ok(Some(_)) => panic!("delivery after unsubscribe"),
    }
}

#[tokio::test]
async fn test_deliveries_acknowledged_after_handler() {
    let broker = MockBroker::new();
    let (_client, publisher, subscriber) = connected(&broker).await;

    subscriber
        .subscribe_uplink(Some("app"), None, |_, _, _| {})
        .wait()
        .await;

    let uplink = UplinkMessage {
        app_id: "app".to_string(),
        dev_id: "test".to_string(),
        ..Default::default()
    };
    assert!(publisher.publish_uplink(&uplink).wait().await.is_none());

    tokio::time::timeout(Duration::from_millis(500), async {
        while broker.acked().await < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("delivery acknowledged after handler invocation");
}
