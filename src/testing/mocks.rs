//! Mock transport for testing
//!
//! An in-memory broker implementing the transport SDK boundary, with fault
//! injection for the failure modes the client must survive: refused dials
//! (`fail_dials`) and unsolicited connection loss (`drop_connections`).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::protocol::address::Dialect;
use crate::transport::{filter_matches, AckHandle, Delivery, Qos, Resource, Session, Transport};

type PublishedMessage = (String, Vec<u8>);

#[derive(Default)]
struct BrokerState {
    fail_dials: u32,
    dial_count: usize,
    next_session: u64,
    /// Close-notifier senders for live sessions.
    sessions: HashMap<u64, mpsc::Sender<TransportError>>,
    subscriptions: Vec<MockSubscription>,
    published: Vec<PublishedMessage>,
    /// Every `subscribe` call, in order: (session, filter).
    subscribe_log: Vec<(u64, String)>,
}

struct MockSubscription {
    session: u64,
    filter: String,
    sender: mpsc::Sender<Delivery>,
}

/// In-memory broker shared by every transport, session, and resource handle.
pub struct MockBroker {
    dialect: Dialect,
    state: Mutex<BrokerState>,
    acked: Arc<AtomicUsize>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Self::with_dialect(Dialect::Amqp)
    }

    pub fn with_dialect(dialect: Dialect) -> Arc<Self> {
        Arc::new(MockBroker {
            dialect,
            state: Mutex::new(BrokerState::default()),
            acked: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Makes the next `count` dial attempts fail.
    pub async fn fail_dials(&self, count: u32) {
        self.state.lock().await.fail_dials = count;
    }

    pub async fn dial_count(&self) -> usize {
        self.state.lock().await.dial_count
    }

    /// Simulates an unsolicited connection loss: every live session receives
    /// the close cause and all of its broker-side state is discarded.
    pub async fn drop_connections(&self, cause: &str) {
        let mut state = self.state.lock().await;
        for sender in state.sessions.values() {
            let _ = sender.try_send(TransportError::ConnectionLost(cause.to_string()));
        }
        state.sessions.clear();
        state.subscriptions.clear();
    }

    /// Messages accepted for publication, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    /// Filters with a live subscription.
    pub async fn subscribed_filters(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .iter()
            .map(|sub| sub.filter.clone())
            .collect()
    }

    /// Subscribe calls per filter for the given session.
    pub async fn subscribe_counts(&self, session: u64) -> HashMap<String, usize> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for (logged_session, filter) in &state.subscribe_log {
            if *logged_session == session {
                *counts.entry(filter.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// IDs of sessions currently live.
    pub async fn live_sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().await.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of deliveries acknowledged by consumers.
    pub async fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    /// Routes a message to matching live subscriptions, as a publish from
    /// outside the client under test.
    pub async fn inject(&self, topic: &str, payload: Vec<u8>) {
        let targets: Vec<mpsc::Sender<Delivery>> = {
            let state = self.state.lock().await;
            state
                .subscriptions
                .iter()
                .filter(|sub| {
                    state.sessions.contains_key(&sub.session)
                        && filter_matches(&sub.filter, topic, self.dialect)
                })
                .map(|sub| sub.sender.clone())
                .collect()
        };
        for sender in targets {
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.clone(),
                ack: Some(Box::new(MockAck {
                    acked: self.acked.clone(),
                })),
            };
            let _ = sender.send(delivery).await;
        }
    }

    async fn route(&self, topic: &str, payload: Vec<u8>) {
        self.state
            .lock()
            .await
            .published
            .push((topic.to_string(), payload.clone()));
        self.inject(topic, payload).await;
    }
}

struct MockAck {
    acked: Arc<AtomicUsize>,
}

#[async_trait]
impl AckHandle for MockAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport handle over a shared [`MockBroker`].
pub struct MockTransport {
    broker: Arc<MockBroker>,
}

impl MockTransport {
    pub fn new(broker: Arc<MockBroker>) -> Self {
        MockTransport { broker }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn dialect(&self) -> Dialect {
        self.broker.dialect
    }

    async fn dial(&self, _config: &ClientConfig) -> Result<Arc<dyn Session>, TransportError> {
        let mut state = self.broker.state.lock().await;
        state.dial_count += 1;
        if state.fail_dials > 0 {
            state.fail_dials -= 1;
            return Err(TransportError::Connect("mock dial refused".to_string()));
        }
        let id = state.next_session;
        state.next_session += 1;
        let (close_tx, close_rx) = mpsc::channel(1);
        state.sessions.insert(id, close_tx);
        Ok(Arc::new(MockSession {
            id,
            broker: self.broker.clone(),
            close_rx: std::sync::Mutex::new(Some(close_rx)),
        }))
    }
}

pub struct MockSession {
    id: u64,
    broker: Arc<MockBroker>,
    close_rx: std::sync::Mutex<Option<mpsc::Receiver<TransportError>>>,
}

/// A receiver whose sender is already gone: recv ends immediately.
fn closed_receiver() -> mpsc::Receiver<TransportError> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}

impl MockSession {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open_resource(&self) -> Result<Arc<dyn Resource>, TransportError> {
        let state = self.broker.state.lock().await;
        if !state.sessions.contains_key(&self.id) {
            return Err(TransportError::OpenResource("session gone".to_string()));
        }
        Ok(Arc::new(MockResource {
            session: self.id,
            broker: self.broker.clone(),
        }))
    }

    fn notify_close(&self) -> mpsc::Receiver<TransportError> {
        match self.close_rx.lock() {
            Ok(mut slot) => slot.take().unwrap_or_else(closed_receiver),
            Err(_) => closed_receiver(),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        state.sessions.remove(&self.id);
        state.subscriptions.retain(|sub| sub.session != self.id);
        Ok(())
    }
}

pub struct MockResource {
    session: u64,
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Resource for MockResource {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _qos: Qos,
    ) -> Result<(), TransportError> {
        {
            let state = self.broker.state.lock().await;
            if !state.sessions.contains_key(&self.session) {
                return Err(TransportError::Publish("session gone".to_string()));
            }
        }
        self.broker.route(topic, payload).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: Qos,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        let mut state = self.broker.state.lock().await;
        if !state.sessions.contains_key(&self.session) {
            return Err(TransportError::Subscribe("session gone".to_string()));
        }
        let (sender, receiver) = mpsc::channel(16);
        state.subscriptions.push(MockSubscription {
            session: self.session,
            filter: filter.to_string(),
            sender,
        });
        state.subscribe_log.push((self.session, filter.to_string()));
        Ok(receiver)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        state
            .subscriptions
            .retain(|sub| !(sub.session == self.session && sub.filter == filter));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        state.subscriptions.retain(|sub| sub.session != self.session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_and_fault_injection() {
        let broker = MockBroker::new();
        broker.fail_dials(1).await;
        let transport = MockTransport::new(broker.clone());
        let config = ClientConfig::new("mock://broker");

        assert!(transport.dial(&config).await.is_err());
        assert!(transport.dial(&config).await.is_ok());
        assert_eq!(broker.dial_count().await, 2);
    }

    #[tokio::test]
    async fn test_publish_routes_to_matching_subscription() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker.clone());
        let config = ClientConfig::new("mock://broker");
        let session = transport.dial(&config).await.unwrap();
        let resource = session.open_resource().await.unwrap();

        let mut deliveries = resource
            .subscribe("app.devices.*.up", Qos::AtLeastOnce)
            .await
            .unwrap();
        resource
            .publish("app.devices.test.up", vec![1, 8], Qos::AtLeastOnce)
            .await
            .unwrap();

        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.topic, "app.devices.test.up");
        assert_eq!(delivery.payload, vec![1, 8]);
    }

    #[tokio::test]
    async fn test_drop_connections_notifies_and_clears() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker.clone());
        let config = ClientConfig::new("mock://broker");
        let session = transport.dial(&config).await.unwrap();
        let mut close_rx = session.notify_close();

        broker.drop_connections("link reset").await;
        let cause = close_rx.recv().await.unwrap();
        assert!(matches!(cause, TransportError::ConnectionLost(_)));
        assert!(broker.live_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_graceful_close_ends_notifier_without_cause() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker.clone());
        let config = ClientConfig::new("mock://broker");
        let session = transport.dial(&config).await.unwrap();
        let mut close_rx = session.notify_close();

        session.close().await.unwrap();
        // Sender dropped with the session entry: stream ends with no cause
        assert!(close_rx.recv().await.is_none());
    }
}
