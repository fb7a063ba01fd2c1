//! MQTT transport binding (rumqttc)
//!
//! The lightweight pub/sub binding. One session wraps one rumqttc client and
//! its event loop task; broker resources share the session's client, since
//! MQTT has no channel concept - a resource is the implicit subscription set.
//! Deliveries are protocol-acknowledged, so they carry no ack handle.

use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, Event, MqttOptions};
use rumqttc::{TlsConfiguration, Transport as SocketTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::protocol::address::Dialect;
use crate::transport::{filter_matches, Delivery, Qos, Resource, Session, Transport};

/// Timeout for the broker's connection acknowledgement.
const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivery stream depth between the event loop and a consumer's forwarder.
const DELIVERY_BUFFER: usize = 16;

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Builds rumqttc options from the client configuration.
fn configure_mqtt_options(config: &ClientConfig) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&config.endpoint)
        .map_err(|_| TransportError::Connect(format!("invalid broker URL {}", config.endpoint)))?;

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::Connect(format!("invalid broker URL {}", config.endpoint)))?;
    let tls = url.scheme() == "mqtts" || url.scheme() == "ssl";
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    // Unique client ID per session so a reconnect never races its own
    // half-closed predecessor on the broker.
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let client_id = format!("{}-{timestamp}", config.client_id_prefix);
    let mut options = MqttOptions::new(client_id, host, port);

    if tls {
        let transport = match &config.tls_root_cert {
            Some(path) => {
                let ca = std::fs::read(path).map_err(|e| {
                    TransportError::Connect(format!("reading TLS root cert failed: {e}"))
                })?;
                SocketTransport::tls_with_config(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                })
            }
            None => SocketTransport::tls_with_default_config(),
        };
        options.set_transport(transport);
    }

    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }

    options.set_keep_alive(config.keep_alive());
    options.set_clean_start(config.clean_session);

    Ok(options)
}

/// MQTT transport over rumqttc.
#[derive(Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        MqttTransport
    }
}

type SubscriberMap = Arc<Mutex<HashMap<String, mpsc::Sender<Delivery>>>>;

#[async_trait]
impl Transport for MqttTransport {
    fn dialect(&self) -> Dialect {
        Dialect::Mqtt
    }

    async fn dial(&self, config: &ClientConfig) -> Result<Arc<dyn Session>, TransportError> {
        let options = configure_mqtt_options(config)?;
        let (client, mut event_loop) = AsyncClient::new(options, 10);

        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        let (close_tx, close_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let closing = Arc::new(AtomicBool::new(false));

        let loop_subscribers = subscribers.clone();
        let loop_closing = closing.clone();
        tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            if let Some(ready_tx) = ready.take() {
                                let _ = ready_tx.send(Ok(()));
                            }
                        } else if let Some(ready_tx) = ready.take() {
                            let _ = ready_tx.send(Err(TransportError::Connect(format!(
                                "broker refused connection: {:?}",
                                ack.code
                            ))));
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic).to_string();
                        let targets: Vec<mpsc::Sender<Delivery>> = {
                            let subs = loop_subscribers.lock().await;
                            subs.iter()
                                .filter(|(filter, _)| {
                                    filter_matches(filter, &topic, Dialect::Mqtt)
                                })
                                .map(|(_, sender)| sender.clone())
                                .collect()
                        };
                        for sender in targets {
                            let delivery = Delivery {
                                topic: topic.clone(),
                                payload: publish.payload.to_vec(),
                                ack: None,
                            };
                            if sender.send(delivery).await.is_err() {
                                debug!(topic = %topic, "delivery stream closed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        let _ = close_tx
                            .try_send(TransportError::ConnectionLost(
                                "broker disconnected".to_string(),
                            ));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if let Some(ready_tx) = ready.take() {
                            let _ = ready_tx.send(Err(TransportError::Connect(err.to_string())));
                        } else if !loop_closing.load(Ordering::SeqCst) {
                            let _ = close_tx
                                .try_send(TransportError::ConnectionLost(err.to_string()));
                        }
                        break;
                    }
                }
            }
            debug!("mqtt event loop ended");
        });

        // Success means an actual ConnAck, not just an opened socket.
        match tokio::time::timeout(CONNACK_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Err(_)) => {
                return Err(TransportError::Connect("event loop ended early".to_string()))
            }
            Err(_) => {
                return Err(TransportError::Connect(
                    "timed out waiting for connection acknowledgement".to_string(),
                ))
            }
        }

        Ok(Arc::new(MqttSession {
            client,
            subscribers,
            close_rx: std::sync::Mutex::new(Some(close_rx)),
            closing,
        }))
    }
}

pub struct MqttSession {
    client: AsyncClient,
    subscribers: SubscriberMap,
    close_rx: std::sync::Mutex<Option<mpsc::Receiver<TransportError>>>,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl Session for MqttSession {
    async fn open_resource(&self) -> Result<Arc<dyn Resource>, TransportError> {
        // MQTT has no broker-side channel: a resource shares the session's
        // client and the subscription set is the resource state.
        Ok(Arc::new(MqttResource {
            client: self.client.clone(),
            subscribers: self.subscribers.clone(),
        }))
    }

    fn notify_close(&self) -> mpsc::Receiver<TransportError> {
        match self.close_rx.lock() {
            Ok(mut slot) => slot.take().unwrap_or_else(ended_receiver),
            Err(_) => ended_receiver(),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        // A failed disconnect means the event loop is already gone, which is
        // the state close is after anyway.
        if let Err(err) = self.client.disconnect().await {
            debug!(error = %err, "mqtt disconnect after event loop ended");
        }
        Ok(())
    }
}

fn ended_receiver() -> mpsc::Receiver<TransportError> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}

pub struct MqttResource {
    client: AsyncClient,
    subscribers: SubscriberMap,
}

#[async_trait]
impl Resource for MqttResource {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        let (sender, receiver) = mpsc::channel(DELIVERY_BUFFER);
        self.subscribers
            .lock()
            .await
            .insert(filter.to_string(), sender);
        if let Err(err) = self.client.subscribe(filter, qos.into()).await {
            self.subscribers.lock().await.remove(filter);
            return Err(TransportError::Subscribe(err.to_string()));
        }
        debug!(filter = %filter, "mqtt subscription registered");
        Ok(receiver)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscribers.lock().await.remove(filter);
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Nothing broker-side to tear down; subscriptions die with the
        // session or via explicit unsubscribes.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ClientConfig {
        ClientConfig::new("mqtt://localhost:1883")
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options(&test_config());
        assert!(options.is_ok());
    }

    #[test]
    fn test_invalid_broker_url_rejected() {
        let config = ClientConfig::new("not a url");
        let result = configure_mqtt_options(&config);
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[test]
    fn test_url_without_host_rejected() {
        // No authority component at all: scheme-relative path only
        let config = ClientConfig::new("mqtt:localhost");
        let result = configure_mqtt_options(&config);
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[test]
    fn test_missing_tls_root_cert_rejected() {
        let mut config = ClientConfig::new("mqtts://broker.example.com");
        config.tls_root_cert = Some("/nonexistent/ca.pem".into());
        let result = configure_mqtt_options(&config);
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(QoS::from(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(QoS::from(Qos::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn test_dialect_is_mqtt() {
        assert_eq!(MqttTransport::new().dialect(), Dialect::Mqtt);
    }
}
