//! AMQP transport binding (lapin)
//!
//! The queue/exchange binding. One session wraps one AMQP connection; each
//! broker resource is a channel with the configured prefetch window applied.
//! Subscriptions declare an ephemeral server-named queue, bind it to the
//! topic exchange under the filter routing key, and consume from it.
//! Deliveries carry an ack handle; the dispatch loop acknowledges after the
//! handler returns.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::protocol::address::Dialect;
use crate::transport::{AckHandle, Delivery, Qos, Resource, Session, Transport};

/// Delivery stream depth between a consumer task and its forwarder.
const DELIVERY_BUFFER: usize = 16;

/// AMQP transport over lapin.
#[derive(Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        AmqpTransport
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn dialect(&self) -> Dialect {
        Dialect::Amqp
    }

    async fn dial(&self, config: &ClientConfig) -> Result<Arc<dyn Session>, TransportError> {
        let connection = Connection::connect(&config.endpoint, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (close_tx, close_rx) = mpsc::channel(1);
        let closing = Arc::new(AtomicBool::new(false));
        let error_closing = closing.clone();
        connection.on_error(move |err| {
            if error_closing.load(Ordering::SeqCst) {
                return;
            }
            let _ = close_tx.try_send(TransportError::ConnectionLost(err.to_string()));
        });

        debug!(endpoint = %config.endpoint, "amqp connection established");
        Ok(Arc::new(AmqpSession {
            connection,
            exchange: config.exchange.clone(),
            prefetch_count: config.prefetch_count,
            close_rx: std::sync::Mutex::new(Some(close_rx)),
            closing,
        }))
    }
}

pub struct AmqpSession {
    connection: Connection,
    exchange: String,
    prefetch_count: u16,
    close_rx: std::sync::Mutex<Option<mpsc::Receiver<TransportError>>>,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl Session for AmqpSession {
    async fn open_resource(&self) -> Result<Arc<dyn Resource>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::OpenResource(e.to_string()))?;
        if self.prefetch_count > 0 {
            channel
                .basic_qos(self.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| TransportError::OpenResource(e.to_string()))?;
        }
        Ok(Arc::new(AmqpResource {
            channel,
            exchange: self.exchange.clone(),
            consumers: Mutex::new(HashMap::new()),
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
        if let Err(err) = self.connection.close(200, "client disconnect").await {
            debug!(error = %err, "amqp connection close after loss");
        }
        Ok(())
    }
}

fn ended_receiver() -> mpsc::Receiver<TransportError> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}

struct ConsumerEntry {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<()>,
}

pub struct AmqpResource {
    channel: Channel,
    exchange: String,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
}

#[async_trait]
impl Resource for AmqpResource {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _qos: Qos,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_publish(
                &self.exchange,
                topic,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: Qos,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        // Ephemeral server-named queue bound to the topic exchange under the
        // filter routing key.
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        let queue_name = queue.name().as_str().to_string();

        self.channel
            .queue_bind(
                &queue_name,
                &self.exchange,
                filter,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let consumer_tag = format!("lorabus-{queue_name}");
        let mut consumer = self
            .channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let (sender, receiver) = mpsc::channel(DELIVERY_BUFFER);
        let consumed_filter = filter.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let envelope = Delivery {
                            topic: delivery.routing_key.as_str().to_string(),
                            payload: delivery.data,
                            ack: Some(Box::new(AmqpAck {
                                acker: delivery.acker,
                            })),
                        };
                        if sender.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(filter = %consumed_filter, error = %err, "amqp consumer failed");
                        break;
                    }
                }
            }
            debug!(filter = %consumed_filter, "amqp consumer task ended");
        });

        self.consumers.lock().await.insert(
            filter.to_string(),
            ConsumerEntry {
                queue: queue_name,
                consumer_tag,
                task,
            },
        );
        debug!(filter = %filter, "amqp subscription registered");
        Ok(receiver)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let entry = self.consumers.lock().await.remove(filter);
        let Some(entry) = entry else {
            return Ok(());
        };
        self.channel
            .basic_cancel(&entry.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))?;
        self.channel
            .queue_unbind(&entry.queue, &self.exchange, filter, FieldTable::default())
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))?;
        entry.task.abort();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let consumers: Vec<ConsumerEntry> = {
            let mut map = self.consumers.lock().await;
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in consumers {
            entry.task.abort();
        }
        if let Err(err) = self.channel.close(200, "resource closed").await {
            // The channel dies with its connection on an unsolicited close;
            // tearing down a stale resource is not an error.
            warn!(error = %err, "amqp channel close failed");
        }
        Ok(())
    }
}

struct AmqpAck {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl AckHandle for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_is_amqp() {
        assert_eq!(AmqpTransport::new().dialect(), Dialect::Amqp);
    }

    #[test]
    fn test_default_exchange_comes_from_config() {
        let config = ClientConfig::new("amqp://localhost:5672/%2f");
        assert_eq!(config.exchange, "amq.topic");
    }
}
