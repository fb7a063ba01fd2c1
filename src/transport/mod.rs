//! Transport SDK boundary
//!
//! The client core talks to brokers exclusively through these traits. A
//! [`Transport`] dials [`Session`]s, a session opens [`Resource`]s (an AMQP
//! channel, or the implicit subscription set of an MQTT connection), and a
//! resource publishes and subscribes. Wire-level protocol details stay behind
//! the bindings in [`mqtt`] and [`amqp`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::protocol::address::{Dialect, MULTI_WILDCARD};

pub mod amqp;
pub mod mqtt;

pub use amqp::AmqpTransport;
pub use mqtt::MqttTransport;

/// Delivery-guarantee level negotiated per publish/subscribe operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

/// One inbound message handed to a consumer.
///
/// `ack` is present when the transport requires an explicit acknowledgement
/// (queue/exchange broker); the lightweight pub/sub broker acknowledges at
/// the protocol level and delivers `None`.
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub ack: Option<Box<dyn AckHandle>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("ack", &self.ack.is_some())
            .finish()
    }
}

/// Explicit acknowledgement of one delivery; consumed on use.
#[async_trait]
pub trait AckHandle: Send {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
}

/// A broker client that can dial sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The address dialect this transport renders topics in.
    fn dialect(&self) -> Dialect;

    /// Opens a new session against the configured endpoint.
    async fn dial(&self, config: &ClientConfig) -> Result<Arc<dyn Session>, TransportError>;
}

/// One live broker session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Opens a broker-side resource scoped to this session.
    async fn open_resource(&self) -> Result<Arc<dyn Resource>, TransportError>;

    /// Stream of unsolicited-close causes. Yields at most one cause; a
    /// gracefully closed session ends the stream without a cause. Subsequent
    /// calls return an already-ended stream.
    fn notify_close(&self) -> mpsc::Receiver<TransportError>;

    /// Closes the session. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A broker-side resource bound to one session.
#[async_trait]
pub trait Resource: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> Result<(), TransportError>;

    /// Subscribes to a (possibly wildcarded) filter and returns the delivery
    /// stream for it.
    async fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Closes the resource. Idempotent; safe to call on a resource whose
    /// session is already gone.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Matches a concrete topic against a subscription filter in the given
/// dialect. Single-level wildcards match exactly one segment; the multi-level
/// wildcard matches any remainder (including none) and only terminally.
pub fn filter_matches(filter: &str, topic: &str, dialect: Dialect) -> bool {
    let sep = dialect.separator();
    let single = dialect.single_wildcard();
    let filter_segments: Vec<&str> = filter.split(sep).collect();
    let topic_segments: Vec<&str> = topic.split(sep).collect();

    let mut i = 0;
    for segment in &filter_segments {
        if *segment == MULTI_WILDCARD {
            return true;
        }
        if i >= topic_segments.len() {
            return false;
        }
        if *segment != single && *segment != topic_segments[i] {
            return false;
        }
        i += 1;
    }
    i == topic_segments.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_exact() {
        assert!(filter_matches(
            "app.devices.dev.up",
            "app.devices.dev.up",
            Dialect::Amqp
        ));
        assert!(!filter_matches(
            "app.devices.dev.up",
            "app.devices.dev.down",
            Dialect::Amqp
        ));
    }

    #[test]
    fn test_filter_matches_single_wildcard() {
        assert!(filter_matches(
            "app.devices.*.up",
            "app.devices.dev.up",
            Dialect::Amqp
        ));
        assert!(filter_matches(
            "+/devices/+/up",
            "app/devices/test/up",
            Dialect::Mqtt
        ));
        // A single-level wildcard never spans segments
        assert!(!filter_matches(
            "app.devices.*.up",
            "app.devices.dev.extra.up",
            Dialect::Amqp
        ));
    }

    #[test]
    fn test_filter_matches_multi_wildcard() {
        assert!(filter_matches(
            "app.events.#",
            "app.events.down.scheduled",
            Dialect::Amqp
        ));
        assert!(filter_matches("app/events/#", "app/events", Dialect::Mqtt));
        assert!(!filter_matches(
            "app.events.#",
            "other.events.create",
            Dialect::Amqp
        ));
    }

    #[test]
    fn test_filter_matches_length_mismatch() {
        assert!(!filter_matches(
            "app.devices.dev.up",
            "app.devices.dev",
            Dialect::Amqp
        ));
        assert!(!filter_matches(
            "app.devices.dev",
            "app.devices.dev.up",
            Dialect::Amqp
        ));
    }
}
