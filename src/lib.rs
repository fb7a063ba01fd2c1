//! lorabus - resilient application messaging for LoRaWAN network stacks
//!
//! This crate moves uplink, downlink, event, and activation traffic between
//! network components and applications over two interchangeable transports:
//! an AMQP queue/exchange broker and a lightweight MQTT pub/sub broker.
//!
//! # Overview
//!
//! The transport-agnostic core provides:
//! - connection lifecycle with bounded-retry connect and transparent,
//!   unbounded reconnection after unsolicited loss
//! - broker resources that are re-created and re-populated on recovery
//!   without losing registered consumers
//! - a structured hierarchical address grammar with wildcard semantics,
//!   rendered per transport dialect
//! - asynchronous completion tokens for publish/subscribe operations
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use lorabus::{ClientConfig, ConnectionManager, Publisher, Subscriber};
//! use lorabus::protocol::UplinkMessage;
//! use lorabus::transport::MqttTransport;
//!
//! # async fn run() -> Result<(), lorabus::ClientError> {
//! let config = ClientConfig::new("mqtt://localhost:1883");
//! let client = ConnectionManager::new(Arc::new(MqttTransport::new()), config);
//! client.connect().await?;
//!
//! let subscriber = Subscriber::open(&client).await?;
//! subscriber
//!     .subscribe_uplink(Some("app"), None, |app_id, dev_id, uplink| {
//!         println!("{app_id}/{dev_id}: {:?}", uplink.payload_raw);
//!     })
//!     .wait()
//!     .await;
//!
//! let publisher = Publisher::open(&client).await?;
//! let uplink = UplinkMessage {
//!     app_id: "app".to_string(),
//!     dev_id: "test".to_string(),
//!     payload_raw: vec![0x01, 0x08],
//!     ..Default::default()
//! };
//! publisher.publish_uplink(&uplink).wait().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod token;
pub mod transport;

pub use client::{ConnectionManager, ConnectionState, Publisher, ResourceUser, Subscriber};
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult, TransportError};
pub use protocol::{ApplicationAddress, DeviceAddress, Dialect};
pub use token::Token;
pub use transport::{AmqpTransport, MqttTransport, Qos};
