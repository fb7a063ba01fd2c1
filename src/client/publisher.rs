//! Publishing side of the messaging client
//!
//! A [`Publisher`] owns one publish-only resource binder. Each operation
//! computes the address for its message kind, serializes the payload to
//! JSON, and hands it to the binder at the configured quality of service,
//! returning a [`Token`]. A formatting failure produces an already-failed
//! token without touching the transport.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::client::binder::{PublishBinding, ResourceBinder};
use crate::client::connection::ConnectionManager;
use crate::error::ClientError;
use crate::protocol::address::{AddressError, ApplicationAddress, DeviceAddress, Dialect};
use crate::protocol::messages::{
    Activation, ApplicationEvent, DeviceEvent, DownlinkMessage, UplinkMessage,
};
use crate::token::Token;
use crate::transport::Qos;

pub struct Publisher {
    client: ConnectionManager,
    binder: Arc<ResourceBinder>,
    dialect: Dialect,
    qos: Qos,
}

impl Publisher {
    /// Opens a publish binder on the connection.
    pub async fn open(client: &ConnectionManager) -> Result<Self, ClientError> {
        let binder = client.open_binder("publish").await?;
        binder.add_user(Arc::new(PublishBinding)).await?;
        Ok(Publisher {
            client: client.clone(),
            binder,
            dialect: client.dialect(),
            qos: client.config().publish_qos,
        })
    }

    /// Closes the publish binder and deregisters it from the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.client.close_binder(&self.binder).await
    }

    /// Publishes an uplink on the device's `up` address.
    pub fn publish_uplink(&self, uplink: &UplinkMessage) -> Token {
        let address = DeviceAddress::uplink(Some(&uplink.app_id), Some(&uplink.dev_id));
        self.publish_device(address, uplink)
    }

    /// Publishes a downlink on the device's `down` address.
    pub fn publish_downlink(&self, downlink: &DownlinkMessage) -> Token {
        let address = DeviceAddress::downlink(Some(&downlink.app_id), Some(&downlink.dev_id));
        self.publish_device(address, downlink)
    }

    /// Publishes an activation on the device's `events.activations` address.
    pub fn publish_activation(&self, activation: &Activation) -> Token {
        let address =
            DeviceAddress::activations(Some(&activation.app_id), Some(&activation.dev_id));
        self.publish_device(address, activation)
    }

    /// Publishes a device event on `events.<subtype>`.
    pub fn publish_device_event(&self, event: &DeviceEvent) -> Token {
        let address = DeviceAddress::new(
            Some(&event.app_id),
            Some(&event.dev_id),
            crate::protocol::address::AddressKind::Events,
            Some(&event.event),
        );
        self.publish_device(address, event)
    }

    /// Publishes an application event on the application's `events.<subtype>`.
    pub fn publish_app_event(&self, event: &ApplicationEvent) -> Token {
        let address = ApplicationAddress::new(Some(&event.app_id), Some(&event.event));
        let topic = match address {
            Ok(address) => address.format(self.dialect),
            Err(err) => return Token::completed(Some(err.into())),
        };
        self.publish_bytes(topic, event)
    }

    fn publish_device<T: Serialize>(
        &self,
        address: Result<DeviceAddress, AddressError>,
        payload: &T,
    ) -> Token {
        let topic = match address {
            Ok(address) => address.format(self.dialect),
            Err(err) => return Token::completed(Some(err.into())),
        };
        self.publish_bytes(topic, payload)
    }

    fn publish_bytes<T: Serialize>(&self, topic: String, payload: &T) -> Token {
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(err) => return Token::completed(Some(ClientError::serialization(err))),
        };

        let token = Token::pending();
        let completion = token.clone();
        let binder = self.binder.clone();
        let qos = self.qos;
        tokio::spawn(async move {
            debug!(topic = %topic, bytes = bytes.len(), "publishing");
            let result = binder.publish(&topic, bytes, qos).await;
            completion.complete(result.err());
        });
        token
    }
}
