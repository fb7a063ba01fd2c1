//! Subscribing side of the messaging client
//!
//! A [`Subscriber`] owns one consuming resource binder. Each subscription
//! registers a [`Consumer`] and a dedicated dispatch task that drains a
//! bounded delivery queue: for every delivery it re-parses the concrete
//! incoming topic (recovering the actual application and device even when
//! the subscription used wildcards), deserializes the payload, and invokes
//! the handler synchronously. The delivery is acknowledged after the handler
//! returns when the transport supplied an acknowledgement handle.
//!
//! Undecodable deliveries are logged and dropped without requeueing; a
//! poison message must not wedge its subscription. A handler that never
//! returns stalls only its own subscription's dispatch loop.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::client::binder::{Consumer, ResourceBinder, ResourceUser};
use crate::client::connection::ConnectionManager;
use crate::error::{ClientError, ClientResult};
use crate::protocol::address::{
    AddressError, AddressKind, ApplicationAddress, DeviceAddress, Dialect, MULTI_WILDCARD,
};
use crate::protocol::messages::{
    Activation, ApplicationEvent, DeviceEvent, DownlinkMessage, UplinkMessage,
};
use crate::token::Token;
use crate::transport::{Delivery, Qos};

type DecodeFn = Box<dyn Fn(&str, &[u8]) -> ClientResult<()> + Send + Sync>;

pub struct Subscriber {
    client: ConnectionManager,
    binder: Arc<ResourceBinder>,
    dialect: Dialect,
    qos: Qos,
    queue_capacity: usize,
    consumers: Arc<Mutex<HashMap<String, Arc<Consumer>>>>,
}

impl Subscriber {
    /// Opens a consuming binder on the connection.
    pub async fn open(client: &ConnectionManager) -> Result<Self, ClientError> {
        let binder = client.open_binder("subscribe").await?;
        Ok(Subscriber {
            client: client.clone(),
            binder,
            dialect: client.dialect(),
            qos: client.config().subscribe_qos,
            queue_capacity: client.config().queue_capacity,
            consumers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Closes every consumer and deregisters the binder.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.consumers.lock().await.clear();
        self.client.close_binder(&self.binder).await
    }

    /// Subscribes to uplinks for the given scope; `None` components become
    /// wildcards. The handler receives the concrete application and device
    /// IDs recovered from each delivery's topic.
    pub fn subscribe_uplink(
        &self,
        app_id: Option<&str>,
        dev_id: Option<&str>,
        handler: impl Fn(&str, &str, UplinkMessage) + Send + Sync + 'static,
    ) -> Token {
        self.subscribe_device(
            DeviceAddress::uplink(app_id, dev_id),
            move |addr, uplink: UplinkMessage| {
                handler(
                    addr.app_id.as_deref().unwrap_or_default(),
                    addr.dev_id.as_deref().unwrap_or_default(),
                    uplink,
                );
            },
        )
    }

    pub fn unsubscribe_uplink(&self, app_id: Option<&str>, dev_id: Option<&str>) -> Token {
        self.unsubscribe_device(DeviceAddress::uplink(app_id, dev_id))
    }

    /// Subscribes to downlinks queued for the given scope.
    pub fn subscribe_downlink(
        &self,
        app_id: Option<&str>,
        dev_id: Option<&str>,
        handler: impl Fn(&str, &str, DownlinkMessage) + Send + Sync + 'static,
    ) -> Token {
        self.subscribe_device(
            DeviceAddress::downlink(app_id, dev_id),
            move |addr, downlink: DownlinkMessage| {
                handler(
                    addr.app_id.as_deref().unwrap_or_default(),
                    addr.dev_id.as_deref().unwrap_or_default(),
                    downlink,
                );
            },
        )
    }

    pub fn unsubscribe_downlink(&self, app_id: Option<&str>, dev_id: Option<&str>) -> Token {
        self.unsubscribe_device(DeviceAddress::downlink(app_id, dev_id))
    }

    /// Subscribes to device activations for the given scope.
    pub fn subscribe_activations(
        &self,
        app_id: Option<&str>,
        dev_id: Option<&str>,
        handler: impl Fn(&str, &str, Activation) + Send + Sync + 'static,
    ) -> Token {
        self.subscribe_device(
            DeviceAddress::activations(app_id, dev_id),
            move |addr, activation: Activation| {
                handler(
                    addr.app_id.as_deref().unwrap_or_default(),
                    addr.dev_id.as_deref().unwrap_or_default(),
                    activation,
                );
            },
        )
    }

    pub fn unsubscribe_activations(&self, app_id: Option<&str>, dev_id: Option<&str>) -> Token {
        self.unsubscribe_device(DeviceAddress::activations(app_id, dev_id))
    }

    /// Subscribes to device events; `event: None` matches every subtype.
    /// The handler's event payload carries the subtype recovered from the
    /// concrete topic.
    pub fn subscribe_device_events(
        &self,
        app_id: Option<&str>,
        dev_id: Option<&str>,
        event: Option<&str>,
        handler: impl Fn(&str, &str, DeviceEvent) + Send + Sync + 'static,
    ) -> Token {
        let address = DeviceAddress::new(
            app_id,
            dev_id,
            AddressKind::Events,
            Some(event.unwrap_or(MULTI_WILDCARD)),
        );
        self.subscribe_device(address, move |addr, mut event: DeviceEvent| {
            event.app_id = addr.app_id.clone().unwrap_or_default();
            event.dev_id = addr.dev_id.clone().unwrap_or_default();
            if let Some(field) = &addr.field {
                event.event = field.clone();
            }
            let (app_id, dev_id) = (event.app_id.clone(), event.dev_id.clone());
            handler(&app_id, &dev_id, event);
        })
    }

    pub fn unsubscribe_device_events(
        &self,
        app_id: Option<&str>,
        dev_id: Option<&str>,
        event: Option<&str>,
    ) -> Token {
        self.unsubscribe_device(DeviceAddress::new(
            app_id,
            dev_id,
            AddressKind::Events,
            Some(event.unwrap_or(MULTI_WILDCARD)),
        ))
    }

    /// Subscribes to application events; `event: None` matches every subtype.
    pub fn subscribe_app_events(
        &self,
        app_id: Option<&str>,
        event: Option<&str>,
        handler: impl Fn(&str, ApplicationEvent) + Send + Sync + 'static,
    ) -> Token {
        let address = match ApplicationAddress::new(app_id, event) {
            Ok(address) => address,
            Err(err) => return Token::completed(Some(err.into())),
        };
        let filter = address.format(self.dialect);
        let dialect = self.dialect;
        let handler = Arc::new(handler);
        let decode: DecodeFn = Box::new(move |topic, payload| {
            let addr = ApplicationAddress::parse(topic, dialect)?;
            let mut event: ApplicationEvent =
                serde_json::from_slice(payload).map_err(ClientError::deserialization)?;
            event.app_id = addr.app_id.clone().unwrap_or_default();
            if let Some(field) = &addr.field {
                event.event = field.clone();
            }
            let app_id = event.app_id.clone();
            handler(&app_id, event);
            Ok(())
        });
        self.install_consumer(filter, decode)
    }

    pub fn unsubscribe_app_events(&self, app_id: Option<&str>, event: Option<&str>) -> Token {
        let address = match ApplicationAddress::new(app_id, event) {
            Ok(address) => address,
            Err(err) => return Token::completed(Some(err.into())),
        };
        self.remove_consumer(address.format(self.dialect))
    }

    fn subscribe_device<T, F>(
        &self,
        address: Result<DeviceAddress, AddressError>,
        invoke: F,
    ) -> Token
    where
        T: DeserializeOwned,
        F: Fn(&DeviceAddress, T) + Send + Sync + 'static,
    {
        let address = match address {
            Ok(address) => address,
            Err(err) => return Token::completed(Some(err.into())),
        };
        let filter = address.format(self.dialect);
        let dialect = self.dialect;
        let decode: DecodeFn = Box::new(move |topic, payload| {
            let addr = DeviceAddress::parse(topic, dialect)?;
            let payload: T =
                serde_json::from_slice(payload).map_err(ClientError::deserialization)?;
            invoke(&addr, payload);
            Ok(())
        });
        self.install_consumer(filter, decode)
    }

    fn unsubscribe_device(&self, address: Result<DeviceAddress, AddressError>) -> Token {
        let address = match address {
            Ok(address) => address,
            Err(err) => return Token::completed(Some(err.into())),
        };
        self.remove_consumer(address.format(self.dialect))
    }

    /// Registers a consumer for `filter` and starts its dispatch loop. An
    /// existing consumer on the same filter is replaced.
    fn install_consumer(&self, filter: String, decode: DecodeFn) -> Token {
        let token = Token::pending();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.queue_capacity);
        spawn_dispatch(inbound_rx, decode);
        let consumer = Arc::new(Consumer::new(filter.clone(), self.qos, inbound_tx));

        let completion = token.clone();
        let binder = self.binder.clone();
        let consumers = self.consumers.clone();
        tokio::spawn(async move {
            if let Some(previous) = consumers.lock().await.remove(&filter) {
                let user: Arc<dyn ResourceUser> = previous;
                binder.remove_user(&user).await;
            }
            match binder.add_user(consumer.clone()).await {
                Ok(()) => {
                    debug!(filter = %consumer.filter(), "subscribed");
                    consumers.lock().await.insert(filter, consumer);
                    completion.complete(None);
                }
                Err(err) => completion.complete(Some(err)),
            }
        });
        token
    }

    /// Removes the consumer for `filter`, closing its dispatch queue; the
    /// loop terminates after draining already-buffered deliveries. Removing
    /// an unknown filter is a no-op success.
    fn remove_consumer(&self, filter: String) -> Token {
        let token = Token::pending();
        let completion = token.clone();
        let binder = self.binder.clone();
        let consumers = self.consumers.clone();
        tokio::spawn(async move {
            let consumer = consumers.lock().await.remove(&filter);
            match consumer {
                Some(consumer) => {
                    let user: Arc<dyn ResourceUser> = consumer;
                    binder.remove_user(&user).await;
                    let result = binder.unsubscribe(&filter).await;
                    debug!(filter = %filter, "unsubscribed");
                    completion.complete(result.err());
                }
                None => completion.complete(None),
            }
        });
        token
    }
}

/// Dispatch loop: drains the bounded queue, decodes and invokes the handler
/// synchronously, and acknowledges the delivery afterwards. Decode failures
/// drop the delivery (still acknowledged - a poison message is consumed, not
/// requeued).
fn spawn_dispatch(mut inbound: mpsc::Receiver<Delivery>, decode: DecodeFn) {
    tokio::spawn(async move {
        while let Some(delivery) = inbound.recv().await {
            if let Err(err) = decode(&delivery.topic, &delivery.payload) {
                warn!(topic = %delivery.topic, error = %err, "dropping undecodable delivery");
            }
            if let Some(ack) = delivery.ack {
                if let Err(err) = ack.ack().await {
                    warn!(topic = %delivery.topic, error = %err, "delivery acknowledgement failed");
                }
            }
        }
        debug!("dispatch loop ended");
    });
}
