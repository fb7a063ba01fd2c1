//! Broker resource binding and the re-binding protocol
//!
//! A [`ResourceBinder`] wraps one broker-side resource and the ordered list
//! of [`ResourceUser`]s registered on it. When the connection is replaced
//! after an unsolicited close, the binder re-creates its resource and
//! replays `apply` on every user in registration order, so consumers survive
//! reconnection without the caller re-registering anything.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::transport::{Qos, Resource, Session};

/// A registered capability on a broker resource.
///
/// `apply` must be safe to call repeatedly with different underlying
/// resources and must fully restore observable behavior: routing, quality of
/// service, and delivery target.
#[async_trait]
pub trait ResourceUser: Send + Sync {
    async fn apply(&self, resource: &Arc<dyn Resource>) -> ClientResult<()>;
    async fn release(&self);
}

/// One broker-side resource with its registered users.
pub struct ResourceBinder {
    name: String,
    resource: RwLock<Option<Arc<dyn Resource>>>,
    users: RwLock<Vec<Arc<dyn ResourceUser>>>,
}

impl ResourceBinder {
    pub(crate) fn new(name: &str, resource: Arc<dyn Resource>) -> Self {
        ResourceBinder {
            name: name.to_string(),
            resource: RwLock::new(Some(resource)),
            users: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a user and applies it to the current resource. On a failed
    /// initial apply the user is deregistered and the error surfaced.
    pub(crate) async fn add_user(&self, user: Arc<dyn ResourceUser>) -> ClientResult<()> {
        {
            let mut users = self.users.write().await;
            users.push(user.clone());
        }
        let resource = match self.resource.read().await.clone() {
            Some(resource) => resource,
            None => {
                self.remove_user(&user).await;
                return Err(ClientError::NotBound);
            }
        };
        if let Err(err) = user.apply(&resource).await {
            self.remove_user(&user).await;
            return Err(err);
        }
        Ok(())
    }

    /// Releases a user and drops it from the registration list.
    pub(crate) async fn remove_user(&self, user: &Arc<dyn ResourceUser>) {
        {
            let mut users = self.users.write().await;
            users.retain(|existing| !Arc::ptr_eq(existing, user));
        }
        user.release().await;
    }

    /// Publishes on the bound resource.
    pub(crate) async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> ClientResult<()> {
        let resource = self
            .resource
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotBound)?;
        resource.publish(topic, payload, qos).await?;
        Ok(())
    }

    /// Removes a topic binding on the bound resource.
    pub(crate) async fn unsubscribe(&self, filter: &str) -> ClientResult<()> {
        let resource = self
            .resource
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotBound)?;
        resource.unsubscribe(filter).await?;
        Ok(())
    }

    /// Re-creates the broker resource on a fresh session and replays every
    /// registered user against it, in registration order. A user whose apply
    /// fails is logged and skipped so one broken consumer does not block
    /// recovery of its siblings.
    pub(crate) async fn rebind(&self, session: &Arc<dyn Session>) {
        {
            let mut slot = self.resource.write().await;
            if let Some(stale) = slot.take() {
                if let Err(err) = stale.close().await {
                    debug!(binder = %self.name, error = %err, "closing stale resource failed");
                }
            }
        }
        let fresh = match session.open_resource().await {
            Ok(resource) => resource,
            Err(err) => {
                warn!(binder = %self.name, error = %err, "reopening resource failed, binder left unbound");
                return;
            }
        };
        {
            let mut slot = self.resource.write().await;
            *slot = Some(fresh.clone());
        }
        let users = self.users.read().await;
        for user in users.iter() {
            if let Err(err) = user.apply(&fresh).await {
                warn!(binder = %self.name, error = %err, "re-apply failed, skipping user");
            }
        }
        debug!(binder = %self.name, users = users.len(), "resource rebound");
    }

    /// Releases every user in registration order, then closes the resource.
    pub(crate) async fn close(&self) -> ClientResult<()> {
        let users: Vec<Arc<dyn ResourceUser>> = {
            let mut users = self.users.write().await;
            users.drain(..).collect()
        };
        for user in users {
            user.release().await;
        }
        if let Some(resource) = self.resource.write().await.take() {
            resource.close().await?;
        }
        Ok(())
    }
}

/// Stateless user for publish-only binders; nothing to reapply after a
/// rebind since publishes always go through the binder's current resource.
pub(crate) struct PublishBinding;

#[async_trait]
impl ResourceUser for PublishBinding {
    async fn apply(&self, _resource: &Arc<dyn Resource>) -> ClientResult<()> {
        Ok(())
    }

    async fn release(&self) {}
}

/// Consuming user: owns a subscription filter, the bounded inbound queue its
/// dispatch loop drains, and the forwarding task that feeds the queue from
/// the transport's delivery stream.
pub(crate) struct Consumer {
    filter: String,
    qos: Qos,
    inbound: Mutex<Option<mpsc::Sender<crate::transport::Delivery>>>,
    forward: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub(crate) fn new(
        filter: String,
        qos: Qos,
        inbound: mpsc::Sender<crate::transport::Delivery>,
    ) -> Self {
        Consumer {
            filter,
            qos,
            inbound: Mutex::new(Some(inbound)),
            forward: Mutex::new(None),
        }
    }

    pub(crate) fn filter(&self) -> &str {
        &self.filter
    }
}

#[async_trait]
impl ResourceUser for Consumer {
    async fn apply(&self, resource: &Arc<dyn Resource>) -> ClientResult<()> {
        // A consumer may be re-applied on every rebind; the previous
        // forwarding task reads from a dead stream and is replaced.
        if let Some(stale) = self.forward.lock().await.take() {
            stale.abort();
        }
        let inbound = match self.inbound.lock().await.clone() {
            Some(inbound) => inbound,
            None => return Ok(()), // released, nothing to restore
        };
        let mut deliveries = resource.subscribe(&self.filter, self.qos).await?;
        let filter = self.filter.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                // A full dispatch queue blocks here, back-pressuring the
                // transport stream instead of growing without bound.
                if inbound.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!(filter = %filter, "delivery forwarding ended");
        });
        *self.forward.lock().await = Some(handle);
        Ok(())
    }

    async fn release(&self) {
        if let Some(task) = self.forward.lock().await.take() {
            task.abort();
        }
        // Dropping the sender closes the dispatch queue; the dispatch loop
        // drains buffered deliveries and then terminates.
        self.inbound.lock().await.take();
    }
}
