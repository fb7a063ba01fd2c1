//! Connection lifecycle and reconnection
//!
//! [`ConnectionManager`] owns the single transport session and the registry
//! of resource binders bound to it. `connect` retries up to the configured
//! bound; once a session has existed, an unsolicited close triggers an
//! unbounded, iterative redial loop on the supervisor task, followed by a
//! rebind of every registered binder while the registry lock is held.
//! Opening a new binder during that window waits for recovery to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::binder::ResourceBinder;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult, TransportError};
use crate::protocol::address::Dialect;
use crate::transport::{Session, Transport};

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnecting after an unsolicited close, with the attempt count.
    Reconnecting(u32),
}

struct Shared {
    session: RwLock<Option<Arc<dyn Session>>>,
    registry: Mutex<Vec<Arc<ResourceBinder>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the transport connection and drives recovery.
///
/// Cheap to clone; all clones share the same session and binder registry.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    shared: Arc<Shared>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
    connect_lock: Arc<Mutex<()>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        ConnectionManager {
            transport,
            config,
            shared: Arc::new(Shared {
                session: RwLock::new(None),
                registry: Mutex::new(Vec::new()),
                state_tx,
                shutdown_tx,
            }),
            supervisor: Arc::new(Mutex::new(None)),
            connect_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dialect(&self) -> Dialect {
        self.transport.dialect()
    }

    /// Watch channel for connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state_tx.borrow() == ConnectionState::Connected
    }

    /// Connects to the broker, retrying up to `connect_retries` times with
    /// `retry_delay` between attempts. A no-op success when already
    /// connected. Returns the last dial error on exhaustion.
    pub async fn connect(&self) -> ClientResult<()> {
        let _guard = self.connect_lock.lock().await;
        if !matches!(
            *self.shared.state_tx.borrow(),
            ConnectionState::Disconnected
        ) {
            return Ok(());
        }

        self.shared
            .state_tx
            .send_replace(ConnectionState::Connecting);
        self.shared.shutdown_tx.send_replace(false);

        let mut last_err = TransportError::Connect("no attempts made".to_string());
        for attempt in 1..=self.config.connect_retries {
            match self.transport.dial(&self.config).await {
                Ok(session) => {
                    info!(endpoint = %self.config.endpoint, attempt, "connected");
                    self.install_session(session).await;
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        endpoint = %self.config.endpoint,
                        attempt,
                        retries = self.config.connect_retries,
                        error = %err,
                        "connect attempt failed"
                    );
                    last_err = err;
                    if attempt < self.config.connect_retries {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);
        Err(ClientError::Transport(last_err))
    }

    async fn install_session(&self, session: Arc<dyn Session>) {
        let close_rx = session.notify_close();
        *self.shared.session.write().await = Some(session.clone());
        self.shared
            .state_tx
            .send_replace(ConnectionState::Connected);

        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let config = self.config.clone();
        let shutdown_rx = self.shared.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            supervise(shared, transport, config, close_rx, shutdown_rx).await;
        });
        if let Some(previous) = self.supervisor.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Disconnects from the broker. Idempotent: a no-op when not connected.
    /// Closes every registered binder's resource, then the session.
    pub async fn disconnect(&self) -> ClientResult<()> {
        let _guard = self.connect_lock.lock().await;
        if matches!(
            *self.shared.state_tx.borrow(),
            ConnectionState::Disconnected
        ) {
            return Ok(());
        }

        self.shared.shutdown_tx.send_replace(true);

        let binders: Vec<Arc<ResourceBinder>> = {
            let mut registry = self.shared.registry.lock().await;
            registry.drain(..).collect()
        };
        for binder in binders {
            if let Err(err) = binder.close().await {
                warn!(binder = %binder.name(), error = %err, "closing binder failed during disconnect");
            }
        }

        if let Some(session) = self.shared.session.write().await.take() {
            if let Err(err) = session.close().await {
                warn!(error = %err, "closing session failed during disconnect");
            }
        }
        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);

        // Give the supervisor a grace period to observe the shutdown signal.
        if let Some(handle) = self.supervisor.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("supervisor stopped"),
                Ok(Err(err)) if !err.is_cancelled() => {
                    warn!(error = %err, "supervisor ended with error")
                }
                Err(_) => warn!("supervisor did not stop in time, aborting"),
                _ => {}
            }
        }

        info!("disconnected");
        Ok(())
    }

    /// Opens a broker resource and registers its binder in the connection
    /// registry. Blocks while a reconnection rebind holds the registry lock.
    pub(crate) async fn open_binder(&self, name: &str) -> ClientResult<Arc<ResourceBinder>> {
        let mut registry = self.shared.registry.lock().await;
        let session = self
            .shared
            .session
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        let resource = session.open_resource().await?;
        let binder = Arc::new(ResourceBinder::new(name, resource));
        registry.push(binder.clone());
        Ok(binder)
    }

    /// Closes a binder and removes it from the registry.
    pub(crate) async fn close_binder(&self, binder: &Arc<ResourceBinder>) -> ClientResult<()> {
        {
            let mut registry = self.shared.registry.lock().await;
            registry.retain(|existing| !Arc::ptr_eq(existing, binder));
        }
        binder.close().await
    }
}

/// Interruptible sleep; returns false when shutdown was requested.
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Supervisor task: waits for the close notifier, redials without an attempt
/// bound (a session that once existed is assumed recoverable), then rebinds
/// every registered binder under the registry lock.
async fn supervise(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    mut close_rx: mpsc::Receiver<TransportError>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let cause = tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("supervisor shutting down");
                    return;
                }
                continue;
            }
            cause = close_rx.recv() => cause,
        };

        let Some(cause) = cause else {
            // Notifier ended without a cause: graceful close.
            debug!("close notifier ended, supervisor exiting");
            return;
        };
        warn!(error = %cause, "connection lost, reconnecting");

        let mut attempt = 0u32;
        let session = loop {
            attempt += 1;
            shared
                .state_tx
                .send_replace(ConnectionState::Reconnecting(attempt));
            if !interruptible_sleep(&mut shutdown_rx, config.retry_delay()).await {
                debug!("shutdown during reconnect delay");
                return;
            }
            match transport.dial(&config).await {
                Ok(session) => break session,
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                }
            }
        };

        // Holding the registry lock keeps new binders out until every
        // existing binder has been rebound on the fresh session.
        let registry = shared.registry.lock().await;
        if *shutdown_rx.borrow() {
            let _ = session.close().await;
            debug!("shutdown won the race against reconnect, discarding fresh session");
            return;
        }
        *shared.session.write().await = Some(session.clone());
        for binder in registry.iter() {
            binder.rebind(&session).await;
        }
        let rebound = registry.len();
        drop(registry);

        close_rx = session.notify_close();
        shared.state_tx.send_replace(ConnectionState::Connected);
        info!(attempt, binders = rebound, "reconnected");
    }
}
