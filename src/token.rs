//! Asynchronous operation tokens
//!
//! Every publish/subscribe operation returns a [`Token`]: a cheaply clonable
//! handle on the operation's eventual outcome. A token moves from pending to
//! complete exactly once; every waiter observes the same outcome no matter
//! how many times it waits.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ClientError;

/// Completion handle for one asynchronous publish/subscribe operation.
#[derive(Debug, Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    done: watch::Sender<bool>,
    outcome: OnceLock<Option<ClientError>>,
}

impl Token {
    /// Creates a token that has not completed yet.
    pub fn pending() -> Self {
        let (done, _) = watch::channel(false);
        Token {
            inner: Arc::new(TokenInner {
                done,
                outcome: OnceLock::new(),
            }),
        }
    }

    /// Creates an already-completed token. Used for failures detected before
    /// any transport interaction (e.g. a serialization error) and for no-op
    /// successes.
    pub fn completed(outcome: Option<ClientError>) -> Self {
        let token = Token::pending();
        token.complete(outcome);
        token
    }

    /// Records the outcome. The first call wins; later calls are ignored so
    /// the pending-to-complete transition happens exactly once.
    pub(crate) fn complete(&self, outcome: Option<ClientError>) {
        if self.inner.outcome.set(outcome).is_ok() {
            // send_replace updates the value even with no live receivers, so
            // a waiter subscribing after completion still observes it.
            self.inner.done.send_replace(true);
        }
    }

    /// Waits for completion and returns the outcome. Completion is guaranteed
    /// for every constructed token; callers that need an upper bound should
    /// use [`Token::wait_timeout`].
    pub async fn wait(&self) -> Option<ClientError> {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        self.error()
    }

    /// Waits for completion up to `timeout`; returns whether the operation
    /// completed within the bound.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.done.subscribe();
        let completed = tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .is_ok();
        completed
    }

    /// Whether the operation has completed.
    pub fn is_complete(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// The recorded outcome: `None` before completion or on success, the
    /// operation error otherwise. Stable across repeated calls.
    pub fn error(&self) -> Option<ClientError> {
        self.inner.outcome.get().cloned().flatten()
    }
}
