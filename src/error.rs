//! Error types for the messaging client
//!
//! `ClientError` is the outcome type carried by operation tokens. Every token
//! clone hands the same outcome to every waiter, so the error type is `Clone`;
//! non-clonable sources (`serde_json::Error`) ride in an `Arc`.

use std::sync::Arc;
use thiserror::Error;

use crate::protocol::address::AddressError;

/// Transport-level errors reported by a binding or the transport SDK boundary.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("resource open failed: {0}")]
    OpenResource(String),

    #[error("session closed")]
    Closed,
}

/// Main error type for client operations.
///
/// Callers observe these through `Token::error` for asynchronous operations,
/// or directly from `connect`/`open` style calls.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    #[error("payload deserialization failed: {0}")]
    Deserialization(#[source] Arc<serde_json::Error>),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("not connected")]
    NotConnected,

    #[error("no resource bound")]
    NotBound,
}

impl ClientError {
    pub(crate) fn serialization(err: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(err))
    }

    pub(crate) fn deserialization(err: serde_json::Error) -> Self {
        Self::Deserialization(Arc::new(err))
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
