//! Transport-agnostic resilient pub/sub client layer
//!
//! Control flow: [`Subscriber`]/[`Publisher`] hand work to a
//! [`binder::ResourceBinder`], which talks to the session owned by
//! [`ConnectionManager`]. On reconnection the manager rebinds every binder,
//! replaying registration for every consumer.

pub mod binder;
pub mod connection;
pub mod publisher;
pub mod subscriber;

pub use binder::{ResourceBinder, ResourceUser};
pub use connection::{ConnectionManager, ConnectionState};
pub use publisher::Publisher;
pub use subscriber::Subscriber;
