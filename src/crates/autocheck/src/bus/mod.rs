//! Message bus
//!
//! Publish/subscribe over an external broker. Payloads are opaque bytes; the
//! orchestrator owns their meaning. Delivery is at-least-once, so handlers
//! must tolerate duplicates.

pub mod amqp;

pub use amqp::{AmqpBus, AmqpConfig};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Message bus errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Broker connection could not be established in time
    #[error("Message bus not ready: {0}")]
    NotReady(String),

    /// Broker rejected an operation or the channel failed
    #[error("Message bus transport error: {0}")]
    Transport(String),

    /// Outgoing payload could not be encoded
    #[error("Message serialization error: {0}")]
    Serialization(String),
}

impl BusError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, BusError::NotReady(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

/// Result type for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Receiver of inbound payloads
///
/// Called from the consumer task, never from the publisher's task.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Vec<u8>);
}

/// Broker client
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload; connects first if needed
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> BusResult<()>;

    /// Start delivering messages from `queue` to `handler`; connects first if needed
    async fn subscribe(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> BusResult<()>;

    /// Whether the broker connection is currently open
    fn is_connected(&self) -> bool;
}
