//! Message broker abstraction.
//!
//! This module contains:
//! - `Broker` trait: Opens connections scoped to a project
//! - `BrokerConnection` trait: Topic/subscription admin, publish and receive
//! - `MessageHandler` trait: Per-message processing with ack/nack outcome
//! - Implementations: in-memory (`memory`), Google Pub/Sub (`pubsub`)
//!
//! Every publisher and subscription owns its own connection. Connections are
//! never shared between components.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Implementation modules
pub mod memory;
#[cfg(feature = "pubsub")]
pub mod pubsub;

// Re-exports
pub use memory::MemoryBroker;
#[cfg(feature = "pubsub")]
pub use pubsub::PubSubBroker;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Broker request failed: {0}")]
    Request(String),

    #[error("Connection closed")]
    Closed,
}

/// Message handed to the broker for publishing.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            attributes: HashMap::new(),
        }
    }
}

/// Message received from a subscription.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    /// Broker-assigned message id.
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

/// Outcome reported back to the broker for a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; the broker drops the message.
    Ack,
    /// Not processed; the broker redelivers per its retry policy.
    Nack,
}

impl From<bool> for AckDecision {
    fn from(accepted: bool) -> Self {
        if accepted {
            AckDecision::Ack
        } else {
            AckDecision::Nack
        }
    }
}

/// Broker-side definition of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    /// Topic the subscription is bound to.
    pub topic: String,
    /// How long the broker waits for an ack before redelivering.
    pub ack_deadline: Duration,
    /// Push target. `None` means pull delivery.
    pub push_endpoint: Option<String>,
}

/// Handler invoked by a receive loop for each message.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, AckDecision>;
}

/// Entry point to a broker: opens connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection scoped to `project_id`.
    async fn connect(&self, project_id: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live connection to the broker.
///
/// Creation calls report pre-existing resources as [`BusError::AlreadyExists`];
/// use [`ensure_topic`] and [`ensure_subscription`] for idempotent setup.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_topic(&self, topic: &str) -> Result<()>;

    async fn create_subscription(&self, name: &str, spec: &SubscriptionSpec) -> Result<()>;

    async fn delete_subscription(&self, name: &str) -> Result<()>;

    /// Publish a message and wait for the broker to accept it.
    ///
    /// Returns the broker-assigned message id.
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<String>;

    /// Run a receive loop on `subscription` until `cancel` fires.
    ///
    /// Up to `max_concurrency` handler invocations run at once. Returns `Ok`
    /// after cancellation once in-flight handlers finish, or an error when the
    /// loop cannot continue.
    async fn receive(
        &self,
        subscription: &str,
        max_concurrency: usize,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Flush pending work and release the connection.
    async fn close(&self);
}

// ============================================================================
// Helpers
// ============================================================================

/// Derive the broker topic name for an event type.
///
/// Dots are replaced with dashes for Pub/Sub compatibility.
pub fn topic_for_event_type(event_type: &str) -> String {
    event_type.replace('.', "-")
}

/// Create `topic`, treating a pre-existing topic as success.
///
/// Returns `true` when this call created the topic.
pub async fn ensure_topic(connection: &dyn BrokerConnection, topic: &str) -> Result<bool> {
    match connection.create_topic(topic).await {
        Ok(()) => {
            info!(topic = %topic, "Created topic");
            Ok(true)
        }
        Err(BusError::AlreadyExists(_)) => {
            debug!(topic = %topic, "Topic already exists");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Create subscription `name`, treating a pre-existing subscription as success.
///
/// Returns `true` when this call created the subscription.
pub async fn ensure_subscription(
    connection: &dyn BrokerConnection,
    name: &str,
    spec: &SubscriptionSpec,
) -> Result<bool> {
    match connection.create_subscription(name, spec).await {
        Ok(()) => {
            info!(
                subscription = %name,
                topic = %spec.topic,
                push_endpoint = ?spec.push_endpoint,
                "Created subscription"
            );
            Ok(true)
        }
        Err(BusError::AlreadyExists(_)) => {
            debug!(subscription = %name, "Subscription already exists");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
