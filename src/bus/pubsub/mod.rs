//! Google Pub/Sub broker implementation.
//!
//! Topic and subscription ids are used as given; the client expands them to
//! `projects/{project_id}/topics/{id}` and `projects/{project_id}/subscriptions/{id}`.
//!
//! # Authentication
//!
//! Uses ADC (Application Default Credentials):
//! - Set `GOOGLE_APPLICATION_CREDENTIALS` to a service account JSON path
//! - Or `GOOGLE_APPLICATION_CREDENTIALS_JSON` with the JSON content
//! - For local testing: set `PUBSUB_EMULATOR_HOST` to the emulator address

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use google_cloud_gax::grpc::{Code, Status};
use google_cloud_googleapis::pubsub::v1::{PubsubMessage, PushConfig};
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use google_cloud_pubsub::subscriber::ReceivedMessage;
use google_cloud_pubsub::subscription::{ReceiveConfig, SubscriptionConfig};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AckDecision, Broker, BrokerConnection, BusError, InboundMessage, MessageHandler,
    OutboundMessage, Result, SubscriptionSpec,
};

/// Map a gRPC status onto the bus error taxonomy.
fn map_status(resource: &str, status: Status) -> BusError {
    match status.code() {
        Code::AlreadyExists => BusError::AlreadyExists(resource.to_string()),
        Code::NotFound => BusError::NotFound(resource.to_string()),
        Code::Unavailable => BusError::Connection(format!("{}: {}", resource, status)),
        _ => BusError::Request(format!("{}: {}", resource, status)),
    }
}

/// Ack deadline bounds accepted by Pub/Sub, in seconds.
const MIN_ACK_DEADLINE_SECS: u64 = 10;
const MAX_ACK_DEADLINE_SECS: u64 = 600;

/// Ack deadline in whole seconds, clamped to what Pub/Sub accepts.
fn ack_deadline_seconds(deadline: Duration) -> i32 {
    let secs = deadline
        .as_secs()
        .clamp(MIN_ACK_DEADLINE_SECS, MAX_ACK_DEADLINE_SECS);
    i32::try_from(secs).unwrap_or(MAX_ACK_DEADLINE_SECS as i32)
}

/// Google Pub/Sub broker.
///
/// Every `connect` builds an independent client.
#[derive(Debug, Clone, Default)]
pub struct PubSubBroker;

impl PubSubBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for PubSubBroker {
    async fn connect(&self, project_id: &str) -> Result<Arc<dyn BrokerConnection>> {
        let mut client_config = ClientConfig::default().with_auth().await.map_err(|e| {
            BusError::Connection(format!("Failed to configure Pub/Sub auth: {}", e))
        })?;
        client_config.project_id = Some(project_id.to_string());

        let client = Client::new(client_config)
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create Pub/Sub client: {}", e)))?;

        info!(project_id = %project_id, "Connected to Google Pub/Sub");

        Ok(Arc::new(PubSubConnection {
            client,
            publishers: RwLock::new(HashMap::new()),
        }))
    }
}

/// One Pub/Sub client plus its per-topic publishers.
pub struct PubSubConnection {
    client: Client,
    /// Cache of publishers per topic.
    publishers: RwLock<HashMap<String, Publisher>>,
}

impl PubSubConnection {
    /// Get or create the publisher for a topic.
    async fn publisher(&self, topic: &str) -> Publisher {
        {
            let publishers = self.publishers.read().await;
            if let Some(publisher) = publishers.get(topic) {
                return publisher.clone();
            }
        }

        let mut publishers = self.publishers.write().await;
        publishers
            .entry(topic.to_string())
            .or_insert_with(|| self.client.topic(topic).new_publisher(None))
            .clone()
    }
}

#[async_trait]
impl BrokerConnection for PubSubConnection {
    async fn create_topic(&self, topic: &str) -> Result<()> {
        self.client
            .topic(topic)
            .create(None, None)
            .await
            .map_err(|e| map_status(&format!("topic {}", topic), e))
    }

    async fn create_subscription(&self, name: &str, spec: &SubscriptionSpec) -> Result<()> {
        let topic = self.client.topic(&spec.topic);
        let config = SubscriptionConfig {
            ack_deadline_seconds: ack_deadline_seconds(spec.ack_deadline),
            push_config: spec.push_endpoint.as_ref().map(|endpoint| PushConfig {
                push_endpoint: endpoint.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.client
            .subscription(name)
            .create(topic.fully_qualified_name(), config, None)
            .await
            .map_err(|e| map_status(&format!("subscription {}", name), e))
    }

    async fn delete_subscription(&self, name: &str) -> Result<()> {
        self.client
            .subscription(name)
            .delete(None)
            .await
            .map_err(|e| map_status(&format!("subscription {}", name), e))
    }

    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<String> {
        let publisher = self.publisher(topic).await;
        let message = PubsubMessage {
            data: message.data.into(),
            attributes: message.attributes,
            ..Default::default()
        };

        let awaiter = publisher.publish(message).await;
        let id = awaiter
            .get()
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish to Pub/Sub: {}", e)))?;

        debug!(topic = %topic, message_id = %id, "Published message to Pub/Sub");
        Ok(id)
    }

    async fn receive(
        &self,
        subscription: &str,
        max_concurrency: usize,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let config = ReceiveConfig {
            worker_count: max_concurrency.max(1),
            ..Default::default()
        };

        info!(subscription = %subscription, "Starting Pub/Sub receiver");

        self.client
            .subscription(subscription)
            .receive(
                move |message: ReceivedMessage, _cancel: CancellationToken| {
                    let handler = handler.clone();
                    async move {
                        let inbound = InboundMessage {
                            id: message.message.message_id.clone(),
                            data: message.message.data.to_vec(),
                            attributes: message.message.attributes.clone(),
                        };

                        let outcome = match handler.handle(inbound).await {
                            AckDecision::Ack => message.ack().await,
                            AckDecision::Nack => message.nack().await,
                        };
                        if let Err(e) = outcome {
                            warn!(error = %e, "Failed to report message outcome to Pub/Sub");
                        }
                    }
                },
                cancel,
                Some(config),
            )
            .await
            .map_err(|e| BusError::Receive(format!("subscription {}: {}", subscription, e)))
    }

    async fn close(&self) {
        let mut publishers = self.publishers.write().await;
        for (topic, mut publisher) in publishers.drain() {
            publisher.shutdown().await;
            debug!(topic = %topic, "Pub/Sub publisher shut down");
        }
    }
}
