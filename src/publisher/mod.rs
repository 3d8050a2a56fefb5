//! Event publisher.
//!
//! A [`Publisher`] is bound to one `(project_id, topic)` pair. Sends are handed
//! to background tasks and return as soon as they are queued locally; call
//! [`Publisher::stop`] before exit to wait for them.
//!
//! ```text
//! Created --setup()--> Ready --stop()--> Stopped
//!                        |
//!                     send()*
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::bus::{ensure_topic, topic_for_event_type, Broker, BrokerConnection, OutboundMessage};
use crate::envelope::{Envelope, EnvelopeError};

/// Message attribute carrying the envelope's event type.
pub const EVENT_TYPE_ATTR: &str = "type";

/// Message attribute carrying the envelope's source.
pub const SOURCE_ATTR: &str = "source";

/// Errors that can occur while publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("Publisher setup failed for topic '{topic}': {message}")]
    Setup { topic: String, message: String },

    #[error("Failed to send event: {0}")]
    Send(#[source] EnvelopeError),

    #[error("Publisher for topic '{0}' is not set up")]
    NotReady(String),

    #[error("Publisher for topic '{0}' is stopped")]
    Stopped(String),

    #[error("No publisher configured for event type '{0}'")]
    NotConfigured(String),
}

enum PublisherState {
    Created,
    Ready(Arc<dyn BrokerConnection>),
    Stopped,
}

/// Sends envelopes to one broker topic.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    project_id: String,
    topic: String,
    state: RwLock<PublisherState>,
    in_flight: TaskTracker,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        project_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            project_id: project_id.into(),
            topic: topic.into(),
            state: RwLock::new(PublisherState::Created),
            in_flight: TaskTracker::new(),
        }
    }

    /// Publisher for the topic derived from `event_type`.
    pub fn for_event_type(
        broker: Arc<dyn Broker>,
        project_id: impl Into<String>,
        event_type: &str,
    ) -> Self {
        Self::new(broker, project_id, topic_for_event_type(event_type))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of sends not yet confirmed or failed.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Open a connection and make sure the topic exists.
    ///
    /// Safe to call repeatedly and from several processes at once: a topic
    /// that already exists counts as success. A ready publisher keeps its
    /// connection.
    pub async fn setup(&self) -> Result<(), PublisherError> {
        let mut state = self.state.write().await;

        let connection = match &*state {
            PublisherState::Ready(connection) => connection.clone(),
            PublisherState::Created => {
                self.broker
                    .connect(&self.project_id)
                    .await
                    .map_err(|e| self.setup_error(e))?
            }
            PublisherState::Stopped => {
                return Err(PublisherError::Stopped(self.topic.clone()));
            }
        };

        ensure_topic(connection.as_ref(), &self.topic)
            .await
            .map_err(|e| self.setup_error(e))?;

        *state = PublisherState::Ready(connection);
        info!(project_id = %self.project_id, topic = %self.topic, "Publisher ready");
        Ok(())
    }

    /// Queue an envelope for delivery.
    ///
    /// Returns once the message is queued locally, not when the broker has
    /// accepted it. Broker-side failures are logged.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), PublisherError> {
        let data = envelope.to_vec().map_err(PublisherError::Send)?;

        let state = self.state.read().await;
        let connection = match &*state {
            PublisherState::Ready(connection) => connection.clone(),
            PublisherState::Created => return Err(PublisherError::NotReady(self.topic.clone())),
            PublisherState::Stopped => return Err(PublisherError::Stopped(self.topic.clone())),
        };

        let message = OutboundMessage {
            data,
            attributes: HashMap::from([
                (EVENT_TYPE_ATTR.to_string(), envelope.event_type().to_string()),
                (SOURCE_ATTR.to_string(), envelope.source().to_string()),
            ]),
        };

        let topic = self.topic.clone();
        let envelope_id = envelope.id().to_string();
        self.in_flight.spawn(async move {
            match connection.publish(&topic, message).await {
                Ok(message_id) => {
                    debug!(topic = %topic, envelope_id = %envelope_id, message_id = %message_id, "Event published");
                }
                Err(e) => {
                    error!(topic = %topic, envelope_id = %envelope_id, error = %e, "Failed to publish event");
                }
            }
        });

        Ok(())
    }

    /// Wrap `payload` in an envelope and queue it.
    ///
    /// Returns the envelope that was sent.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        source: &str,
        event_type: &str,
        payload: &T,
    ) -> Result<Envelope, PublisherError> {
        let envelope = Envelope::new(source, event_type, payload).map_err(PublisherError::Send)?;
        self.send(&envelope).await?;
        Ok(envelope)
    }

    /// Wait for queued sends to finish, then release the connection.
    ///
    /// Safe to call more than once; a no-op when never set up.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;

        match std::mem::replace(&mut *state, PublisherState::Stopped) {
            PublisherState::Ready(connection) => {
                let pending = self.in_flight.len();
                self.in_flight.close();
                self.in_flight.wait().await;
                connection.close().await;
                info!(topic = %self.topic, flushed = pending, "Publisher stopped");
            }
            PublisherState::Created | PublisherState::Stopped => {}
        }
    }

    fn setup_error(&self, error: impl std::fmt::Display) -> PublisherError {
        PublisherError::Setup {
            topic: self.topic.clone(),
            message: error.to_string(),
        }
    }
}
