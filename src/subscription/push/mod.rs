//! Push delivery: the broker POSTs each message to the service.
//!
//! ```text
//! broker --POST /_courier/v1/push/<name>--> deliver() --> EnvelopeHandler
//!                  200 accept / 406 reject <--
//! ```
//!
//! The push target is built from the externally reachable base URL (`HOST`).
//! When that is unknown, setup logs a warning and the subscription is
//! skipped; the service still starts so that a first deployment can learn
//! its own URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    EnvelopeHandler, SetupContext, Subscription, SubscriptionError, DEFAULT_ACK_DEADLINE,
};
use crate::bus::{
    ensure_subscription, ensure_topic, topic_for_event_type, BrokerConnection, BusError,
    SubscriptionSpec,
};
use crate::envelope::Envelope;
use crate::service::ServiceContext;

/// Route prefix for push endpoints.
pub const PUSH_PATH_PREFIX: &str = "/_courier/v1/push";

/// Lifecycle of a push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Unconfigured,
    /// Name resolved; broker not yet contacted.
    Registered,
    /// No usable external URL; nothing registered with the broker.
    Skipped,
    Active,
    TornDown,
}

/// Outer wrapper the broker POSTs for each message.
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub subscription: String,
    pub message: PushMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub message_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Base64-encoded envelope bytes.
    pub data: String,
}

/// Subscription delivered by HTTP push.
pub struct PushSubscription {
    topic: String,
    configured_name: Option<String>,
    name: Option<String>,
    ack_deadline: Duration,
    delete_on_shutdown: bool,
    handler: Arc<dyn EnvelopeHandler>,
    connection: Option<Arc<dyn BrokerConnection>>,
    state: RwLock<PushState>,
}

impl PushSubscription {
    /// Subscribe to `event_type` with `handler`.
    pub fn new(event_type: &str, handler: impl EnvelopeHandler) -> Self {
        Self {
            topic: topic_for_event_type(event_type),
            configured_name: None,
            name: None,
            ack_deadline: DEFAULT_ACK_DEADLINE,
            delete_on_shutdown: false,
            handler: Arc::new(handler),
            connection: None,
            state: RwLock::new(PushState::Unconfigured),
        }
    }

    /// Use `name` instead of the derived default.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.configured_name = Some(name.into());
        self
    }

    pub fn with_ack_deadline(mut self, ack_deadline: Duration) -> Self {
        self.ack_deadline = ack_deadline;
        self
    }

    /// Delete the broker subscription on teardown.
    pub fn with_delete_on_shutdown(mut self, delete: bool) -> Self {
        self.delete_on_shutdown = delete;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn state(&self) -> PushState {
        *self.state.read().await
    }

    /// Route path for subscription `name`.
    pub fn endpoint_path(name: &str) -> String {
        format!("{}/{}", PUSH_PATH_PREFIX, name)
    }

    fn setup_error(&self, name: &str, error: impl std::fmt::Display) -> SubscriptionError {
        SubscriptionError::Setup {
            name: name.to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl Subscription for PushSubscription {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn setup(
        &mut self,
        ctx: &mut SetupContext<'_>,
        index: usize,
    ) -> Result<(), SubscriptionError> {
        let state = *self.state.get_mut();
        if state == PushState::Active {
            return Ok(());
        }

        let name = ctx.subscription_name(self.configured_name.as_deref(), index);
        self.name = Some(name.clone());
        *self.state.get_mut() = PushState::Registered;

        let Some(base_url) = ctx.env().external_base_url() else {
            warn!(
                subscription = %name,
                host = ?ctx.env().host,
                "No valid external URL configured, skipping push subscription"
            );
            *self.state.get_mut() = PushState::Skipped;
            return Ok(());
        };

        let path = Self::endpoint_path(&name);
        let endpoint = format!("{}{}", base_url.as_str().trim_end_matches('/'), path);

        let handler = self.handler.clone();
        let route_name = name.clone();
        let registered = ctx.route(
            &path,
            post(
                move |State(service): State<Arc<ServiceContext>>, body: Bytes| {
                    let handler = handler.clone();
                    let name = route_name.clone();
                    async move { deliver(&name, handler.as_ref(), service, &body).await }
                },
            ),
        );
        if !registered {
            return Err(self.setup_error(&name, format!("route {} is already registered", path)));
        }

        let project_id = ctx
            .project_id()
            .map_err(|e| self.setup_error(&name, e))?
            .to_string();
        let connection = ctx
            .broker()
            .connect(&project_id)
            .await
            .map_err(|e| self.setup_error(&name, e))?;

        ensure_topic(connection.as_ref(), &self.topic)
            .await
            .map_err(|e| self.setup_error(&name, e))?;

        let spec = SubscriptionSpec {
            topic: self.topic.clone(),
            ack_deadline: self.ack_deadline,
            push_endpoint: Some(endpoint.clone()),
        };
        ensure_subscription(connection.as_ref(), &name, &spec)
            .await
            .map_err(|e| self.setup_error(&name, e))?;

        self.connection = Some(connection);
        *self.state.get_mut() = PushState::Active;
        info!(subscription = %name, topic = %self.topic, endpoint = %endpoint, "Push subscription active");
        Ok(())
    }

    async fn listen(&self, _ctx: Arc<ServiceContext>) -> Result<(), SubscriptionError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), SubscriptionError> {
        let mut state = self.state.write().await;
        let was = std::mem::replace(&mut *state, PushState::TornDown);
        let name = self.name.as_deref().unwrap_or(&self.topic);

        let Some(connection) = self.connection.as_ref() else {
            return Ok(());
        };
        if was != PushState::Active {
            return Ok(());
        }

        let mut result = Ok(());
        if self.delete_on_shutdown {
            match connection.delete_subscription(name).await {
                Ok(()) => info!(subscription = %name, "Deleted push subscription"),
                Err(BusError::NotFound(_)) => {
                    debug!(subscription = %name, "Push subscription already gone")
                }
                Err(e) => {
                    result = Err(SubscriptionError::Teardown {
                        name: name.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
        connection.close().await;
        result
    }
}

/// Handle one push delivery.
///
/// Anything that fails before the handler is reached is a reject.
async fn deliver(
    subscription: &str,
    handler: &dyn EnvelopeHandler,
    ctx: Arc<ServiceContext>,
    body: &[u8],
) -> StatusCode {
    let envelope = match decode_push_body(body) {
        Ok(envelope) => envelope,
        Err(reason) => {
            warn!(subscription = %subscription, reason = %reason, "Rejecting malformed push delivery");
            return StatusCode::NOT_ACCEPTABLE;
        }
    };

    let envelope_id = envelope.id().to_string();
    if handler.handle(ctx, envelope).await {
        debug!(subscription = %subscription, envelope_id = %envelope_id, "Push delivery accepted");
        StatusCode::OK
    } else {
        debug!(subscription = %subscription, envelope_id = %envelope_id, "Push delivery rejected");
        StatusCode::NOT_ACCEPTABLE
    }
}

/// Unwrap the push request and decode the inner envelope.
pub fn decode_push_body(body: &[u8]) -> Result<Envelope, String> {
    let request: PushRequest =
        serde_json::from_slice(body).map_err(|e| format!("invalid push request: {}", e))?;
    let data = base64::engine::general_purpose::STANDARD
        .decode(request.message.data.as_bytes())
        .map_err(|e| format!("invalid base64 in message {}: {}", request.message.message_id, e))?;
    Envelope::from_slice(&data).map_err(|e| e.to_string())
}
