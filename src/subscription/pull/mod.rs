//! Pull delivery: a long-lived receive loop against the broker.
//!
//! Each received message is decoded into an [`Envelope`] and handed to the
//! handler. Accept acks, reject nacks (the broker redelivers). Messages that
//! do not decode are nacked without reaching the handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    EnvelopeHandler, SetupContext, Subscription, SubscriptionError, DEFAULT_ACK_DEADLINE,
    DEFAULT_MAX_CONCURRENCY,
};
use crate::bus::{
    ensure_subscription, ensure_topic, topic_for_event_type, AckDecision, BrokerConnection,
    BusError, InboundMessage, MessageHandler, SubscriptionSpec,
};
use crate::envelope::Envelope;
use crate::service::ServiceContext;

/// Lifecycle of a pull subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Unconfigured,
    Ready,
    Listening,
    Stopped,
}

/// Subscription delivered by a receive loop.
pub struct PullSubscription {
    topic: String,
    configured_name: Option<String>,
    name: Option<String>,
    ack_deadline: Duration,
    max_concurrency: usize,
    delete_on_shutdown: bool,
    handler: Arc<dyn EnvelopeHandler>,
    connection: Option<Arc<dyn BrokerConnection>>,
    cancel: CancellationToken,
    state: RwLock<PullState>,
}

impl PullSubscription {
    /// Subscribe to `event_type` with `handler`.
    pub fn new(event_type: &str, handler: impl EnvelopeHandler) -> Self {
        Self {
            topic: topic_for_event_type(event_type),
            configured_name: None,
            name: None,
            ack_deadline: DEFAULT_ACK_DEADLINE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            delete_on_shutdown: false,
            handler: Arc::new(handler),
            connection: None,
            cancel: CancellationToken::new(),
            state: RwLock::new(PullState::Unconfigured),
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

    /// Bound on concurrent handler invocations. `1` serializes delivery.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
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

    pub async fn state(&self) -> PullState {
        *self.state.read().await
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.topic)
    }

    fn setup_error(&self, name: &str, error: impl std::fmt::Display) -> SubscriptionError {
        SubscriptionError::Setup {
            name: name.to_string(),
            message: error.to_string(),
        }
    }

    fn listen_error(&self, error: impl std::fmt::Display) -> SubscriptionError {
        SubscriptionError::Listen {
            name: self.display_name().to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl Subscription for PullSubscription {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn setup(
        &mut self,
        ctx: &mut SetupContext<'_>,
        index: usize,
    ) -> Result<(), SubscriptionError> {
        if *self.state.get_mut() != PullState::Unconfigured {
            return Ok(());
        }

        let name = ctx.subscription_name(self.configured_name.as_deref(), index);
        self.name = Some(name.clone());

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
            push_endpoint: None,
        };
        ensure_subscription(connection.as_ref(), &name, &spec)
            .await
            .map_err(|e| self.setup_error(&name, e))?;

        self.connection = Some(connection);
        self.cancel = ctx.shutdown().child_token();
        *self.state.get_mut() = PullState::Ready;
        info!(subscription = %name, topic = %self.topic, "Pull subscription ready");
        Ok(())
    }

    async fn listen(&self, ctx: Arc<ServiceContext>) -> Result<(), SubscriptionError> {
        let connection = {
            let mut state = self.state.write().await;
            match (*state, self.connection.as_ref()) {
                (PullState::Ready, Some(connection)) => {
                    *state = PullState::Listening;
                    connection.clone()
                }
                (current, _) => {
                    return Err(self.listen_error(format!("cannot listen while {:?}", current)));
                }
            }
        };

        let name = self.display_name().to_string();
        let dispatcher = Arc::new(EnvelopeDispatcher {
            subscription: name.clone(),
            handler: self.handler.clone(),
            ctx,
        });

        info!(subscription = %name, max_concurrency = self.max_concurrency, "Listening");
        let result = connection
            .receive(&name, self.max_concurrency, dispatcher, self.cancel.clone())
            .await;

        match result {
            Ok(()) => {
                info!(subscription = %name, "Receive loop stopped");
                Ok(())
            }
            Err(e) => Err(self.listen_error(e)),
        }
    }

    async fn teardown(&self) -> Result<(), SubscriptionError> {
        self.cancel.cancel();

        let mut state = self.state.write().await;
        let was = std::mem::replace(&mut *state, PullState::Stopped);
        if was == PullState::Stopped {
            return Ok(());
        }
        let Some(connection) = self.connection.as_ref() else {
            return Ok(());
        };

        let name = self.display_name();
        let mut result = Ok(());
        if self.delete_on_shutdown {
            match connection.delete_subscription(name).await {
                Ok(()) => info!(subscription = %name, "Deleted pull subscription"),
                Err(BusError::NotFound(_)) => {
                    debug!(subscription = %name, "Pull subscription already gone")
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

/// Adapts an [`EnvelopeHandler`] to the broker's per-message callback.
struct EnvelopeDispatcher {
    subscription: String,
    handler: Arc<dyn EnvelopeHandler>,
    ctx: Arc<ServiceContext>,
}

impl MessageHandler for EnvelopeDispatcher {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, AckDecision> {
        let envelope = match Envelope::from_slice(&message.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    subscription = %self.subscription,
                    message_id = %message.id,
                    error = %e,
                    "Nacking undecodable message"
                );
                return futures::future::ready(AckDecision::Nack).boxed();
            }
        };

        let subscription = self.subscription.clone();
        let message_id = message.id;
        let accepted = self.handler.handle(self.ctx.clone(), envelope);
        async move {
            let decision = AckDecision::from(accepted.await);
            debug!(subscription = %subscription, message_id = %message_id, ?decision, "Handled message");
            decision
        }
        .boxed()
    }
}
