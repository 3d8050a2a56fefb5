//! Subscriptions: receive envelopes from the broker and hand them to a handler.
//!
//! Two delivery strategies implement [`Subscription`]:
//! - [`PushSubscription`]: the broker POSTs each message to an HTTP route
//!   registered on the service router.
//! - [`PullSubscription`]: the service holds a long-lived receive loop open.
//!
//! Both are driven by the service runtime in the same order:
//! `setup` once per process, `listen` in its own task, `teardown` on shutdown.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::MethodRouter;
use axum::Router;
use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::bus::Broker;
use crate::config::{ConfigError, ServiceEnv};
use crate::envelope::Envelope;
use crate::service::ServiceContext;

pub mod pull;
pub mod push;

pub use pull::{PullState, PullSubscription};
pub use push::{PushState, PushSubscription, PUSH_PATH_PREFIX};

/// Default number of concurrent handler invocations for pull delivery.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default broker acknowledgement deadline.
pub const DEFAULT_ACK_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);

/// Errors that can occur in a subscription's lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Subscription '{name}' setup failed: {message}")]
    Setup { name: String, message: String },

    #[error("Subscription '{name}' receive loop failed: {message}")]
    Listen { name: String, message: String },

    #[error("Subscription '{name}' teardown failed: {message}")]
    Teardown { name: String, message: String },
}

/// Application callback for delivered envelopes.
///
/// Returning `true` accepts the message (ack / 200); `false` rejects it and
/// lets the broker redeliver. Async closures of the shape
/// `Fn(Arc<ServiceContext>, Envelope) -> impl Future<Output = bool>` implement
/// this trait.
pub trait EnvelopeHandler: Send + Sync + 'static {
    fn handle(&self, ctx: Arc<ServiceContext>, envelope: Envelope) -> BoxFuture<'static, bool>;
}

impl<F, Fut> EnvelopeHandler for F
where
    F: Fn(Arc<ServiceContext>, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn handle(&self, ctx: Arc<ServiceContext>, envelope: Envelope) -> BoxFuture<'static, bool> {
        (self)(ctx, envelope).boxed()
    }
}

/// A broker subscription driven by the service runtime.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Effective subscription name. `None` until `setup` has resolved it.
    fn name(&self) -> Option<&str>;

    /// Ensure the broker subscription exists and register any HTTP routes.
    ///
    /// `index` is the subscription's position in the service, used to derive
    /// a default name.
    async fn setup(
        &mut self,
        ctx: &mut SetupContext<'_>,
        index: usize,
    ) -> Result<(), SubscriptionError>;

    /// Deliver messages until shutdown. Returning an error is fatal to the
    /// service.
    async fn listen(&self, ctx: Arc<ServiceContext>) -> Result<(), SubscriptionError>;

    /// Stop delivery and release broker resources.
    async fn teardown(&self) -> Result<(), SubscriptionError>;
}

/// Default subscription name: `<service>-<version>_<index>`.
pub fn default_subscription_name(service_name: &str, service_version: &str, index: usize) -> String {
    format!("{}-{}_{}", service_name, service_version, index)
}

/// Everything a subscription may touch while being set up.
///
/// Owns the service router until setup completes; routes can only be added
/// here, never once the service is running.
pub struct SetupContext<'a> {
    service_name: &'a str,
    service_version: &'a str,
    env: &'a ServiceEnv,
    broker: Arc<dyn Broker>,
    router: Router<Arc<ServiceContext>>,
    paths: HashSet<String>,
    shutdown: CancellationToken,
}

impl<'a> SetupContext<'a> {
    pub fn new(
        service_name: &'a str,
        service_version: &'a str,
        env: &'a ServiceEnv,
        broker: Arc<dyn Broker>,
        router: Router<Arc<ServiceContext>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service_name,
            service_version,
            env,
            broker,
            router,
            paths: HashSet::new(),
            shutdown,
        }
    }

    pub fn service_name(&self) -> &str {
        self.service_name
    }

    pub fn service_version(&self) -> &str {
        self.service_version
    }

    pub fn env(&self) -> &ServiceEnv {
        self.env
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn project_id(&self) -> Result<&str, ConfigError> {
        self.env.require_project_id()
    }

    /// Runtime-wide shutdown token.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Resolve the effective name for a subscription at `index`.
    pub fn subscription_name(&self, configured: Option<&str>, index: usize) -> String {
        match configured {
            Some(name) => name.to_string(),
            None => default_subscription_name(self.service_name, self.service_version, index),
        }
    }

    /// Add a route to the service router.
    ///
    /// Returns `false` without touching the router if `path` is already taken.
    pub fn route(&mut self, path: &str, method_router: MethodRouter<Arc<ServiceContext>>) -> bool {
        if !self.paths.insert(path.to_string()) {
            return false;
        }
        let router = std::mem::take(&mut self.router);
        self.router = router.route(path, method_router);
        true
    }

    /// Whether `path` has already been routed.
    pub fn has_route(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// Consume the context, returning the router with every added route.
    pub fn into_router(self) -> Router<Arc<ServiceContext>> {
        self.router
    }
}
