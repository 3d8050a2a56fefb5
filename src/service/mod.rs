//! Service runtime.
//!
//! A [`Service`] ties together the HTTP server, zero or more
//! [`Subscription`]s and one [`Publisher`] per output event type, and walks
//! them through a fixed lifecycle:
//!
//! ```text
//! Created -> EnvironmentValidated -> ServerConfigured -> SubscriptionsRegistered
//!         -> PublishersRegistered -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! `Running` is left on an interrupt/terminate signal or when a receive loop
//! fails. Shutdown drains the HTTP server, joins the receive loops, tears
//! down every subscription and finally flushes every publisher.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::MethodRouter;
use axum::Router;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{Broker, BusError};
use crate::config::{ConfigError, ServiceEnv};
use crate::envelope::Envelope;
use crate::publisher::{Publisher, PublisherError};
use crate::subscription::{SetupContext, Subscription, SubscriptionError};
use crate::utils::bootstrap::shutdown_signal;

mod server;

/// Runtime lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Created,
    EnvironmentValidated,
    ServerConfigured,
    SubscriptionsRegistered,
    PublishersRegistered,
    Running,
    ShuttingDown,
    Stopped,
}

/// Errors that stop a service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Publisher error: {0}")]
    Publisher(#[from] PublisherError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("HTTP server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("Startup hook failed: {0}")]
    Startup(String),

    #[error("Route '{0}' is registered more than once")]
    RouteConflict(String),
}

/// State shared with handlers while the service runs.
pub struct ServiceContext {
    name: String,
    version: String,
    env: ServiceEnv,
    publishers: HashMap<String, Arc<Publisher>>,
    local_addr: Option<SocketAddr>,
}

impl ServiceContext {
    pub(crate) fn new(
        name: String,
        version: String,
        env: ServiceEnv,
        publishers: HashMap<String, Arc<Publisher>>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            name,
            version,
            env,
            publishers,
            local_addr,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(name: &str, version: &str, env: ServiceEnv) -> Self {
        Self::new(name.to_string(), version.to_string(), env, HashMap::new(), None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Envelope source for events this service emits: `<name>.<version>`.
    pub fn source(&self) -> String {
        format!("{}.{}", self.name, self.version)
    }

    pub fn env(&self) -> &ServiceEnv {
        &self.env
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Publisher for output `event_type`, if declared.
    pub fn publisher(&self, event_type: &str) -> Option<&Arc<Publisher>> {
        self.publishers.get(event_type)
    }

    /// Wrap `payload` in an envelope from this service and publish it.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        payload: &T,
    ) -> Result<Envelope, PublisherError> {
        let publisher = self
            .publisher(event_type)
            .ok_or_else(|| PublisherError::NotConfigured(event_type.to_string()))?;
        publisher.publish(&self.source(), event_type, payload).await
    }
}

type StartHook =
    Box<dyn FnOnce(Arc<ServiceContext>) -> BoxFuture<'static, Result<(), ServiceError>> + Send>;

/// Wraps the finished routing table, e.g. with `Router::layer`.
pub type Middleware =
    Box<dyn FnOnce(Router<Arc<ServiceContext>>) -> Router<Arc<ServiceContext>> + Send>;

/// Builder and runner for one service process.
pub struct Service {
    name: String,
    version: String,
    broker: Arc<dyn Broker>,
    subscriptions: Vec<Box<dyn Subscription>>,
    outputs: Vec<String>,
    routes: Vec<(String, MethodRouter<Arc<ServiceContext>>)>,
    middleware: Vec<Middleware>,
    on_start: Option<StartHook>,
    lifecycle: watch::Sender<Lifecycle>,
}

impl Service {
    pub fn new(name: impl Into<String>, version: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        Self {
            name: name.into(),
            version: version.into(),
            broker,
            subscriptions: Vec::new(),
            outputs: Vec::new(),
            routes: Vec::new(),
            middleware: Vec::new(),
            on_start: None,
            lifecycle,
        }
    }

    pub fn with_subscription(mut self, subscription: impl Subscription + 'static) -> Self {
        self.subscriptions.push(Box::new(subscription));
        self
    }

    /// Declare an output event type. One publisher is created per type.
    pub fn with_output(mut self, event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        if !self.outputs.contains(&event_type) {
            self.outputs.push(event_type);
        }
        self
    }

    /// Add an application route to the HTTP server.
    ///
    /// A route on `/` replaces the built-in health check. Registering a path
    /// twice, or a path a push subscription needs, fails startup.
    pub fn with_route(mut self, path: &str, method_router: MethodRouter<Arc<ServiceContext>>) -> Self {
        self.routes.push((path.to_string(), method_router));
        self
    }

    /// Wrap the whole HTTP router once every route is known.
    ///
    /// Applied in registration order, inside the built-in timeout and
    /// request tracing layers.
    pub fn with_middleware<F>(mut self, wrap: F) -> Self
    where
        F: FnOnce(Router<Arc<ServiceContext>>) -> Router<Arc<ServiceContext>> + Send + 'static,
    {
        self.middleware.push(Box::new(wrap));
        self
    }

    /// Run `hook` after setup, before the service starts serving.
    ///
    /// An error aborts startup.
    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(Arc<ServiceContext>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// Watch lifecycle transitions.
    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Load configuration from the environment and run until a termination
    /// signal arrives.
    pub async fn run(self) -> Result<(), ServiceError> {
        let env = ServiceEnv::load()?;
        self.run_until(env, shutdown_signal()).await
    }

    /// Run with explicit configuration until `shutdown` resolves.
    pub async fn run_until(
        mut self,
        env: ServiceEnv,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), ServiceError> {
        if !self.subscriptions.is_empty() || !self.outputs.is_empty() {
            env.require_project_id()?;
        }
        self.transition(Lifecycle::EnvironmentValidated);

        let listener = TcpListener::bind(("0.0.0.0", env.port)).await?;
        let local_addr = listener.local_addr()?;
        let routes = std::mem::take(&mut self.routes);
        self.transition(Lifecycle::ServerConfigured);

        let token = CancellationToken::new();
        let mut publishers: HashMap<String, Arc<Publisher>> = HashMap::new();

        let router = match self.setup_subscriptions(&env, routes, &token).await {
            Ok(router) => router,
            Err(e) => {
                self.cleanup(&publishers).await;
                return Err(e);
            }
        };
        self.transition(Lifecycle::SubscriptionsRegistered);

        if let Err(e) = setup_publishers(&self.broker, &self.outputs, &env, &mut publishers).await {
            self.cleanup(&publishers).await;
            return Err(e);
        }
        self.transition(Lifecycle::PublishersRegistered);

        let ctx = Arc::new(ServiceContext::new(
            self.name.clone(),
            self.version.clone(),
            env.clone(),
            publishers.clone(),
            Some(local_addr),
        ));

        if let Some(hook) = self.on_start.take() {
            if let Err(e) = hook(ctx.clone()).await {
                error!(error = %e, "Startup hook failed");
                self.cleanup(&publishers).await;
                return Err(e);
            }
        }

        let subscriptions: Vec<Arc<dyn Subscription>> =
            std::mem::take(&mut self.subscriptions).into_iter().map(Arc::from).collect();

        let middleware = std::mem::take(&mut self.middleware);
        let app = server::build_app(router, middleware, &env, ctx.clone());
        let mut server = tokio::spawn(server::serve(listener, app, token.clone()));

        let mut listeners = JoinSet::new();
        for subscription in &subscriptions {
            let subscription = subscription.clone();
            let ctx = ctx.clone();
            listeners.spawn(async move { subscription.listen(ctx).await });
        }

        self.transition(Lifecycle::Running);
        info!(
            service = %self.name,
            version = %self.version,
            addr = %local_addr,
            subscriptions = subscriptions.len(),
            publishers = publishers.len(),
            "Service running"
        );

        let mut server_done = false;
        let mut failure: Option<ServiceError> = None;
        tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
            }
            e = first_listen_error(&mut listeners) => {
                error!(error = %e, "Receive loop failed, shutting down");
                failure = Some(e.into());
            }
            result = &mut server => {
                server_done = true;
                match result {
                    Ok(Ok(())) => warn!("HTTP server exited unexpectedly"),
                    Ok(Err(e)) => {
                        error!(error = %e, "HTTP server failed");
                        failure = Some(e.into());
                    }
                    Err(e) => error!(error = %e, "HTTP server task failed"),
                }
            }
        }

        self.transition(Lifecycle::ShuttingDown);
        token.cancel();

        if !server_done {
            match tokio::time::timeout(env.shutdown_timeout, &mut server).await {
                Ok(Ok(Ok(()))) => info!("HTTP server drained"),
                Ok(Ok(Err(e))) => error!(error = %e, "HTTP server failed during drain"),
                Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
                Err(_) => {
                    warn!(timeout = ?env.shutdown_timeout, "HTTP drain timed out, aborting");
                    server.abort();
                }
            }
        }

        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Receive loop ended with error"),
                Err(e) => warn!(error = %e, "Receive loop task failed"),
            }
        }

        teardown_all(&subscriptions).await;
        stop_all(&publishers).await;
        self.transition(Lifecycle::Stopped);
        info!(service = %self.name, "Service stopped");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register application routes, then set up every subscription against
    /// the same routing table.
    async fn setup_subscriptions(
        &mut self,
        env: &ServiceEnv,
        routes: Vec<(String, MethodRouter<Arc<ServiceContext>>)>,
        token: &CancellationToken,
    ) -> Result<Router<Arc<ServiceContext>>, ServiceError> {
        let mut setup = SetupContext::new(
            &self.name,
            &self.version,
            env,
            self.broker.clone(),
            Router::new(),
            token.clone(),
        );
        for (path, method_router) in routes {
            if !setup.route(&path, method_router) {
                return Err(ServiceError::RouteConflict(path));
            }
        }
        if !setup.has_route(server::HEALTH_PATH) {
            setup.route(server::HEALTH_PATH, server::health_route());
        }

        for (index, subscription) in self.subscriptions.iter_mut().enumerate() {
            subscription.setup(&mut setup, index).await?;
        }
        Ok(setup.into_router())
    }

    /// Release whatever startup managed to create.
    async fn cleanup(&mut self, publishers: &HashMap<String, Arc<Publisher>>) {
        let subscriptions: Vec<Arc<dyn Subscription>> =
            std::mem::take(&mut self.subscriptions).into_iter().map(Arc::from).collect();
        teardown_all(&subscriptions).await;
        stop_all(publishers).await;
        self.transition(Lifecycle::Stopped);
    }

    fn transition(&self, next: Lifecycle) {
        self.lifecycle.send_replace(next);
        info!(service = %self.name, state = ?next, "Lifecycle transition");
    }
}

/// Create and set up one publisher per output event type.
///
/// Publishers are recorded before setup so a failure can still stop them.
async fn setup_publishers(
    broker: &Arc<dyn Broker>,
    outputs: &[String],
    env: &ServiceEnv,
    publishers: &mut HashMap<String, Arc<Publisher>>,
) -> Result<(), ServiceError> {
    let project_id = env.require_project_id().unwrap_or_default();
    for event_type in outputs {
        let publisher = Arc::new(Publisher::for_event_type(
            broker.clone(),
            project_id,
            event_type,
        ));
        publishers.insert(event_type.clone(), publisher.clone());
        publisher.setup().await?;
    }
    Ok(())
}

/// Resolve with the first receive loop failure. Never resolves if every loop
/// ends cleanly.
async fn first_listen_error(listeners: &mut JoinSet<Result<(), SubscriptionError>>) -> SubscriptionError {
    loop {
        match listeners.join_next().await {
            Some(Ok(Ok(()))) => continue,
            Some(Ok(Err(e))) => return e,
            Some(Err(e)) => {
                return SubscriptionError::Listen {
                    name: "unknown".to_string(),
                    message: e.to_string(),
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Tear down every subscription; one failure does not stop the rest.
async fn teardown_all(subscriptions: &[Arc<dyn Subscription>]) {
    for subscription in subscriptions {
        if let Err(e) = subscription.teardown().await {
            error!(
                subscription = subscription.name().unwrap_or("unnamed"),
                error = %e,
                "Subscription teardown failed"
            );
        }
    }
}

async fn stop_all(publishers: &HashMap<String, Arc<Publisher>>) {
    for publisher in publishers.values() {
        publisher.stop().await;
    }
}

#[cfg(test)]
mod tests;
