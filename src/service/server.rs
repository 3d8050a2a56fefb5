//! HTTP surface of the service: health route, middleware and serve loop.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, MethodRouter};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{Middleware, ServiceContext};
use crate::config::ServiceEnv;

/// Path of the built-in health check.
pub(super) const HEALTH_PATH: &str = "/";

/// `GET /` answers 200 while the process is up.
pub(super) fn health_route() -> MethodRouter<Arc<ServiceContext>> {
    get(health)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Freeze the routing table into a servable app.
pub(super) fn build_app(
    router: Router<Arc<ServiceContext>>,
    middleware: Vec<Middleware>,
    env: &ServiceEnv,
    ctx: Arc<ServiceContext>,
) -> Router {
    middleware
        .into_iter()
        .fold(router, |router, wrap| wrap(router))
        .layer(TimeoutLayer::new(env.server_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve `app` until `shutdown` is cancelled, then finish in-flight requests.
pub(super) async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
