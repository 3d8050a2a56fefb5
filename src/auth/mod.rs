//! Authenticated outbound HTTP requests.
//!
//! Requests to `https` URLs get an `Authorization: Bearer <token>` header
//! carrying an identity token for the target URL. Tokens come from an
//! [`IdentityTokenSource`], by default the compute metadata service. A
//! metadata service that is briefly unavailable is retried with budgeted
//! exponential backoff ([`Backoff::metadata`]).
//!
//! Plain `http` URLs are sent unauthenticated.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use reqwest::{Client, Method, Request, Response, Url};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::utils::retry::Backoff;

mod metadata;

pub use metadata::{
    IdentityTokenSource, MetadataError, MetadataTokenSource, DEFAULT_METADATA_HOST,
    METADATA_HOST_ENV_VAR,
};

/// Errors that can occur while building or sending an authenticated request.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Timed out fetching identity token after {attempts} attempts over {elapsed:?}: {last_error}")]
    Timeout {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    #[error("Identity token unavailable: {0}")]
    Metadata(#[source] MetadataError),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Builds and sends requests, attaching identity tokens where needed.
#[derive(Clone)]
pub struct Authenticator {
    client: Client,
    source: Arc<dyn IdentityTokenSource>,
    backoff: Backoff,
}

impl Authenticator {
    /// Authenticator using the metadata service (host from the environment).
    pub fn new(client: Client) -> Self {
        let source = Arc::new(MetadataTokenSource::from_env(client.clone()));
        Self {
            client,
            source,
            backoff: Backoff::metadata(),
        }
    }

    pub fn with_token_source(mut self, source: Arc<dyn IdentityTokenSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build a request for `url`, authenticated if `url` is `https`.
    pub async fn build_request(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Request, AuthError> {
        let parsed = Url::parse(url).map_err(|e| AuthError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let mut builder = self.client.request(method, parsed.clone());
        if let Some(body) = body {
            builder = builder.body(body);
        }

        if parsed.scheme() == "https" {
            let token = self.fetch_token(url).await?;
            builder = builder.bearer_auth(token);
        } else {
            debug!(url = %url, "Plain URL, sending without identity token");
        }

        Ok(builder.build()?)
    }

    /// Build and execute a request.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, AuthError> {
        let request = self.build_request(method, url, body).await?;
        Ok(self.client.execute(request).await?)
    }

    /// Fetch an identity token for `audience`, retrying transient failures
    /// until the backoff budget is spent.
    pub async fn fetch_token(&self, audience: &str) -> Result<String, AuthError> {
        let start = Instant::now();
        let attempts = AtomicU32::new(0);
        let source = &self.source;

        let result = (|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            source.identity_token(audience)
        })
        .retry(self.backoff.clone())
        .sleep(tokio::time::sleep)
        .when(MetadataError::is_retryable)
        .notify(|err: &MetadataError, dur: Duration| {
            warn!(
                audience = %audience,
                error = %err,
                delay = ?dur,
                "Identity token fetch failed, retrying"
            );
        })
        .await;

        match result {
            Ok(token) => Ok(token),
            Err(e) if e.is_retryable() => Err(AuthError::Timeout {
                attempts: attempts.load(Ordering::SeqCst),
                elapsed: start.elapsed(),
                last_error: e.to_string(),
            }),
            Err(e) => Err(AuthError::Metadata(e)),
        }
    }
}

/// Build a request for `url`, authenticated against the metadata service
/// when `url` is `https`.
pub async fn build_authenticated_request(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Vec<u8>>,
) -> Result<Request, AuthError> {
    Authenticator::new(client.clone())
        .build_request(method, url, body)
        .await
}

/// Build and send a request, authenticated when `url` is `https`.
pub async fn send_authenticated(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Vec<u8>>,
) -> Result<Response, AuthError> {
    Authenticator::new(client.clone())
        .send(method, url, body)
        .await
}
