//! Identity tokens from the compute metadata service.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

/// Environment variable overriding the metadata service host.
pub const METADATA_HOST_ENV_VAR: &str = "GCE_METADATA_HOST";

/// Default metadata service host.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";

/// Errors from an identity token source.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The metadata service answered with a server-side error.
    #[error("Metadata service error: HTTP {status}")]
    Service { status: u16 },

    /// The metadata service could not be reached.
    #[error("Metadata service unreachable: {0}")]
    Connection(String),

    #[error("Metadata request failed: {0}")]
    Other(String),
}

impl MetadataError {
    /// Whether retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetadataError::Service { .. } | MetadataError::Connection(_))
    }
}

/// Source of identity tokens for an audience.
#[async_trait]
pub trait IdentityTokenSource: Send + Sync {
    async fn identity_token(&self, audience: &str) -> Result<String, MetadataError>;
}

/// Fetches identity tokens from the local metadata service.
#[derive(Debug, Clone)]
pub struct MetadataTokenSource {
    client: Client,
    host: String,
}

impl MetadataTokenSource {
    pub fn new(client: Client) -> Self {
        Self::with_host(client, DEFAULT_METADATA_HOST)
    }

    /// Use the host from `GCE_METADATA_HOST` when set.
    pub fn from_env(client: Client) -> Self {
        match std::env::var(METADATA_HOST_ENV_VAR) {
            Ok(host) if !host.is_empty() => Self::with_host(client, host),
            _ => Self::new(client),
        }
    }

    pub fn with_host(client: Client, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into(),
        }
    }

    pub fn identity_url(&self) -> String {
        format!("http://{}{}", self.host, IDENTITY_PATH)
    }
}

#[async_trait]
impl IdentityTokenSource for MetadataTokenSource {
    async fn identity_token(&self, audience: &str) -> Result<String, MetadataError> {
        let response = self
            .client
            .get(self.identity_url())
            .query(&[("audience", audience)])
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(MetadataError::Service {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(MetadataError::Other(format!("HTTP {}", status)));
        }

        let token = response.text().await.map_err(classify)?;
        debug!(audience = %audience, "Fetched identity token");
        Ok(token.trim().to_string())
    }
}

fn classify(err: reqwest::Error) -> MetadataError {
    if err.is_connect() || err.is_timeout() {
        MetadataError::Connection(err.to_string())
    } else {
        MetadataError::Other(err.to_string())
    }
}
