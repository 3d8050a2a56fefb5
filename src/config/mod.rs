//! Service configuration.
//!
//! Settings are read from the process environment once, at startup, into a
//! [`ServiceEnv`] that is then handed to every component that needs it.

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";
/// Environment variable for server port.
pub const PORT_ENV_VAR: &str = "PORT";
/// Environment variable for the broker project identity.
pub const PROJECT_ID_ENV_VAR: &str = "PUBSUB_PROJECT_ID";
/// Environment variable for the externally reachable base URL.
pub const HOST_ENV_VAR: &str = "HOST";
/// Environment variable for the HTTP request timeout.
pub const SERVER_TIMEOUT_ENV_VAR: &str = "SERVER_TIMEOUT_SECS";
/// Environment variable for the HTTP drain timeout on shutdown.
pub const SHUTDOWN_TIMEOUT_ENV_VAR: &str = "SHUTDOWN_TIMEOUT_SECS";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;
/// Default HTTP read/write timeout.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(60);
/// Default drain timeout for in-flight HTTP requests on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("{0} must be set in the environment")]
    Missing(&'static str),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Raw environment values, keyed by lowercased variable name.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEnv {
    port: Option<String>,
    pubsub_project_id: Option<String>,
    host: Option<String>,
    server_timeout_secs: Option<String>,
    shutdown_timeout_secs: Option<String>,
}

/// Configuration read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEnv {
    /// Port the HTTP server listens on.
    pub port: u16,
    /// Broker project. Required once any subscription or publisher exists.
    pub project_id: Option<String>,
    /// Externally reachable base URL, used as push target.
    pub host: Option<String>,
    /// HTTP request timeout.
    pub server_timeout: Duration,
    /// How long shutdown waits for in-flight HTTP requests.
    pub shutdown_timeout: Duration,
}

impl Default for ServiceEnv {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            project_id: None,
            host: None,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServiceEnv {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_environment(::config::Environment::default())
    }

    /// Load configuration from an explicit environment source.
    pub fn from_environment(environment: ::config::Environment) -> Result<Self, ConfigError> {
        let raw: RawEnv = ::config::Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        let defaults = Self::default();

        Ok(Self {
            port: parse_or(PORT_ENV_VAR, raw.port, defaults.port)?,
            project_id: raw.pubsub_project_id.filter(|p| !p.is_empty()),
            host: raw.host.filter(|h| !h.is_empty()),
            server_timeout: parse_or(SERVER_TIMEOUT_ENV_VAR, raw.server_timeout_secs, 60)
                .map(Duration::from_secs)?,
            shutdown_timeout: parse_or(SHUTDOWN_TIMEOUT_ENV_VAR, raw.shutdown_timeout_secs, 5)
                .map(Duration::from_secs)?,
        })
    }

    /// Set the broker project.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set the external base URL.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the HTTP port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The broker project, or [`ConfigError::Missing`].
    pub fn require_project_id(&self) -> Result<&str, ConfigError> {
        self.project_id
            .as_deref()
            .ok_or(ConfigError::Missing(PROJECT_ID_ENV_VAR))
    }

    /// The external base URL, if set and a well-formed `http`/`https` URL.
    pub fn external_base_url(&self) -> Option<Url> {
        let url = Url::parse(self.host.as_deref()?).ok()?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Some(url),
            _ => None,
        }
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value: v,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> ::config::Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ::config::Environment::default().source(Some(source))
    }

    #[test]
    fn test_defaults_when_unset() {
        let loaded = ServiceEnv::from_environment(env(&[])).unwrap();
        assert_eq!(loaded, ServiceEnv::default());
        assert_eq!(loaded.port, 3000);
        assert_eq!(loaded.server_timeout, Duration::from_secs(60));
        assert_eq!(loaded.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_reads_all_values() {
        let loaded = ServiceEnv::from_environment(env(&[
            ("PORT", "8080"),
            ("PUBSUB_PROJECT_ID", "acme-prod"),
            ("HOST", "https://svc.example.com"),
            ("SERVER_TIMEOUT_SECS", "15"),
            ("SHUTDOWN_TIMEOUT_SECS", "2"),
        ]))
        .unwrap();

        assert_eq!(loaded.port, 8080);
        assert_eq!(loaded.project_id.as_deref(), Some("acme-prod"));
        assert_eq!(loaded.host.as_deref(), Some("https://svc.example.com"));
        assert_eq!(loaded.server_timeout, Duration::from_secs(15));
        assert_eq!(loaded.shutdown_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_port() {
        let result = ServiceEnv::from_environment(env(&[("PORT", "eighty")]));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));
    }

    #[test]
    fn test_require_project_id() {
        let config = ServiceEnv::default();
        assert!(matches!(
            config.require_project_id(),
            Err(ConfigError::Missing("PUBSUB_PROJECT_ID"))
        ));

        let config = config.with_project_id("acme");
        assert_eq!(config.require_project_id().unwrap(), "acme");
    }

    #[test]
    fn test_external_base_url() {
        let config = ServiceEnv::default();
        assert!(config.external_base_url().is_none());

        let config = ServiceEnv::default().with_host("https://svc.example.com");
        assert_eq!(
            config.external_base_url().unwrap().as_str(),
            "https://svc.example.com/"
        );

        for bad in ["svc.example.com", "ftp://svc.example.com", "not a url", "http://"] {
            let config = ServiceEnv::default().with_host(bad);
            assert!(config.external_base_url().is_none(), "{} accepted", bad);
        }
    }
}
