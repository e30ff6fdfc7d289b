//! Connector configuration surface.
//!
//! Options are resolved in priority order: explicit builder calls, then
//! `ALLOYDB_CONNECTOR_`-prefixed environment variables, then built-in defaults.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::control_plane::CredentialsProvider;
use crate::driver::DriverAdapter;
use crate::error::ConnectorError;
use crate::ip_type::IpType;

const DEFAULT_ALLOYDB_API_ENDPOINT: &str = "alloydb.googleapis.com";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_CONTROL_PLANE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRY_BACKOFF_MS: u64 = 30_000;
const DEFAULT_REFRESH_BUFFER_SECONDS: i64 = 240;

/// Strips a leading `http://` or `https://` from an endpoint, leaving a bare host.
pub fn strip_http_prefix(endpoint: &str) -> String {
    endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint)
        .to_string()
}

/// Resolved connector configuration.
#[derive(Clone)]
pub struct ConnectorOptions {
    pub alloydb_api_endpoint: String,
    pub(crate) control_plane_url: String,
    pub quota_project: Option<String>,
    pub ip_type: IpType,
    pub user_agent: Option<String>,
    pub enable_iam_auth: bool,
    pub default_driver: String,
    pub log_level: String,
    pub refresh_buffer_seconds: i64,
    pub control_plane_timeout: Duration,
    pub max_retry_backoff: Duration,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub(crate) extra_drivers: HashMap<String, Arc<dyn DriverAdapter>>,
}

impl ConnectorOptions {
    pub fn builder(credentials: Arc<dyn CredentialsProvider>) -> ConnectorOptionsBuilder {
        ConnectorOptionsBuilder::new(credentials)
    }
}

/// Builder for [`ConnectorOptions`].
pub struct ConnectorOptionsBuilder {
    alloydb_api_endpoint: Option<String>,
    quota_project: Option<String>,
    ip_type: Option<IpType>,
    user_agent: Option<String>,
    enable_iam_auth: bool,
    default_driver: Option<String>,
    log_level: Option<String>,
    refresh_buffer_seconds: Option<i64>,
    control_plane_timeout_ms: Option<u64>,
    max_retry_backoff_ms: Option<u64>,
    credentials: Arc<dyn CredentialsProvider>,
    extra_drivers: HashMap<String, Arc<dyn DriverAdapter>>,
}

impl std::fmt::Debug for ConnectorOptionsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorOptionsBuilder")
            .field("alloydb_api_endpoint", &self.alloydb_api_endpoint)
            .field("quota_project", &self.quota_project)
            .field("ip_type", &self.ip_type)
            .field("user_agent", &self.user_agent)
            .field("enable_iam_auth", &self.enable_iam_auth)
            .field("default_driver", &self.default_driver)
            .field("log_level", &self.log_level)
            .field("refresh_buffer_seconds", &self.refresh_buffer_seconds)
            .field("control_plane_timeout_ms", &self.control_plane_timeout_ms)
            .field("max_retry_backoff_ms", &self.max_retry_backoff_ms)
            .finish_non_exhaustive()
    }
}

impl ConnectorOptionsBuilder {
    pub fn new(credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            alloydb_api_endpoint: None,
            quota_project: None,
            ip_type: None,
            user_agent: None,
            enable_iam_auth: false,
            default_driver: None,
            log_level: None,
            refresh_buffer_seconds: None,
            control_plane_timeout_ms: None,
            max_retry_backoff_ms: None,
            credentials,
            extra_drivers: HashMap::new(),
        }
    }

    /// Sets the control-plane endpoint. May be a bare host (the common case, always reached
    /// over TLS) or a full `http(s)://host:port` URL. Either way, [`ConnectorOptions::alloydb_api_endpoint`]
    /// is normalized to a bare host at `build()` time; an explicit scheme only controls which
    /// transport is actually dialed, which is what lets tests and local emulators point the
    /// connector at a plaintext mock server.
    pub fn alloydb_api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.alloydb_api_endpoint = Some(endpoint.into());
        self
    }

    pub fn quota_project(mut self, project: impl Into<String>) -> Self {
        self.quota_project = Some(project.into());
        self
    }

    /// Sets the default IP type. Fails fast here (rather than deferring to `connect()`) since
    /// the value was provided eagerly.
    pub fn ip_type(mut self, ip_type: &str) -> Result<Self, ConnectorError> {
        self.ip_type = Some(ip_type.parse()?);
        Ok(self)
    }

    pub fn user_agent(mut self, suffix: impl Into<String>) -> Self {
        self.user_agent = Some(suffix.into());
        self
    }

    pub fn enable_iam_auth(mut self, enabled: bool) -> Self {
        self.enable_iam_auth = enabled;
        self
    }

    pub fn driver(mut self, name: impl Into<String>) -> Self {
        self.default_driver = Some(name.into());
        self
    }

    /// Registers an additional driver adapter, extending the built-in set.
    pub fn with_driver(mut self, name: impl Into<String>, adapter: Arc<dyn DriverAdapter>) -> Self {
        self.extra_drivers.insert(name.into(), adapter);
        self
    }

    pub fn log_level(mut self, directive: impl Into<String>) -> Self {
        self.log_level = Some(directive.into());
        self
    }

    pub fn refresh_buffer_seconds(mut self, seconds: i64) -> Self {
        self.refresh_buffer_seconds = Some(seconds);
        self
    }

    pub fn control_plane_timeout_ms(mut self, ms: u64) -> Self {
        self.control_plane_timeout_ms = Some(ms);
        self
    }

    pub fn max_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.max_retry_backoff_ms = Some(ms);
        self
    }

    pub fn build(self) -> ConnectorOptions {
        let env = |key: &str| std::env::var(format!("ALLOYDB_CONNECTOR_{}", key)).ok();

        let ip_type = self.ip_type.unwrap_or(IpType::Public);

        let raw_endpoint = self
            .alloydb_api_endpoint
            .or_else(|| env("ALLOYDB_API_ENDPOINT"))
            .unwrap_or_else(|| DEFAULT_ALLOYDB_API_ENDPOINT.to_string());
        let control_plane_url = if raw_endpoint.contains("://") {
            raw_endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", raw_endpoint)
        };

        ConnectorOptions {
            alloydb_api_endpoint: strip_http_prefix(&raw_endpoint),
            control_plane_url,
            quota_project: self.quota_project.or_else(|| env("QUOTA_PROJECT")),
            ip_type,
            user_agent: self.user_agent.or_else(|| env("USER_AGENT")),
            enable_iam_auth: self.enable_iam_auth,
            default_driver: self
                .default_driver
                .or_else(|| env("DRIVER"))
                .unwrap_or_else(|| "generic".to_string()),
            log_level: self
                .log_level
                .or_else(|| env("LOG_LEVEL"))
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            refresh_buffer_seconds: self
                .refresh_buffer_seconds
                .or_else(|| env("REFRESH_BUFFER_SECONDS").and_then(|v| v.parse().ok()))
                .unwrap_or(DEFAULT_REFRESH_BUFFER_SECONDS),
            control_plane_timeout: Duration::from_millis(
                self.control_plane_timeout_ms
                    .or_else(|| env("CONTROL_PLANE_TIMEOUT_MS").and_then(|v| v.parse().ok()))
                    .unwrap_or(DEFAULT_CONTROL_PLANE_TIMEOUT_MS),
            ),
            max_retry_backoff: Duration::from_millis(
                self.max_retry_backoff_ms
                    .or_else(|| env("MAX_RETRY_BACKOFF_MS").and_then(|v| v.parse().ok()))
                    .unwrap_or(DEFAULT_MAX_RETRY_BACKOFF_MS),
            ),
            credentials: self.credentials,
            extra_drivers: self.extra_drivers,
        }
    }
}
