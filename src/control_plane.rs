//! Thin HTTP client for the two control-plane RPCs: metadata lookup and certificate issuance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::ControlPlaneError;
use crate::instance_uri::InstanceUri;
use crate::ip_type::IpType;

const PACKAGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Supplies the bearer token presented to the control plane. Consulted once per request; its
/// own refresh/caching strategy is the implementor's concern.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn token(&self) -> Result<String, crate::error::ConnectorError>;
}

/// A credentials provider that always returns the same token, useful for local development
/// and tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl CredentialsProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, crate::error::ConnectorError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// A credentials provider backed by an OAuth2 refresh token, refetching an access token
/// whenever the cached one is missing or the caller forces a refresh.
pub struct OAuth2RefreshingProvider {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<String>>,
}

impl OAuth2RefreshingProvider {
    pub fn new(
        client_id: String,
        client_secret: String,
        token_url: String,
        refresh_token: String,
    ) -> Self {
        Self {
            http: Client::new(),
            token_url,
            client_id,
            client_secret,
            refresh_token,
            cached: Mutex::new(None),
        }
    }

    /// Drops the cached access token, forcing the next call to `token()` to refetch.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[async_trait]
impl CredentialsProvider for OAuth2RefreshingProvider {
    async fn token(&self) -> Result<String, crate::error::ConnectorError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let mut params = HashMap::new();
        params.insert("client_id", self.client_id.as_str());
        params.insert("client_secret", self.client_secret.as_str());
        params.insert("refresh_token", self.refresh_token.as_str());
        params.insert("grant_type", "refresh_token");

        let response = self
            .http
            .post(&self.token_url)
            .header("accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|err| crate::error::ConnectorError::Credentials(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(crate::error::ConnectorError::Credentials(format!(
                "token refresh failed with status {}: {}",
                status, body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|err| crate::error::ConnectorError::Credentials(err.to_string()))?;

        *cached = Some(parsed.access_token.clone());
        Ok(parsed.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionInfoResponse {
    #[serde(rename = "ipAddress")]
    ip_address: Option<String>,
    #[serde(rename = "publicIpAddress")]
    public_ip_address: Option<String>,
    #[serde(rename = "pscDnsName")]
    psc_dns_name: Option<String>,
    #[serde(rename = "instanceUid")]
    instance_uid: String,
}

/// Network addresses by IP type, plus the instance's stable identity used for TLS verification.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    pub ip_addrs: HashMap<IpType, Option<String>>,
    pub instance_uid: String,
}

#[derive(Debug, Serialize)]
struct GenerateCertificateRequest {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "certDuration", skip_serializing_if = "Option::is_none")]
    cert_duration: Option<String>,
    #[serde(rename = "useMetadataExchange")]
    use_metadata_exchange: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateCertificateResponse {
    #[serde(rename = "caCert")]
    ca_cert: String,
    #[serde(rename = "pemCertificateChain")]
    pem_certificate_chain: Vec<String>,
}

/// Freshly issued certificate material.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub ca_cert: String,
    pub cert_chain: Vec<String>,
}

/// Client for the two AlloyDB control-plane RPCs this connector depends on.
pub struct ControlPlaneClient {
    http: Client,
    base_url: String,
    user_agent: String,
    quota_project: Option<String>,
    credentials: Arc<dyn CredentialsProvider>,
    timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: String,
        driver: Option<&str>,
        user_agent_suffix: Option<&str>,
        quota_project: Option<String>,
        credentials: Arc<dyn CredentialsProvider>,
        timeout: Duration,
    ) -> Self {
        let base_url = if base_url.contains("://") {
            base_url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", base_url)
        };

        let mut user_agent = format!("alloydb-rust-connector/{}", PACKAGE_VERSION);
        if let Some(driver) = driver {
            user_agent.push('+');
            user_agent.push_str(driver);
        }
        if let Some(suffix) = user_agent_suffix {
            user_agent.push(' ');
            user_agent.push_str(suffix);
        }

        Self {
            http: Client::new(),
            base_url,
            user_agent,
            quota_project,
            credentials,
            timeout,
        }
    }

    async fn authorized_request(
        &self,
        method: reqwest::Method,
        url: String,
    ) -> Result<reqwest::RequestBuilder, ControlPlaneError> {
        let token = self
            .credentials
            .token()
            .await
            .map_err(|err| ControlPlaneError::Transport(err.to_string()))?;

        let mut builder = self
            .http
            .request(method, url)
            .timeout(self.timeout)
            .bearer_auth(token)
            .header("user-agent", &self.user_agent);

        if let Some(quota_project) = &self.quota_project {
            builder = builder.header("x-goog-user-project", quota_project);
        }

        Ok(builder)
    }

    #[instrument(skip(self), fields(project = %uri.project, instance = %uri.instance))]
    pub async fn get_metadata(&self, uri: &InstanceUri) -> Result<InstanceMetadata, ControlPlaneError> {
        let url = format!(
            "{}/v1beta/projects/{}/locations/{}/clusters/{}/instances/{}/connectionInfo",
            self.base_url, uri.project, uri.location, uri.cluster, uri.instance
        );

        let response = self
            .authorized_request(reqwest::Method::GET, url)
            .await?
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::NotFound);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Status { status, body });
        }

        let body: ConnectionInfoResponse = response
            .json()
            .await
            .map_err(|err| ControlPlaneError::MalformedResponse(err.to_string()))?;

        debug!(instance_uid = %body.instance_uid, "received connection metadata");

        let mut ip_addrs = HashMap::new();
        ip_addrs.insert(
            IpType::Private,
            body.ip_address.filter(|addr| !addr.is_empty()),
        );
        ip_addrs.insert(
            IpType::Public,
            body.public_ip_address.filter(|addr| !addr.is_empty()),
        );
        ip_addrs.insert(IpType::Psc, body.psc_dns_name.filter(|addr| !addr.is_empty()));

        Ok(InstanceMetadata {
            ip_addrs,
            instance_uid: body.instance_uid,
        })
    }

    #[instrument(skip(self, public_key_pem), fields(project = %uri.project, instance = %uri.instance))]
    pub async fn generate_certificate(
        &self,
        uri: &InstanceUri,
        public_key_pem: &str,
    ) -> Result<IssuedCertificate, ControlPlaneError> {
        let url = format!(
            "{}/v1beta/projects/{}/locations/{}/clusters/{}:generateClientCertificate",
            self.base_url, uri.project, uri.location, uri.cluster
        );

        let request_body = GenerateCertificateRequest {
            public_key: public_key_pem.to_string(),
            cert_duration: None,
            use_metadata_exchange: false,
        };

        let response = self
            .authorized_request(reqwest::Method::POST, url)
            .await?
            .json(&request_body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::NotFound);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Status { status, body });
        }

        let body: GenerateCertificateResponse = response
            .json()
            .await
            .map_err(|err| ControlPlaneError::MalformedResponse(err.to_string()))?;

        if body.pem_certificate_chain.is_empty() {
            return Err(ControlPlaneError::MalformedResponse(
                "certificate chain was empty".to_string(),
            ));
        }

        Ok(IssuedCertificate {
            ca_cert: body.ca_cert,
            cert_chain: body.pem_certificate_chain,
        })
    }
}
