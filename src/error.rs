//! # Error Handling
//!
//! Unified error type for the connector. Every fallible public operation returns
//! [`ConnectorError`], and variant `Display` text is pinned to the literal wording
//! callers may already depend on for pattern matching.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Bad input supplied synchronously, before any I/O is attempted.
    #[error("{0}")]
    InvalidArgument(String),

    /// The connector has already been closed.
    #[error("Connection attempt failed because the connector has already been closed.")]
    ClosedConnector,

    /// The per-instance refresher backing this URI has been closed (evicted).
    #[error("refresher for instance is closed")]
    RefresherClosed,

    /// The instance does not expose an address for the requested IP type.
    #[error("AlloyDB instance does not have an IP addresses matching type: '{0}'")]
    IpTypeNotFound(String),

    /// A control-plane RPC failed.
    #[error("control-plane request failed: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// The initial fetch for an instance has not yet produced a usable credential.
    #[error("failed to fetch connection info: {0}")]
    RefreshFailed(String),

    /// Building or applying the TLS client configuration failed.
    #[error("tls configuration error: {0}")]
    Tls(#[from] TlsError),

    /// Dialing the instance failed.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// The calling context was cancelled (deadline elapsed or explicit cancellation).
    #[error("operation cancelled")]
    Cancelled,

    /// Key-pair generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Obtaining a bearer token from the configured credentials provider failed.
    #[error("failed to obtain credentials: {0}")]
    Credentials(String),
}

/// Errors surfaced by the control-plane HTTP client.
#[derive(Debug, Clone, Error)]
pub enum ControlPlaneError {
    /// The instance does not exist, or the caller lacks permission to see it. Terminal:
    /// the cache entry for this URI must be evicted and no further refresh attempted.
    #[error("instance not found")]
    NotFound,

    /// A non-2xx response was returned for a reason other than "not found". Retryable by
    /// the background refresh loop.
    #[error("control-plane returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be parsed into the expected shape.
    #[error("malformed control-plane response: {0}")]
    MalformedResponse(String),

    /// A transport-level failure: DNS, TCP, TLS to the control plane itself, or timeout.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ControlPlaneError {
    /// Terminal errors mean the instance will never succeed and the cache entry should be
    /// evicted rather than retried by the background refresh loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControlPlaneError::NotFound)
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        ControlPlaneError::Transport(err.to_string())
    }
}

/// Errors building or applying a pinned TLS client configuration.
#[derive(Debug, Clone, Error)]
pub enum TlsError {
    #[error("invalid CA certificate: {0}")]
    InvalidCaCert(String),

    #[error("invalid certificate chain: {0}")]
    InvalidCertChain(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("empty certificate chain")]
    EmptyCertChain,

    #[error("rustls configuration error: {0}")]
    Rustls(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_connector_message_is_pinned() {
        let err = ConnectorError::ClosedConnector;
        assert_eq!(
            err.to_string(),
            "Connection attempt failed because the connector has already been closed."
        );
    }

    #[test]
    fn ip_type_not_found_includes_requested_type() {
        let err = ConnectorError::IpTypeNotFound("PRIVATE".to_string());
        assert_eq!(
            err.to_string(),
            "AlloyDB instance does not have an IP addresses matching type: 'PRIVATE'"
        );
    }

    #[test]
    fn invalid_argument_renders_verbatim() {
        let err = ConnectorError::InvalidArgument(
            "Incorrect value for ip_type, got 'BAD-IP-TYPE'. Want one of: 'PUBLIC', 'PRIVATE', 'PSC'."
                .to_string(),
        );
        assert_eq!(
            err.to_string(),
            "Incorrect value for ip_type, got 'BAD-IP-TYPE'. Want one of: 'PUBLIC', 'PRIVATE', 'PSC'."
        );
    }

    #[test]
    fn control_plane_not_found_is_terminal() {
        assert!(ControlPlaneError::NotFound.is_terminal());
        assert!(!ControlPlaneError::Transport("boom".into()).is_terminal());
        assert!(
            !ControlPlaneError::Status {
                status: 500,
                body: String::new()
            }
            .is_terminal()
        );
    }
}
