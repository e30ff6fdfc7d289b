//! Closed registry of database-driver dial adapters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::ConnectorError;

/// Authenticated, encrypted socket handed off to the caller once a connection has been
/// established and wrapped in TLS.
pub type AuthenticatedStream = TlsStream<tokio::net::TcpStream>;

/// A named dial strategy, selected by `driver` at `connect()` time.
///
/// Most drivers have no special handling beyond returning the raw TLS stream; the trait
/// exists so database-specific connectors (e.g. ones that need to speak a short handshake
/// before handing control to application code) can be registered without forking the
/// connector facade.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    async fn finish_connect(
        &self,
        stream: AuthenticatedStream,
    ) -> Result<AuthenticatedStream, ConnectorError>;
}

impl std::fmt::Debug for dyn DriverAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn DriverAdapter").finish_non_exhaustive()
    }
}

/// Adapter suitable for any driver that just wants a ready-to-use TLS stream.
pub struct GenericAdapter;

#[async_trait]
impl DriverAdapter for GenericAdapter {
    async fn finish_connect(
        &self,
        stream: AuthenticatedStream,
    ) -> Result<AuthenticatedStream, ConnectorError> {
        Ok(stream)
    }
}

/// Maps driver name to adapter. Owned by each [`crate::connector::Connector`] instance, not
/// global, since `ConnectorOptionsBuilder::with_driver` lets callers register adapters that
/// should not leak across unrelated connectors in the same process.
pub struct DriverRegistry {
    adapters: HashMap<String, Arc<dyn DriverAdapter>>,
}

impl DriverRegistry {
    pub fn new(extra: HashMap<String, Arc<dyn DriverAdapter>>) -> Self {
        let mut adapters: HashMap<String, Arc<dyn DriverAdapter>> = HashMap::new();
        adapters.insert("generic".to_string(), Arc::new(GenericAdapter));
        adapters.extend(extra);
        Self { adapters }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DriverAdapter>, ConnectorError> {
        self.adapters.get(name).cloned().ok_or_else(|| {
            debug!(driver = name, "unsupported driver requested");
            ConnectorError::InvalidArgument(format!(
                "Driver '{}' is not a supported database driver.",
                name
            ))
        })
    }
}

/// Connects a raw TCP stream over TLS using the given client configuration, via SNI of
/// `server_name`.
pub async fn connect_tls(
    tcp: tokio::net::TcpStream,
    config: Arc<rustls::ClientConfig>,
    server_name: rustls_pki_types::ServerName<'static>,
) -> Result<AuthenticatedStream, std::io::Error> {
    let connector = TlsConnector::from(config);
    connector.connect(server_name, tcp).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_adapter_is_registered_by_default() {
        let registry = DriverRegistry::new(HashMap::new());
        assert!(registry.get("generic").is_ok());
    }

    #[test]
    fn unknown_driver_produces_pinned_message() {
        let registry = DriverRegistry::new(HashMap::new());
        let err = registry.get("oracle").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Driver 'oracle' is not a supported database driver."
        );
    }
}
