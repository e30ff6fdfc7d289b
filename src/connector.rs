//! The public facade: validates inputs, resolves credentials through the cache, dials, and
//! hands an authenticated socket to a driver adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::config::ConnectorOptions;
use crate::control_plane::ControlPlaneClient;
use crate::driver::{connect_tls, AuthenticatedStream, DriverRegistry};
use crate::error::ConnectorError;
use crate::instance_uri::InstanceUri;
use crate::ip_type::IpType;

const DEFAULT_PORT: u16 = 5433;

/// Entry point for establishing authenticated connections to managed instances.
///
/// A `Connector` owns its own credential cache and driver registry; multiple connectors in
/// the same process are fully independent.
pub struct Connector {
    options: Arc<ConnectorOptions>,
    cache: Arc<Cache>,
    drivers: DriverRegistry,
    closed: AtomicBool,
}

impl Connector {
    pub fn new(options: ConnectorOptions) -> Self {
        let extra_drivers = options.extra_drivers.clone();
        let options = Arc::new(options);

        info!(endpoint = %options.alloydb_api_endpoint, "initializing connector");

        let control_plane = Arc::new(ControlPlaneClient::new(
            options.control_plane_url.clone(),
            Some(options.default_driver.as_str()),
            options.user_agent.as_deref(),
            options.quota_project.clone(),
            options.credentials.clone(),
            options.control_plane_timeout,
        ));

        Self {
            cache: Cache::new(control_plane, options.clone()),
            drivers: DriverRegistry::new(extra_drivers),
            options,
            closed: AtomicBool::new(false),
        }
    }

    /// Establishes an authenticated connection to `uri` over `driver`, using `ip_type` if
    /// given or the connector's configured default otherwise.
    pub async fn connect(
        &self,
        uri: &str,
        driver: &str,
        ip_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AuthenticatedStream, ConnectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::ClosedConnector);
        }

        let ip_type = match ip_type {
            Some(value) => value.parse::<IpType>()?,
            None => self.options.ip_type,
        };

        let adapter = self.drivers.get(driver)?;
        let instance_uri = InstanceUri::parse(uri)?;

        let refresher = self.cache.get(&instance_uri).await;
        let connection_info = refresher.get_connection_info(cancel).await?;

        let addr = match connection_info.preferred_ip(ip_type) {
            Ok(addr) => addr.to_string(),
            Err(err) => {
                self.cache.evict(&instance_uri).await;
                return Err(err);
            }
        };

        let dial_result = self.dial(&addr, &connection_info, cancel).await;

        match dial_result {
            Ok(stream) => adapter.finish_connect(stream).await,
            Err(err) => {
                warn!(instance = %instance_uri.instance, "connect failed, forcing refresh");
                refresher.force_refresh();
                Err(err)
            }
        }
    }

    async fn dial(
        &self,
        addr: &str,
        connection_info: &crate::connection_info::ConnectionInfo,
        cancel: &CancellationToken,
    ) -> Result<AuthenticatedStream, ConnectorError> {
        let tcp = tokio::select! {
            result = TcpStream::connect((addr, DEFAULT_PORT)) => {
                result.map_err(ConnectorError::Connect)?
            }
            _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
        };

        let tls_config = connection_info.tls_config()?;
        let server_name = rustls_pki_types::ServerName::try_from(connection_info.instance_uid.clone())
            .map_err(|err| {
                ConnectorError::Tls(crate::error::TlsError::Rustls(err.to_string()))
            })?;

        tokio::select! {
            result = connect_tls(tcp, tls_config, server_name) => {
                result.map_err(ConnectorError::Connect)
            }
            _ = cancel.cancelled() => Err(ConnectorError::Cancelled),
        }
    }

    /// Closes the connector: evicts and closes every cached refresher. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing connector");
        self.cache.evict_all().await;
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!("Connector dropped without calling close(); resources are released best-effort");
        }
    }
}
