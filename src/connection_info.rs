//! Immutable snapshot of one instance's credential and topology material.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};

use crate::error::{ConnectorError, TlsError};
use crate::ip_type::IpType;
use crate::keys::PrivateKey;
use crate::tls;

/// Everything needed to dial and authenticate to one instance, as of one refresh cycle.
///
/// `tls_config` is derived lazily on first use and memoized: once computed it never changes
/// for a given `ConnectionInfo`, and repeated calls to [`ConnectionInfo::tls_config`] return
/// the same `Arc` rather than rebuilding.
pub struct ConnectionInfo {
    pub ca_cert: String,
    pub cert_chain: Vec<String>,
    pub private_key: PrivateKey,
    pub ip_addrs: HashMap<IpType, Option<String>>,
    pub expiration: DateTime<Utc>,
    pub instance_uid: String,
    tls_config: OnceLock<Result<Arc<rustls::ClientConfig>, TlsError>>,
}

impl ConnectionInfo {
    pub fn new(
        ca_cert: String,
        cert_chain: Vec<String>,
        private_key: PrivateKey,
        ip_addrs: HashMap<IpType, Option<String>>,
        expiration: DateTime<Utc>,
        instance_uid: String,
    ) -> Self {
        Self {
            ca_cert,
            cert_chain,
            private_key,
            ip_addrs,
            expiration,
            instance_uid,
            tls_config: OnceLock::new(),
        }
    }

    /// Returns the address for the given IP type, or an error if the instance does not
    /// expose one. An empty string is treated the same as absent.
    pub fn preferred_ip(&self, ip_type: IpType) -> Result<&str, ConnectorError> {
        self.ip_addrs
            .get(&ip_type)
            .and_then(|addr| addr.as_deref())
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| ConnectorError::IpTypeNotFound(ip_type.to_string()))
    }

    /// Lazily derives (and memoizes) the TLS client configuration for this snapshot.
    pub fn tls_config(&self) -> Result<Arc<rustls::ClientConfig>, ConnectorError> {
        self.tls_config
            .get_or_init(|| {
                tls::build_client_config(&self.ca_cert, &self.cert_chain, self.private_key.pem())
            })
            .clone()
            .map_err(ConnectorError::Tls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;
    use chrono::TimeDelta;

    fn sample() -> ConnectionInfo {
        let mut ip_addrs = HashMap::new();
        ip_addrs.insert(IpType::Public, Some("203.0.113.10".to_string()));
        ip_addrs.insert(IpType::Private, None);
        ip_addrs.insert(IpType::Psc, Some(String::new()));

        let pair = generate_key_pair().unwrap();
        ConnectionInfo::new(
            "not a real cert".to_string(),
            vec!["not a real cert".to_string()],
            pair.private_key,
            ip_addrs,
            Utc::now() + TimeDelta::hours(1),
            "instance-uid".to_string(),
        )
    }

    #[test]
    fn preferred_ip_returns_present_address() {
        let info = sample();
        assert_eq!(info.preferred_ip(IpType::Public).unwrap(), "203.0.113.10");
    }

    #[test]
    fn preferred_ip_treats_absent_as_not_found() {
        let info = sample();
        let err = info.preferred_ip(IpType::Private).unwrap_err();
        assert!(matches!(err, ConnectorError::IpTypeNotFound(_)));
    }

    #[test]
    fn preferred_ip_treats_empty_string_as_not_found() {
        let info = sample();
        let err = info.preferred_ip(IpType::Psc).unwrap_err();
        assert!(matches!(err, ConnectorError::IpTypeNotFound(_)));
    }

    #[test]
    fn tls_config_is_memoized_across_calls() {
        let info = sample();
        // Our sample certs are not valid PEM, so this is expected to fail, but it must fail
        // the same way every time and never attempt to rebuild once cached.
        let first = info.tls_config();
        let second = info.tls_config();
        assert_eq!(first.is_err(), second.is_err());
    }
}
