//! Builds a `rustls` client configuration pinned to a single issuing CA.

use std::sync::Arc;

use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::TlsError;

/// Builds a TLS client configuration that trusts only `ca_cert_pem`, presents
/// `cert_chain_pem` + `private_key_pem` as the client identity, and pins TLS 1.3 as the
/// minimum (and, with only one version offered, the only) negotiated protocol version.
pub fn build_client_config(
    ca_cert_pem: &str,
    cert_chain_pem: &[String],
    private_key_pem: &str,
) -> Result<Arc<rustls::ClientConfig>, TlsError> {
    if cert_chain_pem.is_empty() {
        return Err(TlsError::EmptyCertChain);
    }

    let mut root_store = RootCertStore::empty();
    let ca_certs = parse_certs(ca_cert_pem).map_err(TlsError::InvalidCaCert)?;
    for cert in ca_certs {
        root_store
            .add(cert)
            .map_err(|err| TlsError::InvalidCaCert(err.to_string()))?;
    }

    let mut client_certs = Vec::new();
    for pem in cert_chain_pem {
        client_certs.extend(parse_certs(pem).map_err(TlsError::InvalidCertChain)?);
    }

    let private_key = parse_private_key(private_key_pem).map_err(TlsError::InvalidPrivateKey)?;

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|err| TlsError::Rustls(err.to_string()))?
    .with_root_certificates(root_store)
    .with_client_auth_cert(client_certs, private_key)
    .map_err(|err| TlsError::Rustls(err.to_string()))?;

    Ok(Arc::new(config))
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| err.to_string())
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, String> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "no private key found in PEM input".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_certificate_chain() {
        let err = build_client_config("ca", &[], "key").unwrap_err();
        assert!(matches!(err, TlsError::EmptyCertChain));
    }

    #[test]
    fn rejects_unparseable_ca_certificate() {
        let err = build_client_config("not a pem", &["also not a pem".to_string()], "nope")
            .unwrap_err();
        assert!(matches!(err, TlsError::InvalidCaCert(_)));
    }
}
