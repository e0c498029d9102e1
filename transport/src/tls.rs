//! TLS connector construction
//!
//! Two distinct trust contexts exist per request: the origin's (webpki roots)
//! and, when the proxy itself speaks TLS, the proxy's (the CA bundle supplied
//! in the proxy configuration, plus an optional client identity for mTLS).
//! They are deliberately independent so the proxy CA never gains authority
//! over origin connections.

use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsConnector;

use crate::error::{HttpError, Result};
use crate::proxy::ProxyEndpoint;

/// Connector for origin servers, trusting the webpki (Mozilla) root set.
pub(crate) fn origin_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Connector for a TLS-protected proxy, trusting only the configured CA bundle
/// and presenting a client identity when one is configured.
pub(crate) fn proxy_connector(endpoint: &ProxyEndpoint) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    match endpoint.ca_pem.as_deref() {
        Some(ca_pem) => {
            for cert in load_certificates(ca_pem)? {
                root_store.add(cert).map_err(|e| {
                    HttpError::Config(format!("Failed to add proxy CA certificate: {}", e))
                })?;
            }
        }
        // mTLS against a proxy with a publicly trusted certificate.
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = match (&endpoint.client_cert_pem, &endpoint.client_key_pem) {
        (Some(cert_pem), Some(key_pem)) => {
            let cert_chain = load_certificates(cert_pem)?;
            let private_key = load_private_key(key_pem)?;
            builder
                .with_client_auth_cert(cert_chain, private_key)
                .map_err(|e| {
                    HttpError::Config(format!("Failed to configure proxy client identity: {}", e))
                })?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(HttpError::Config(
                "Proxy client certificate and key must both be configured for mutual TLS"
                    .to_string(),
            ))
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse all certificates from a PEM bundle.
pub(crate) fn load_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());

    let parsed: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| HttpError::Config(format!("Failed to parse PEM certificates: {}", e)))?;

    if parsed.is_empty() {
        return Err(HttpError::Config(
            "No certificates found in PEM data".to_string(),
        ));
    }

    Ok(parsed)
}

/// Parse a private key from PEM data, trying PKCS#8 first, then RSA.
pub(crate) fn load_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let pkcs8_keys: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| HttpError::Config(format!("Failed to parse PKCS#8 keys: {}", e)))?;

    if let Some(key) = pkcs8_keys.into_iter().next() {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = BufReader::new(pem.as_bytes());
    let rsa_keys: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| HttpError::Config(format!("Failed to parse RSA keys: {}", e)))?;

    if let Some(key) = rsa_keys.into_iter().next() {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    Err(HttpError::Config(
        "No private key found in PEM data".to_string(),
    ))
}
