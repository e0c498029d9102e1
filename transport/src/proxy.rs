//! Forward proxy configuration
//!
//! A `ProxyEndpoint` is immutable configuration built once at SDK start. When
//! it carries a CA certificate the proxy itself speaks TLS, and an optional
//! client certificate/key pair enables mutual TLS towards the proxy.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::types::HttpRequestSpec;

/// Credentials presented to the proxy as a `Proxy-Authorization` value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProxyCredentials {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl ProxyCredentials {
    pub fn header_value(&self) -> String {
        match self {
            ProxyCredentials::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password).as_bytes());
                format!("Basic {}", encoded)
            }
            ProxyCredentials::Bearer { token } => format!("Bearer {}", token),
        }
    }
}

/// Forward proxy endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    /// Credentials used to answer a 407 challenge when no custom authenticator
    /// is configured.
    #[serde(default)]
    pub credentials: Option<ProxyCredentials>,
    /// PEM CA bundle used to validate the proxy's own certificate. When set,
    /// the proxy connection is wrapped in TLS before the CONNECT exchange.
    #[serde(default)]
    pub ca_pem: Option<String>,
    /// PEM client certificate chain for mutual TLS towards the proxy.
    #[serde(default)]
    pub client_cert_pem: Option<String>,
    /// PEM private key matching `client_cert_pem`.
    #[serde(default)]
    pub client_key_pem: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            ca_pem: None,
            client_cert_pem: None,
            client_key_pem: None,
        }
    }

    /// Whether reaching this proxy requires a TLS handshake of its own.
    pub fn requires_tls(&self) -> bool {
        self.ca_pem.is_some() || self.client_cert_pem.is_some()
    }
}

/// Supplies a `Proxy-Authorization` value in response to a 407 challenge.
///
/// Invoked at most once per request; the engine retries the whole request on a
/// fresh connection with the returned value attached. Returning `None` lets
/// the challenge propagate to the caller.
pub trait ProxyAuthenticator: Send + Sync {
    fn proxy_authorization(&self, request: &HttpRequestSpec) -> Option<String>;
}

/// Default authenticator answering challenges with the endpoint's static
/// credentials.
pub(crate) struct CredentialsAuthenticator {
    credentials: ProxyCredentials,
}

impl CredentialsAuthenticator {
    pub(crate) fn new(credentials: ProxyCredentials) -> Self {
        Self { credentials }
    }
}

impl ProxyAuthenticator for CredentialsAuthenticator {
    fn proxy_authorization(&self, _request: &HttpRequestSpec) -> Option<String> {
        Some(self.credentials.header_value())
    }
}
