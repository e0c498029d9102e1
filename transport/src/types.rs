//! Request and response data types
//!
//! Requests and responses are plain data. A request describes the target URL,
//! method, headers and optional body; the response carries the parsed status,
//! headers, body and the certificate chain observed on the connection. All
//! fields use owned types so values can move freely between tasks.

use rustls::pki_types::CertificateDer;
use url::Url;

use crate::error::{HttpError, Result};

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

/// HTTP method for a request. GET carries no body; POST may carry a UTF-8 body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn name(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// Ordered header set. Names are case-insensitive for lookup and
/// case-preserving on the wire. Empty names or values are rejected at
/// construction time rather than silently dropped.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing value for the same name.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        if name.trim().is_empty() || value.trim().is_empty() {
            return Err(HttpError::Config(format!(
                "Invalid value for header {:?}: {:?}",
                name, value
            )));
        }

        for entry in &mut self.entries {
            if entry.0.eq_ignore_ascii_case(name) {
                entry.0 = name.to_string();
                entry.1 = value.to_string();
                return Ok(());
            }
        }

        self.entries.push((name.to_string(), value.to_string()));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` on top of this set; entries in `other` win.
    pub(crate) fn merged_with(&self, other: &Headers) -> Headers {
        let mut merged = self.clone();
        for (name, value) in other.iter() {
            // Both sides were validated on insertion.
            let _ = merged.set(name, value);
        }
        merged
    }
}

/// A single request to execute: target URL, method, headers, optional body and
/// whether the response will be consumed as a long-lived byte stream.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub url: Url,
    pub method: HttpMethod,
    pub headers: Headers,
    pub body: Option<String>,
    pub streaming: bool,
}

impl HttpRequestSpec {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: HttpMethod::Get,
            headers: Headers::new(),
            body: None,
            streaming: false,
        }
    }

    pub fn post(url: Url, body: String) -> Self {
        Self {
            url,
            method: HttpMethod::Post,
            headers: Headers::new(),
            body: Some(body),
            streaming: false,
        }
    }

    /// A GET request whose response is consumed as a long-lived byte stream.
    pub fn stream(url: Url) -> Self {
        Self {
            url,
            method: HttpMethod::Get,
            headers: Headers::new(),
            body: None,
            streaming: true,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        self.headers.set(name, value)?;
        Ok(self)
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme().eq_ignore_ascii_case("https")
    }

    pub fn host(&self) -> Result<&str> {
        self.url
            .host_str()
            .ok_or_else(|| HttpError::Config(format!("Missing host in URL: {}", self.url)))
    }

    /// Target port, defaulting per scheme.
    pub fn port(&self) -> u16 {
        self.url
            .port()
            .unwrap_or(if self.is_https() { HTTPS_PORT } else { HTTP_PORT })
    }

    /// Whether the effective port is the default one for the scheme, in which
    /// case the Host header omits it.
    pub fn is_default_port(&self) -> bool {
        self.port() == if self.is_https() { HTTPS_PORT } else { HTTP_PORT }
    }
}

/// A fully parsed response: status, headers, materialized body and the peer
/// certificate chain observed on the connection (empty for plaintext).
#[derive(Debug)]
pub struct HttpResponseRecord {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<String>,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl HttpResponseRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/json").unwrap();

        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn header_set_preserves_insertion_order() {
        let mut headers = Headers::new();
        headers.set("Accept", "application/json").unwrap();
        headers.set("Authorization", "Bearer abc").unwrap();
        headers.set("accept", "text/plain").unwrap();

        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["accept", "Authorization"]);
        assert_eq!(headers.get("Accept"), Some("text/plain"));
    }

    #[test]
    fn empty_header_name_or_value_is_rejected() {
        let mut headers = Headers::new();
        assert!(headers.set("", "value").is_err());
        assert!(headers.set("Name", "").is_err());
        assert!(headers.set("  ", "value").is_err());
        assert!(headers.is_empty());
    }

    #[test]
    fn merged_headers_prefer_per_request_values() {
        let mut defaults = Headers::new();
        defaults.set("Authorization", "Bearer default").unwrap();
        defaults.set("Accept", "application/json").unwrap();

        let mut request = Headers::new();
        request.set("authorization", "Bearer override").unwrap();

        let merged = defaults.merged_with(&request);
        assert_eq!(merged.get("Authorization"), Some("Bearer override"));
        assert_eq!(merged.get("Accept"), Some("application/json"));
    }

    #[test]
    fn port_defaults_follow_scheme() {
        let spec = HttpRequestSpec::get(Url::parse("https://test.com/path").unwrap());
        assert_eq!(spec.port(), 443);
        assert!(spec.is_default_port());

        let spec = HttpRequestSpec::get(Url::parse("http://test.com:8080/path").unwrap());
        assert_eq!(spec.port(), 8080);
        assert!(!spec.is_default_port());
    }

    #[test]
    fn success_is_any_2xx() {
        let record = HttpResponseRecord {
            status: 204,
            headers: Headers::new(),
            body: None,
            peer_certificates: Vec::new(),
        };
        assert!(record.is_success());

        let record = HttpResponseRecord {
            status: 404,
            headers: Headers::new(),
            body: Some("not found".to_string()),
            peer_certificates: Vec::new(),
        };
        assert!(!record.is_success());
    }
}
