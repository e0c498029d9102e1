//! flagwire-transport - HTTP transport engine for the flagwire SDK
//!
//! The SDK must reach its backend over HTTPS from environments that force
//! traffic through a forward proxy, including proxies that themselves demand
//! TLS (and mutual TLS) before a tunnel exists. Stock client stacks cannot
//! express "TLS-protected proxy, tunnelling to a TLS-protected origin", so
//! this crate implements its own:
//! - Raw HTTP/1.1 request/response codec (chunked, fixed-length and
//!   close-terminated bodies)
//! - CONNECT tunnel establishment, plain or wrapped in the proxy's own TLS
//!   session, with a second independent TLS handshake layered inside for
//!   HTTPS origins
//! - Certificate pin verification over the origin's public keys, with
//!   wildcard host matching
//! - A single automatic retry on proxy authentication challenges
//!
//! Every request is an independent, close-after-use exchange executed on the
//! invoking task.

pub mod client;
pub mod error;
pub mod pinning;
pub mod proxy;
pub mod stream;
pub mod tunnel;
pub mod types;

mod http1;
mod tls;

pub use client::{HttpClient, HttpClientBuilder};
pub use error::{HttpError, Result};
pub use pinning::{
    CertificateChecker, CertificatePin, ChainCleaner, PinAlgorithm, PinningConfiguration,
    ValidatedCert, WebpkiChainCleaner,
};
pub use proxy::{ProxyAuthenticator, ProxyCredentials, ProxyEndpoint};
pub use stream::StreamHandle;
pub use types::{Headers, HttpMethod, HttpRequestSpec, HttpResponseRecord};
