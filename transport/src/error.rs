use thiserror::Error;

/// Errors surfaced by the transport engine.
///
/// Application-level failures (non-2xx responses) are not errors here; they are
/// returned as regular responses carrying their real status code and body.
#[derive(Error, Debug)]
pub enum HttpError {
    /// DNS, connect, timeout or socket failure, including a failed TLS
    /// handshake with the proxy and a refused CONNECT tunnel.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Malformed HTTP received from the peer, or no response bytes at all.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Certificate chain untrusted, or no configured pin matched the chain.
    #[error("Certificate pinning error: {0}")]
    Pinning(String),

    /// The proxy answered 407 and the single authentication retry was already
    /// spent, or no authenticator is configured.
    #[error("Proxy authentication required: {0}")]
    ProxyAuthRequired(String),

    /// Invalid configuration, rejected at configuration time.
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HttpError>;

impl From<std::io::Error> for HttpError {
    fn from(err: std::io::Error) -> Self {
        HttpError::Connectivity(err.to_string())
    }
}
