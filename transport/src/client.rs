//! Request executor
//!
//! Chooses a transport strategy per request (direct, proxied, or a
//! TLS-protected proxy tunnel), drives the codec over the resulting channel,
//! runs pin verification after each origin TLS handshake, and retries exactly
//! once on a proxy authentication challenge. Every request is an independent,
//! close-after-use exchange; the engine spawns nothing of its own.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{HttpError, Result};
use crate::http1;
use crate::pinning::{CertificateChecker, ChainCleaner, PinningConfiguration, WebpkiChainCleaner};
use crate::proxy::{CredentialsAuthenticator, ProxyAuthenticator, ProxyEndpoint};
use crate::stream::StreamHandle;
use crate::tls;
use crate::tunnel::{timed, timed_result, HttpChannel, TunnelChannel, TunnelEstablisher};
use crate::types::{Headers, HttpRequestSpec, HttpResponseRecord};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);
// Event streams idle far longer between bytes than one-shot responses.
const STREAMING_READ_TIMEOUT: Duration = Duration::from_secs(80);

/// How a request reaches its origin. Selected once per request from the
/// immutable configuration.
enum TransportStrategy<'a> {
    Direct,
    PlainProxy(&'a ProxyEndpoint),
    TlsProxy(&'a ProxyEndpoint),
}

impl TransportStrategy<'_> {
    fn label(&self) -> &'static str {
        match self {
            TransportStrategy::Direct => "direct",
            TransportStrategy::PlainProxy(_) => "plain-proxy",
            TransportStrategy::TlsProxy(_) => "tls-proxy",
        }
    }
}

pub struct HttpClientBuilder {
    proxy: Option<ProxyEndpoint>,
    authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    streaming_read_timeout: Duration,
    pinning: Option<PinningConfiguration>,
    chain_cleaner: Option<Arc<dyn ChainCleaner>>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            proxy: None,
            authenticator: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            streaming_read_timeout: STREAMING_READ_TIMEOUT,
            pinning: None,
            chain_cleaner: None,
        }
    }
}

impl HttpClientBuilder {
    pub fn proxy(mut self, proxy: ProxyEndpoint) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn streaming_read_timeout(mut self, timeout: Duration) -> Self {
        self.streaming_read_timeout = timeout;
        self
    }

    pub fn certificate_pinning(mut self, pinning: PinningConfiguration) -> Self {
        self.pinning = Some(pinning);
        self
    }

    /// Override the trust mechanism used to clean chains before pin matching.
    pub fn chain_cleaner(mut self, cleaner: Arc<dyn ChainCleaner>) -> Self {
        self.chain_cleaner = Some(cleaner);
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let checker = match self.pinning {
            Some(config) if !config.is_empty() => {
                let cleaner = match self.chain_cleaner {
                    Some(cleaner) => cleaner,
                    None => Arc::new(WebpkiChainCleaner::new()?),
                };
                Some(CertificateChecker::new(config, cleaner))
            }
            _ => None,
        };

        // Static proxy credentials double as the default 407 authenticator.
        let authenticator = self.authenticator.or_else(|| {
            self.proxy
                .as_ref()
                .and_then(|proxy| proxy.credentials.clone())
                .map(|credentials| {
                    Arc::new(CredentialsAuthenticator::new(credentials))
                        as Arc<dyn ProxyAuthenticator>
                })
        });

        Ok(HttpClient {
            proxy: self.proxy,
            authenticator,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            streaming_read_timeout: self.streaming_read_timeout,
            checker,
            origin_connector: tls::origin_connector(),
            default_headers: Headers::new(),
            default_streaming_headers: Headers::new(),
        })
    }
}

/// The transport engine. Configuration is immutable once built (apart from the
/// default-header hooks), so a single client is safe to share across tasks.
pub struct HttpClient {
    proxy: Option<ProxyEndpoint>,
    authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    streaming_read_timeout: Duration,
    checker: Option<CertificateChecker>,
    origin_connector: TlsConnector,
    default_headers: Headers,
    default_streaming_headers: Headers,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Header merged into every subsequent one-shot request unless overridden
    /// per call. Empty names or values are rejected immediately.
    pub fn add_default_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.default_headers.set(name, value)
    }

    pub fn add_default_headers<'a>(
        &mut self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        for (name, value) in headers {
            self.default_headers.set(name, value)?;
        }
        Ok(())
    }

    /// Header merged into every subsequent stream request.
    pub fn add_default_streaming_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.default_streaming_headers.set(name, value)
    }

    pub fn add_default_streaming_headers<'a>(
        &mut self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        for (name, value) in headers {
            self.default_streaming_headers.set(name, value)?;
        }
        Ok(())
    }

    /// Execute a one-shot request and materialize the full response.
    ///
    /// Non-2xx responses are returned as values with their real status and
    /// body; only transport-level failures are errors.
    pub async fn execute(&self, spec: &HttpRequestSpec) -> Result<HttpResponseRecord> {
        self.validate_scheme(spec)?;
        let defaults = if spec.streaming {
            &self.default_streaming_headers
        } else {
            &self.default_headers
        };
        let headers = defaults.merged_with(&spec.headers);

        match self.execute_once(spec, &headers, None).await {
            Err(HttpError::ProxyAuthRequired(message)) => {
                let authorization = self.challenge_response(spec, &message)?;
                tracing::debug!("Retrying request once with proxy authorization after 407");
                self.execute_once(spec, &headers, Some(authorization.as_str()))
                    .await
            }
            other => other,
        }
    }

    /// Open a long-lived stream: same transport selection as `execute`, but
    /// the body stays on the wire behind the returned handle.
    pub async fn open_stream(&self, spec: &HttpRequestSpec) -> Result<StreamHandle> {
        self.validate_scheme(spec)?;
        let headers = self.default_streaming_headers.merged_with(&spec.headers);

        match self.open_stream_once(spec, &headers, None).await {
            Err(HttpError::ProxyAuthRequired(message)) => {
                let authorization = self.challenge_response(spec, &message)?;
                tracing::debug!("Retrying stream request once with proxy authorization after 407");
                self.open_stream_once(spec, &headers, Some(authorization.as_str()))
                    .await
            }
            other => other,
        }
    }

    async fn execute_once(
        &self,
        spec: &HttpRequestSpec,
        headers: &Headers,
        proxy_authorization: Option<&str>,
    ) -> Result<HttpResponseRecord> {
        let mut channel = self.open_channel(spec, proxy_authorization).await?;

        let request = http1::serialize_request(spec, headers)?;
        channel.write_all(&request).await?;
        channel.flush().await?;

        let peer_certificates = channel.peer_certificates();
        let response = timed_result(
            self.read_timeout,
            "read response",
            http1::read_response(&mut channel, peer_certificates),
        )
        .await?;

        // Single-exchange connection; best-effort teardown.
        if let Err(e) = channel.shutdown().await {
            tracing::debug!("Error shutting down connection: {}", e);
        }

        Ok(response)
    }

    async fn open_stream_once(
        &self,
        spec: &HttpRequestSpec,
        headers: &Headers,
        proxy_authorization: Option<&str>,
    ) -> Result<StreamHandle> {
        let mut channel = self.open_channel(spec, proxy_authorization).await?;

        let request = http1::serialize_request(spec, headers)?;
        channel.write_all(&request).await?;
        channel.flush().await?;

        let peer_certificates = channel.peer_certificates();
        let head = timed_result(
            self.read_timeout,
            "read stream response head",
            http1::read_response_head(&mut channel),
        )
        .await?;

        Ok(StreamHandle::new(
            head.status,
            head.headers,
            peer_certificates,
            channel,
            self.streaming_read_timeout,
        ))
    }

    /// Produce the byte channel for a request: tunnel (or direct socket), plus
    /// the origin TLS layer and pin verification when the scheme is HTTPS.
    async fn open_channel(
        &self,
        spec: &HttpRequestSpec,
        proxy_authorization: Option<&str>,
    ) -> Result<HttpChannel> {
        let host = spec.host()?.to_string();
        let port = spec.port();

        let strategy = self.strategy();
        tracing::debug!("Using {} transport for {}:{}", strategy.label(), host, port);

        let tunnel = match strategy {
            TransportStrategy::Direct => TunnelChannel::Plain(
                timed(
                    self.connect_timeout,
                    &format!("connect to {}:{}", host, port),
                    TcpStream::connect((host.as_str(), port)),
                )
                .await?,
            ),
            TransportStrategy::PlainProxy(proxy) | TransportStrategy::TlsProxy(proxy) => {
                TunnelEstablisher::new(
                    proxy,
                    self.connect_timeout,
                    self.read_timeout,
                    self.checker.as_ref(),
                )
                .establish(&host, port, proxy_authorization)
                .await?
            }
        };

        if !spec.is_https() {
            return Ok(HttpChannel::Plain(tunnel));
        }

        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| HttpError::Connectivity(format!("Invalid server name {:?}: {}", host, e)))?;

        tracing::debug!("Performing TLS handshake with origin {}", host);
        let tls_stream = timed(
            self.connect_timeout,
            &format!("TLS handshake with {}", host),
            self.origin_connector.connect(server_name, tunnel),
        )
        .await?;

        let channel = HttpChannel::Tls(Box::new(tls_stream));

        // Pinning runs once per handshake, before any request bytes go out.
        if let Some(checker) = &self.checker {
            checker.check(&host, &channel.peer_certificates())?;
        }

        Ok(channel)
    }

    fn strategy(&self) -> TransportStrategy<'_> {
        match &self.proxy {
            None => TransportStrategy::Direct,
            Some(proxy) if proxy.requires_tls() => TransportStrategy::TlsProxy(proxy),
            Some(proxy) => TransportStrategy::PlainProxy(proxy),
        }
    }

    fn validate_scheme(&self, spec: &HttpRequestSpec) -> Result<()> {
        let scheme = spec.url.scheme();
        if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
            return Ok(());
        }
        Err(HttpError::Config(format!(
            "Unsupported URL scheme: {}",
            scheme
        )))
    }

    /// Resolve a 407 challenge into a Proxy-Authorization value, or propagate
    /// the challenge when no authenticator can answer it.
    fn challenge_response(&self, spec: &HttpRequestSpec, message: &str) -> Result<String> {
        let Some(authenticator) = &self.authenticator else {
            return Err(HttpError::ProxyAuthRequired(format!(
                "{} and no proxy authenticator is configured",
                message
            )));
        };

        authenticator.proxy_authorization(spec).ok_or_else(|| {
            HttpError::ProxyAuthRequired(format!(
                "{} and the proxy authenticator declined the challenge",
                message
            ))
        })
    }
}
