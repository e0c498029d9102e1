//! CONNECT tunnel establishment
//!
//! Opens a byte channel to an origin through a forward proxy:
//! 1. TCP connect to the proxy
//! 2. TLS handshake with the proxy itself when its configuration carries a CA
//!    certificate (presenting a client identity for mutual TLS if configured)
//! 3. `CONNECT origin:port` over whichever channel exists
//! 4. Status line read; non-2xx is a tunnel failure, not an origin response
//!
//! After step 4 the proxy blindly relays bytes. If the origin is HTTPS the
//! executor layers a second, independent TLS handshake on top of the returned
//! channel, so the proxy's TLS session only ever sees origin-encrypted bytes.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{HttpError, Result};
use crate::http1;
use crate::pinning::CertificateChecker;
use crate::proxy::ProxyEndpoint;
use crate::tls;

/// Byte channel to the origin: a direct/tunneled TCP stream, or one wrapped in
/// the proxy's own TLS session.
#[derive(Debug)]
pub enum TunnelChannel {
    Plain(TcpStream),
    ProxyTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for TunnelChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TunnelChannel::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            TunnelChannel::ProxyTls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            TunnelChannel::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            TunnelChannel::ProxyTls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TunnelChannel::Plain(stream) => Pin::new(stream).poll_flush(cx),
            TunnelChannel::ProxyTls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TunnelChannel::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            TunnelChannel::ProxyTls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Fully established channel for speaking HTTP to the origin: the tunnel
/// itself, or the origin TLS session layered on top of it.
pub enum HttpChannel {
    Plain(TunnelChannel),
    Tls(Box<tokio_rustls::client::TlsStream<TunnelChannel>>),
}

impl HttpChannel {
    /// Certificate chain presented by the origin, empty for plaintext.
    pub fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        match self {
            HttpChannel::Plain(_) => Vec::new(),
            HttpChannel::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default(),
        }
    }
}

impl AsyncRead for HttpChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            HttpChannel::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            HttpChannel::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            HttpChannel::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            HttpChannel::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            HttpChannel::Plain(stream) => Pin::new(stream).poll_flush(cx),
            HttpChannel::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    // Shutting down the layered variant sends the origin session's
    // close_notify first, then tears down the tunnel underneath it.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            HttpChannel::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            HttpChannel::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Establishes CONNECT tunnels through the configured proxy.
pub(crate) struct TunnelEstablisher<'a> {
    proxy: &'a ProxyEndpoint,
    connect_timeout: Duration,
    read_timeout: Duration,
    checker: Option<&'a CertificateChecker>,
}

impl<'a> TunnelEstablisher<'a> {
    pub(crate) fn new(
        proxy: &'a ProxyEndpoint,
        connect_timeout: Duration,
        read_timeout: Duration,
        checker: Option<&'a CertificateChecker>,
    ) -> Self {
        Self {
            proxy,
            connect_timeout,
            read_timeout,
            checker,
        }
    }

    /// Run the tunnel state machine to completion: Connect, ProxyHandshake
    /// (when the proxy speaks TLS), Connect-Request, Established.
    pub(crate) async fn establish(
        &self,
        origin_host: &str,
        origin_port: u16,
        proxy_authorization: Option<&str>,
    ) -> Result<TunnelChannel> {
        tracing::debug!(
            "Establishing tunnel through proxy {}:{} to {}:{}",
            self.proxy.host,
            self.proxy.port,
            origin_host,
            origin_port
        );

        let tcp = timed(
            self.connect_timeout,
            &format!("connect to proxy {}:{}", self.proxy.host, self.proxy.port),
            TcpStream::connect((self.proxy.host.as_str(), self.proxy.port)),
        )
        .await?;

        let mut channel = if self.proxy.requires_tls() {
            let connector = tls::proxy_connector(self.proxy)?;
            let server_name = ServerName::try_from(self.proxy.host.clone()).map_err(|e| {
                HttpError::Connectivity(format!(
                    "Invalid proxy server name {:?}: {}",
                    self.proxy.host, e
                ))
            })?;

            tracing::debug!("Performing TLS handshake with proxy {}", self.proxy.host);
            let tls_stream = timed(
                self.connect_timeout,
                &format!("TLS handshake with proxy {}", self.proxy.host),
                connector.connect(server_name, tcp),
            )
            .await?;

            // Pinning runs once per TLS handshake observed, the proxy's
            // included; hosts without configured pins pass through.
            if let Some(checker) = self.checker {
                let chain = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .map(|certs| certs.to_vec())
                    .unwrap_or_default();
                checker.check(&self.proxy.host, &chain)?;
            }

            TunnelChannel::ProxyTls(Box::new(tls_stream))
        } else {
            TunnelChannel::Plain(tcp)
        };

        self.connect_request(&mut channel, origin_host, origin_port, proxy_authorization)
            .await?;

        tracing::debug!(
            "Tunnel to {}:{} established, proxy switched to relay mode",
            origin_host,
            origin_port
        );
        Ok(channel)
    }

    async fn connect_request(
        &self,
        channel: &mut TunnelChannel,
        origin_host: &str,
        origin_port: u16,
        proxy_authorization: Option<&str>,
    ) -> Result<()> {
        let mut request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
            host = origin_host,
            port = origin_port
        );
        if let Some(authorization) = proxy_authorization {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", authorization));
        }
        request.push_str("\r\n");

        channel.write_all(request.as_bytes()).await?;
        channel.flush().await?;

        let head = timed_result(
            self.read_timeout,
            "read CONNECT response from proxy",
            http1::read_response_head(channel),
        )
        .await?;

        if head.status == 407 {
            return Err(HttpError::ProxyAuthRequired(format!(
                "Proxy {}:{} returned 407 to CONNECT",
                self.proxy.host, self.proxy.port
            )));
        }

        if !(200..300).contains(&head.status) {
            return Err(HttpError::Connectivity(format!(
                "Proxy {}:{} refused CONNECT tunnel to {}:{} with status {}",
                self.proxy.host, self.proxy.port, origin_host, origin_port, head.status
            )));
        }

        Ok(())
    }
}

/// Bound an I/O future with a timeout, mapping both expiry and I/O failure to
/// connectivity errors.
pub(crate) async fn timed<T, F>(duration: Duration, what: &str, future: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(HttpError::Connectivity(format!("Failed to {}: {}", what, e))),
        Err(_) => Err(HttpError::Connectivity(format!(
            "Timed out trying to {} after {:?}",
            what, duration
        ))),
    }
}

/// Like `timed`, for futures that already produce transport errors.
pub(crate) async fn timed_result<T, F>(duration: Duration, what: &str, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(HttpError::Connectivity(format!(
            "Timed out trying to {} after {:?}",
            what, duration
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn proxy_pair() -> (ProxyEndpoint, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (ProxyEndpoint::new("127.0.0.1", port), listener)
    }

    fn establisher(endpoint: &ProxyEndpoint) -> TunnelEstablisher<'_> {
        TunnelEstablisher::new(endpoint, Duration::from_secs(5), Duration::from_secs(5), None)
    }

    async fn answer_connect(listener: TcpListener, response: &'static str) -> Vec<u8> {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = vec![0u8; 1024];
        let n = socket.read(&mut seen).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut socket, response.as_bytes())
            .await
            .unwrap();
        seen.truncate(n);
        seen
    }

    #[tokio::test]
    async fn plain_connect_sends_origin_target_and_host() {
        let (endpoint, listener) = proxy_pair().await;
        let server = tokio::spawn(answer_connect(
            listener,
            "HTTP/1.1 200 Connection Established\r\n\r\n",
        ));

        establisher(&endpoint)
            .establish("origin.test", 443, None)
            .await
            .unwrap();

        let seen = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(seen.starts_with("CONNECT origin.test:443 HTTP/1.1\r\n"));
        assert!(seen.contains("Host: origin.test:443\r\n"));
        assert!(!seen.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn connect_includes_proxy_authorization_when_supplied() {
        let (endpoint, listener) = proxy_pair().await;
        let server = tokio::spawn(answer_connect(
            listener,
            "HTTP/1.1 200 Connection Established\r\n\r\n",
        ));

        establisher(&endpoint)
            .establish("origin.test", 443, Some("Basic dXNlcjpwYXNz"))
            .await
            .unwrap();

        let seen = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(seen.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn connect_407_surfaces_as_proxy_auth_required() {
        let (endpoint, listener) = proxy_pair().await;
        tokio::spawn(answer_connect(
            listener,
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n",
        ));

        let err = establisher(&endpoint)
            .establish("origin.test", 443, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::ProxyAuthRequired(_)));
    }

    #[tokio::test]
    async fn connect_rejection_is_a_tunnel_failure_not_a_response() {
        let (endpoint, listener) = proxy_pair().await;
        tokio::spawn(answer_connect(listener, "HTTP/1.1 403 Forbidden\r\n\r\n"));

        let err = establisher(&endpoint)
            .establish("origin.test", 443, None)
            .await
            .unwrap_err();
        match err {
            HttpError::Connectivity(message) => {
                assert!(message.contains("403"));
                assert!(message.contains("CONNECT"));
            }
            other => panic!("Expected connectivity error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_proxy_is_a_connectivity_error() {
        // Port 1 on localhost is essentially never listening.
        let endpoint = ProxyEndpoint::new("127.0.0.1", 1);

        let err = establisher(&endpoint)
            .establish("origin.test", 443, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Connectivity(_)));
    }
}
