//! In-process forward proxy and origin server for transport tests
//!
//! `MockProxy` accepts `CONNECT` requests, optionally enforces a
//! `Proxy-Authorization` value (answering 407 until it sees it), records every
//! tunnel attempt, then blindly relays bytes to the requested destination.
//! `MockOrigin` is a scriptable HTTP/1.1 server that captures raw requests and
//! plays back configured responses, closing the connection after each one.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// One observed CONNECT attempt.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub destination: String,
    pub proxy_authorization: Option<String>,
}

/// A forward proxy speaking the CONNECT protocol over plain TCP.
pub struct MockProxy {
    addr: SocketAddr,
    attempts: Arc<Mutex<Vec<ConnectAttempt>>>,
    accept_loop: JoinHandle<()>,
}

impl MockProxy {
    /// Start a proxy on an ephemeral local port. When
    /// `required_authorization` is set, CONNECT requests without that exact
    /// `Proxy-Authorization` value are answered with 407.
    pub async fn start(required_authorization: Option<String>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let attempts: Arc<Mutex<Vec<ConnectAttempt>>> = Arc::new(Mutex::new(Vec::new()));

        let loop_attempts = attempts.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let attempts = loop_attempts.clone();
                let required = required_authorization.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_proxy_connection(stream, attempts, required).await {
                        tracing::debug!("Proxy connection error: {}", e);
                    }
                });
            }
        });

        Ok(Self {
            addr,
            attempts,
            accept_loop,
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// All CONNECT attempts seen so far, in arrival order.
    pub async fn attempts(&self) -> Vec<ConnectAttempt> {
        self.attempts.lock().await.clone()
    }
}

impl Drop for MockProxy {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn handle_proxy_connection(
    mut stream: TcpStream,
    attempts: Arc<Mutex<Vec<ConnectAttempt>>>,
    required_authorization: Option<String>,
) -> io::Result<()> {
    let (request_line, headers) = read_head(&mut stream).await?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 || parts[0] != "CONNECT" {
        stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
            .await?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid CONNECT request: {}", request_line),
        ));
    }

    let destination = parts[1].to_string();
    let proxy_authorization = header_value(&headers, "proxy-authorization");

    attempts.lock().await.push(ConnectAttempt {
        destination: destination.clone(),
        proxy_authorization: proxy_authorization.clone(),
    });

    if let Some(required) = &required_authorization {
        if proxy_authorization.as_deref() != Some(required.as_str()) {
            tracing::debug!("Rejecting CONNECT to {} with 407", destination);
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n",
                )
                .await?;
            stream.flush().await?;
            return Ok(());
        }
    }

    let mut upstream = TcpStream::connect(&destination).await?;
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;

    tracing::debug!("Tunnel open to {}", destination);
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    Ok(())
}

/// A scriptable single-shot HTTP/1.1 origin. Each connection consumes the next
/// configured raw response; the last one repeats once the script runs out.
pub struct MockOrigin {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    accept_loop: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn start(responses: Vec<String>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let fallback = responses
            .last()
            .cloned()
            .unwrap_or_else(|| "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_string());
        let script: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(responses.into()));

        let loop_requests = requests.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let requests = loop_requests.clone();
                let response = script
                    .lock()
                    .await
                    .pop_front()
                    .unwrap_or_else(|| fallback.clone());
                tokio::spawn(async move {
                    if let Err(e) = handle_origin_connection(stream, requests, response).await {
                        tracing::debug!("Origin connection error: {}", e);
                    }
                });
            }
        });

        Ok(Self {
            addr,
            requests,
            accept_loop,
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host(), self.port(), path)
    }

    /// Raw request texts (head plus body) in arrival order.
    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn handle_origin_connection(
    mut stream: TcpStream,
    requests: Arc<Mutex<Vec<String>>>,
    response: String,
) -> io::Result<()> {
    let (request_line, headers) = read_head(&mut stream).await?;

    let mut raw = format!("{}\r\n", request_line);
    for header in &headers {
        raw.push_str(header);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    if let Some(length) = header_value(&headers, "content-length").and_then(|v| v.parse().ok()) {
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;
        raw.push_str(&String::from_utf8_lossy(&body));
    }

    requests.lock().await.push(raw);

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a request line plus header lines up to the blank separator.
///
/// Reads byte at a time so no bytes beyond the head are consumed; the stream
/// is relayed or read as a body right after.
async fn read_head(stream: &mut TcpStream) -> io::Result<(String, Vec<String>)> {
    let request_line = read_line(stream).await?;
    if request_line.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Connection closed before request line",
        ));
    }

    let mut headers = Vec::new();
    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        headers.push(line);
    }

    Ok((request_line, headers))
}

async fn read_line(stream: &mut TcpStream) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn header_value(headers: &[String], name: &str) -> Option<String> {
    headers.iter().find_map(|line| {
        let (header_name, value) = line.split_once(':')?;
        if header_name.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}
