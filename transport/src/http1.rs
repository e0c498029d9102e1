//! Raw HTTP/1.1 message codec
//!
//! Serializes requests into wire bytes and parses response streams read off a
//! socket. Every exchange is single-shot: requests always carry
//! `Connection: close`, and a response without explicit framing is read until
//! the peer closes the connection.

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{HttpError, Result};
use crate::types::{Headers, HttpRequestSpec, HttpResponseRecord};

const CRLF: &str = "\r\n";

/// Serialize a request into wire bytes.
///
/// `Host` and `Content-Length` are owned by the codec; caller-supplied values
/// for either are dropped. Remaining headers are written in insertion order.
pub(crate) fn serialize_request(spec: &HttpRequestSpec, headers: &Headers) -> Result<Vec<u8>> {
    let mut path = spec.url.path().to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    if let Some(query) = spec.url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut request = format!("{} {} HTTP/1.1{}", spec.method.name(), path, CRLF);

    let mut host = spec.host()?.to_string();
    if !spec.is_default_port() {
        host.push_str(&format!(":{}", spec.port()));
    }
    request.push_str(&format!("Host: {}{}", host, CRLF));

    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        request.push_str(&format!("{}: {}{}", name, value, CRLF));
    }

    if let Some(body) = &spec.body {
        request.push_str(&format!("Content-Length: {}{}", body.len(), CRLF));
    }

    request.push_str("Connection: close");
    request.push_str(CRLF);
    request.push_str(CRLF);

    let mut bytes = request.into_bytes();
    if let Some(body) = &spec.body {
        bytes.extend_from_slice(body.as_bytes());
    }

    Ok(bytes)
}

/// Parsed status line and header block of a response.
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

/// Read one line terminated by CRLF, byte at a time.
///
/// A CR not followed by LF is kept as payload. Returns `None` when the stream
/// is already at end-of-file.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut found_cr = false;
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }

        match byte[0] {
            b'\r' => found_cr = true,
            b'\n' if found_cr => break,
            b => {
                if found_cr {
                    line.push(b'\r');
                    found_cr = false;
                }
                line.push(b);
            }
        }
    }

    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Read and parse the status line plus header block.
pub(crate) async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let status_line = read_line(reader)
        .await?
        .ok_or_else(|| HttpError::Protocol("No HTTP response received from server".to_string()))?;

    let status = parse_status_line(&status_line)?;
    let headers = read_headers(reader).await?;

    Ok(ResponseHead { status, headers })
}

/// Read a full response, including the body, framed per the header block.
pub(crate) async fn read_response<R>(
    reader: &mut R,
    peer_certificates: Vec<CertificateDer<'static>>,
) -> Result<HttpResponseRecord>
where
    R: AsyncRead + Unpin,
{
    let head = read_response_head(reader).await?;
    let body = read_body(reader, &head.headers).await?;

    Ok(HttpResponseRecord {
        status: head.status,
        headers: head.headers,
        body,
        peer_certificates,
    })
}

fn parse_status_line(status_line: &str) -> Result<u16> {
    // Status line format: "HTTP/1.1 200 OK"
    let mut parts = status_line.split_whitespace();
    let _version = parts
        .next()
        .ok_or_else(|| HttpError::Protocol(format!("Invalid HTTP status line: {}", status_line)))?;

    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| HttpError::Protocol(format!("Invalid HTTP status line: {}", status_line)))
}

async fn read_headers<R>(reader: &mut R) -> Result<Headers>
where
    R: AsyncRead + Unpin,
{
    let mut headers = Headers::new();

    while let Some(line) = read_line(reader).await? {
        if line.trim().is_empty() {
            break;
        }

        if let Some(colon) = line.find(':') {
            if colon == 0 {
                continue;
            }
            let name = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if headers.set(name, value).is_err() {
                tracing::warn!("Ignoring malformed response header: {}", line);
            }
        }
    }

    Ok(headers)
}

/// Read the response body. Framing priority: chunked transfer-encoding, then
/// Content-Length, then read-until-close.
async fn read_body<R>(reader: &mut R, headers: &Headers) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let is_chunked = headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

    let content_length = headers.get("content-length").and_then(|v| {
        v.parse::<usize>()
            .map_err(|_| tracing::warn!("Invalid Content-Length header: {}", v))
            .ok()
    });

    let bytes = if is_chunked {
        read_chunked_body(reader).await?
    } else if let Some(length) = content_length {
        read_fixed_length_body(reader, length).await?
    } else {
        read_until_close(reader).await?
    };

    if bytes.is_empty() {
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();

    loop {
        let size_line = read_line(reader).await?.ok_or_else(|| {
            HttpError::Protocol("Unexpected EOF while reading chunk size".to_string())
        })?;

        // Chunk extensions after ';' are ignored.
        let size_str = size_line
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();

        let chunk_size = usize::from_str_radix(&size_str, 16)
            .map_err(|_| HttpError::Protocol(format!("Invalid chunk size: {}", size_line)))?;

        if chunk_size == 0 {
            // Consume trailer headers until the terminating empty line.
            while let Some(trailer) = read_line(reader).await? {
                if trailer.trim().is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; chunk_size];
        reader.read_exact(&mut chunk).await.map_err(|_| {
            HttpError::Protocol("Unexpected EOF while reading chunk data".to_string())
        })?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await.map_err(|_| {
            HttpError::Protocol("Unexpected EOF while reading chunk terminator".to_string())
        })?;
        if crlf != [b'\r', b'\n'] {
            return Err(HttpError::Protocol(format!(
                "Expected CRLF after chunk data, got: {:?}",
                crlf
            )));
        }
    }

    Ok(body)
}

async fn read_fixed_length_body<R>(reader: &mut R, length: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|_| {
        HttpError::Protocol("Unexpected EOF while reading fixed-length body".to_string())
    })?;
    Ok(body)
}

async fn read_until_close<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpRequestSpec;
    use url::Url;

    fn spec(url: &str) -> HttpRequestSpec {
        HttpRequestSpec::get(Url::parse(url).unwrap())
    }

    #[test]
    fn get_request_serializes_exact_wire_bytes() {
        let spec = spec("http://test.com/path?q=1&v=2");
        let bytes = serialize_request(&spec, &Headers::new()).unwrap();

        assert_eq!(
            bytes,
            b"GET /path?q=1&v=2 HTTP/1.1\r\nHost: test.com\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn non_default_port_appears_in_host_header() {
        let spec = spec("http://test.com:8080/");
        let bytes = serialize_request(&spec, &Headers::new()).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains("Host: test.com:8080\r\n"));
    }

    #[test]
    fn post_body_gets_content_length_and_raw_bytes() {
        let spec = HttpRequestSpec::post(
            Url::parse("https://test.com/events").unwrap(),
            "{\"key\":\"value\"}".to_string(),
        );
        let bytes = serialize_request(&spec, &Headers::new()).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"key\":\"value\"}"));
    }

    #[test]
    fn caller_host_and_content_length_headers_are_dropped() {
        let spec = spec("http://test.com/");
        let mut headers = Headers::new();
        headers.set("Host", "evil.com").unwrap();
        headers.set("Content-Length", "999").unwrap();
        headers.set("Accept", "application/json").unwrap();

        let text = String::from_utf8(serialize_request(&spec, &headers).unwrap()).unwrap();

        assert!(text.contains("Host: test.com\r\n"));
        assert!(!text.contains("evil.com"));
        assert!(!text.contains("999"));
        assert!(text.contains("Accept: application/json\r\n"));
    }

    #[tokio::test]
    async fn parses_content_length_zero_as_absent_body() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        let response = read_response(&mut input, Vec::new()).await.unwrap();

        assert_eq!(response.status, 200);
        assert!(response.body.is_none());
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn empty_stream_is_a_no_response_error() {
        let mut input: &[u8] = b"";
        let err = read_response(&mut input, Vec::new()).await.unwrap_err();

        match err {
            HttpError::Protocol(message) => assert!(message.contains("No HTTP response")),
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_status_line_is_an_invalid_status_error() {
        let mut input: &[u8] = b"INVALID STATUS LINE\r\n\r\n";
        let err = read_response(&mut input, Vec::new()).await.unwrap_err();

        match err {
            HttpError::Protocol(message) => assert!(message.contains("Invalid HTTP status line")),
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn parses_chunked_body() {
        let mut input: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n15\r\nThis is chunked data!\r\n0\r\n\r\n";
        let response = read_response(&mut input, Vec::new()).await.unwrap();

        assert_eq!(response.body.as_deref(), Some("This is chunked data!"));
    }

    #[tokio::test]
    async fn chunk_extensions_and_trailers_are_ignored() {
        let mut input: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n0\r\nTrailer: x\r\n\r\n";
        let response = read_response(&mut input, Vec::new()).await.unwrap();

        assert_eq!(response.body.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn truncated_chunk_is_a_protocol_error() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nff\r\nshort";
        let err = read_response(&mut input, Vec::new()).await.unwrap_err();

        assert!(matches!(err, HttpError::Protocol(_)));
    }

    #[tokio::test]
    async fn missing_framing_reads_until_close() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nstreamed until eof";
        let response = read_response(&mut input, Vec::new()).await.unwrap();

        assert_eq!(response.body.as_deref(), Some("streamed until eof"));
    }

    #[tokio::test]
    async fn content_length_takes_precedence_over_eof() {
        let mut input: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found";
        let response = read_response(&mut input, Vec::new()).await.unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.is_success());
        assert_eq!(response.body.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn invalid_content_length_falls_back_to_read_until_close() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: abc\r\n\r\nbody";
        let response = read_response(&mut input, Vec::new()).await.unwrap();

        assert_eq!(response.body.as_deref(), Some("body"));
    }
}
