//! Long-lived response streams
//!
//! A stream request parses the status line and headers, then hands the open
//! channel back to the caller as a readable byte source (for event streams).
//! The handle owns every socket in the chain and closing it tears the chain
//! down innermost layer first; close is explicit and idempotent.

use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::error::{HttpError, Result};
use crate::tunnel::HttpChannel;
use crate::types::Headers;

pub struct StreamHandle {
    status: u16,
    headers: Headers,
    peer_certificates: Vec<CertificateDer<'static>>,
    reader: Option<BufReader<HttpChannel>>,
    read_timeout: Duration,
}

impl StreamHandle {
    pub(crate) fn new(
        status: u16,
        headers: Headers,
        peer_certificates: Vec<CertificateDer<'static>>,
        channel: HttpChannel,
        read_timeout: Duration,
    ) -> Self {
        Self {
            status,
            headers,
            peer_certificates,
            reader: Some(BufReader::new(channel)),
            read_timeout,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certificates
    }

    /// Read the next line of the stream body. `Ok(None)` means the peer closed
    /// the connection.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| HttpError::Connectivity("Stream already closed".to_string()))?;

        let mut line = String::new();
        let read = tokio::time::timeout(self.read_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| {
                HttpError::Connectivity(format!(
                    "Timed out reading from stream after {:?}",
                    self.read_timeout
                ))
            })??;

        if read == 0 {
            return Ok(None);
        }

        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Read raw bytes from the stream body. `Ok(0)` means the peer closed the
    /// connection.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| HttpError::Connectivity("Stream already closed".to_string()))?;

        let read = tokio::time::timeout(self.read_timeout, reader.read(buf))
            .await
            .map_err(|_| {
                HttpError::Connectivity(format!(
                    "Timed out reading from stream after {:?}",
                    self.read_timeout
                ))
            })??;

        Ok(read)
    }

    /// Tear down the socket chain. Safe to call more than once; the underlying
    /// close runs exactly once.
    pub async fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            if let Err(e) = reader.get_mut().shutdown().await {
                tracing::debug!("Error shutting down stream channel: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }
}
