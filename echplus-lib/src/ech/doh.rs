use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::EchDialer;
use crate::error::{EchError, Result};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE: usize = 64 * 1024;

/// Forwards raw DNS messages to a DoH endpoint. The production
/// implementation rides the TLS-ECH dialer; tests answer from a table.
#[async_trait]
pub trait DnsProxy: Send + Sync {
    async fn query(&self, packet: &[u8]) -> Result<Vec<u8>>;
}

/// DoH client speaking HTTP/1.1 directly over a TLS-ECH stream, so DNS
/// queries share the tunnel's pinned endpoint and never leak in cleartext.
pub struct DohClient {
    dialer: EchDialer,
    host: String,
    port: u16,
    path: String,
}

impl DohClient {
    pub fn new(dialer: EchDialer) -> Self {
        Self {
            dialer,
            host: "cloudflare-dns.com".to_string(),
            port: 443,
            path: "/dns-query".to_string(),
        }
    }

    async fn roundtrip(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.dialer.dial(&self.host, self.port).await?;

        let request = format!(
            "GET {}?dns={} HTTP/1.1\r\nHost: {}\r\nAccept: application/dns-message\r\nConnection: close\r\n\r\n",
            self.path,
            URL_SAFE_NO_PAD.encode(packet),
            self.host,
        );
        stream.write_all(request.as_bytes()).await?;

        let mut buf = Vec::with_capacity(2048);
        let mut chunk = [0u8; 2048];
        let header_end = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(EchError::Protocol("DoH response ended before headers".to_string()));
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find_header_end(&buf) {
                break pos;
            }
            if buf.len() > MAX_RESPONSE {
                return Err(EchError::Protocol("DoH response headers too large".to_string()));
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]);
        let (status, content_length) = parse_response_head(&head)?;
        if status != 200 {
            return Err(EchError::Protocol(format!("DoH server returned status {status}")));
        }

        let mut body = buf[header_end..].to_vec();
        match content_length {
            Some(len) if len > MAX_RESPONSE => {
                return Err(EchError::Protocol("DoH response body too large".to_string()));
            }
            Some(len) => {
                while body.len() < len {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(EchError::Protocol("DoH response body truncated".to_string()));
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
                body.truncate(len);
            }
            None => {
                // Connection: close; read until EOF.
                loop {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                    if body.len() > MAX_RESPONSE {
                        return Err(EchError::Protocol("DoH response body too large".to_string()));
                    }
                }
            }
        }
        debug!(len = body.len(), "in-tunnel DoH answer received");
        Ok(body)
    }
}

#[async_trait]
impl DnsProxy for DohClient {
    async fn query(&self, packet: &[u8]) -> Result<Vec<u8>> {
        timeout(QUERY_TIMEOUT, self.roundtrip(packet))
            .await
            .map_err(|_| EchError::Dial("DoH query timed out".to_string()))?
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Returns the status code and Content-Length, if present.
fn parse_response_head(head: &str) -> Result<(u16, Option<usize>)> {
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| EchError::Protocol("empty DoH response head".to_string()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| EchError::Protocol(format!("bad status line {status_line:?}")))?;

    let mut content_length = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }
    Ok((status, content_length))
}
