//! HTTP handler: CONNECT tunnels and absolute-form proxy requests.

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::Handshake;
use crate::error::{EchError, Result};
use crate::session::protocol::split_host_port;
use crate::session::{ClientMode, SessionTarget, StreamIntent};

/// Request line plus headers must fit here.
const MAX_HEAD: usize = 64 * 1024;
/// Bodies at or above this size are not inlined into the first frame.
const MAX_INLINE_BODY: usize = 10 * 1024 * 1024;

pub(crate) async fn handshake(mut stream: TcpStream, first: u8) -> Result<Handshake> {
    let (head, leftover) = read_head(&mut stream, first).await?;
    let parsed = parse_head(&head)?;

    if parsed.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = match split_host_port(&parsed.uri) {
            Ok(pair) => pair,
            // A bare name defaults to the TLS port.
            Err(_) => (parsed.uri.clone(), 443),
        };
        return Ok(Handshake::Stream(StreamIntent {
            stream,
            target: SessionTarget { host, port },
            mode: ClientMode::HttpConnect,
            first_frame: leftover,
        }));
    }

    let (target, rebuilt) = rebuild_origin_request(&parsed)?;
    let first_frame = inline_body(&mut stream, rebuilt, leftover, parsed.content_length()).await?;
    Ok(Handshake::Stream(StreamIntent {
        stream,
        target,
        mode: ClientMode::HttpProxy,
        first_frame,
    }))
}

/// Consume the request head (through the blank line); bytes read past it
/// are returned separately and belong to the body.
async fn read_head(stream: &mut TcpStream, first: u8) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(512);
    buf.push(first);
    let mut chunk = [0u8; 512];
    loop {
        if let Some(pos) = find_double_crlf(&buf) {
            let leftover = buf.split_off(pos);
            return Ok((buf, leftover));
        }
        if buf.len() >= MAX_HEAD {
            return Err(EchError::Protocol("request head too large".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(EchError::Protocol("connection closed mid-request".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }
}

pub(crate) fn parse_head(head: &[u8]) -> Result<ParsedRequest> {
    let text = std::str::from_utf8(head)
        .map_err(|_| EchError::Protocol("request head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| EchError::Protocol("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m.to_string(), u.to_string(), v.to_string()),
        _ => return Err(EchError::Protocol(format!("malformed request line {request_line:?}"))),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| EchError::Protocol(format!("malformed header line {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(ParsedRequest { method, uri, version, headers })
}

/// Turn an absolute-form proxy request into the cleartext origin request
/// that becomes the first frame. Hop-by-hop proxy headers are dropped.
pub(crate) fn rebuild_origin_request(req: &ParsedRequest) -> Result<(SessionTarget, Vec<u8>)> {
    let (hostport, path) = if let Some(rest) = req.uri.strip_prefix("http://") {
        match rest.find('/') {
            Some(idx) => (rest[..idx].to_string(), rest[idx..].to_string()),
            None => (rest.to_string(), "/".to_string()),
        }
    } else {
        let host = req
            .header("Host")
            .ok_or_else(|| EchError::Protocol("request carries no Host header".to_string()))?;
        (host.to_string(), req.uri.clone())
    };
    let (host, port) = match split_host_port(&hostport) {
        Ok(pair) => pair,
        Err(_) => (hostport, 80),
    };

    let mut frame = Vec::with_capacity(256);
    frame.extend_from_slice(format!("{} {} {}\r\n", req.method, path, req.version).as_bytes());
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("Proxy-Connection")
            || name.eq_ignore_ascii_case("Proxy-Authorization")
        {
            continue;
        }
        frame.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    frame.extend_from_slice(b"\r\n");
    Ok((SessionTarget { host, port }, frame))
}

/// Append the request body to the rebuilt frame when its declared size is
/// inlineable; oversized bodies stream through the session afterwards.
async fn inline_body(
    stream: &mut TcpStream,
    mut frame: Vec<u8>,
    leftover: Vec<u8>,
    content_length: Option<usize>,
) -> Result<Vec<u8>> {
    let mut body = leftover;
    if let Some(len) = content_length {
        if len < MAX_INLINE_BODY {
            let mut chunk = [0u8; 4096];
            while body.len() < len {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(EchError::Protocol("connection closed mid-body".to_string()));
                }
                body.extend_from_slice(&chunk[..n]);
            }
        }
    }
    frame.extend_from_slice(&body);
    Ok(frame)
}
