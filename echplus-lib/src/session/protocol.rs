//! Control frames exchanged over the relay WebSocket.
//!
//! Application payload travels as binary frames; the text `DATA:` form is
//! accepted on receive for older peers but never emitted.

pub const MSG_CONNECTED: &str = "CONNECTED";
pub const MSG_CLOSE: &str = "CLOSE";
pub const CONNECT_PREFIX: &str = "CONNECT:";
pub const ERROR_PREFIX: &str = "ERROR:";
pub const DATA_PREFIX: &str = "DATA:";

/// Render `host:port`, bracketing IPv6 literals.
pub fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Parsed `CONNECT:<addr>|<firstFrame>` payload.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub first_frame: Vec<u8>,
}

/// Parse the bytes following `CONNECT:`. The first-frame tail is opaque and
/// passed through unchanged.
pub fn parse_connect(payload: &[u8]) -> Result<ConnectRequest, String> {
    let sep = payload
        .iter()
        .position(|b| *b == b'|')
        .ok_or_else(|| "CONNECT is missing the '|' separator".to_string())?;
    let addr = std::str::from_utf8(&payload[..sep])
        .map_err(|_| "CONNECT address is not valid UTF-8".to_string())?;
    let (host, port) = split_host_port(addr)?;
    Ok(ConnectRequest { host, port, first_frame: payload[sep + 1..].to_vec() })
}

/// Split `host:port`, accepting `[v6]:port` bracket form. The returned host
/// has its brackets stripped.
pub fn split_host_port(addr: &str) -> Result<(String, u16), String> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated bracket in address {addr:?}"))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| format!("missing port in address {addr:?}"))?;
        (host, port)
    } else {
        addr.rsplit_once(':')
            .ok_or_else(|| format!("missing port in address {addr:?}"))?
    };
    if host.is_empty() {
        return Err(format!("empty host in address {addr:?}"));
    }
    let port: u16 = port.parse().map_err(|_| format!("invalid port in address {addr:?}"))?;
    Ok((host.to_string(), port))
}
