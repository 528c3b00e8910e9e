pub mod direct;
pub mod protocol;
pub mod tunnel;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::ech::{DnsProxy, RelayConnector};
use crate::error::is_benign_disconnect;
use crate::routing::RouteDecider;
use crate::stats::TrafficStore;

/// Shared state every accepted connection needs.
pub struct ProxyContext {
    pub stats: Arc<TrafficStore>,
    pub decider: RouteDecider,
    pub connector: Arc<dyn RelayConnector>,
    pub dns: Arc<dyn DnsProxy>,
}

/// Which local protocol produced the session; decides the shape of the
/// success and failure replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Socks5,
    HttpConnect,
    HttpProxy,
}

/// Ultimate destination of one session. `host` carries no brackets.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", protocol::format_target(&self.host, self.port))
    }
}

/// A demuxed client connection ready for relaying.
pub struct StreamIntent {
    pub stream: TcpStream,
    pub target: SessionTarget,
    pub mode: ClientMode,
    pub first_frame: Vec<u8>,
}

/// Route and run one session to completion.
pub async fn establish(ctx: &ProxyContext, intent: StreamIntent, peer: SocketAddr) {
    let StreamIntent { mut stream, target, mode, first_frame } = intent;
    let key = target.to_string();
    ctx.stats.record_connection(&key);

    if ctx.decider.should_bypass(&target.host).await {
        debug!(%peer, target = %key, "bypassing tunnel");
        if let Err(e) = direct::run(stream, &target, mode, first_frame, &ctx.stats).await {
            log_session_end(&key, peer, &e.to_string());
        }
        return;
    }

    let ws = match ctx.connector.connect().await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, target = %key, error = %e, "relay dial failed");
            let _ = send_failure(&mut stream, mode).await;
            return;
        }
    };
    if let Err(e) = tunnel::run(ws, stream, &target, mode, first_frame, &ctx.stats).await {
        log_session_end(&key, peer, &e.to_string());
    }
}

fn log_session_end(target: &str, peer: SocketAddr, err: &str) {
    warn!(%peer, target, error = err, "session ended with error");
}

pub(crate) const SOCKS5_REPLY_OK: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
pub(crate) const SOCKS5_REPLY_HOST_UNREACHABLE: [u8; 10] = [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
pub(crate) const HTTP_REPLY_OK: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub(crate) const HTTP_REPLY_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Mode-appropriate success reply. Absolute-form HTTP gets none: the
/// tunneled response bytes are the reply.
pub(crate) async fn send_success(stream: &mut TcpStream, mode: ClientMode) -> std::io::Result<()> {
    match mode {
        ClientMode::Socks5 => stream.write_all(&SOCKS5_REPLY_OK).await,
        ClientMode::HttpConnect => stream.write_all(HTTP_REPLY_OK).await,
        ClientMode::HttpProxy => Ok(()),
    }
}

pub(crate) async fn send_failure(stream: &mut TcpStream, mode: ClientMode) -> std::io::Result<()> {
    match mode {
        ClientMode::Socks5 => stream.write_all(&SOCKS5_REPLY_HOST_UNREACHABLE).await,
        ClientMode::HttpConnect | ClientMode::HttpProxy => {
            stream.write_all(HTTP_REPLY_BAD_GATEWAY).await
        }
    }
}

/// Demote expected disconnects below the error threshold.
pub(crate) fn log_io_end(context: &str, err: &std::io::Error) {
    if is_benign_disconnect(err) {
        debug!(error = %err, "{context}");
    } else {
        warn!(error = %err, "{context}");
    }
}
