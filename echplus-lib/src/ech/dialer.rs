use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderValue;
use rustls::client::{EchConfig, EchMode};
use rustls::pki_types::{EchConfigListBytes, ServerName};
use socket2::SockRef;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, warn};

use super::{dial_with_ech_retry, EchManager, RelayConnector, RelayStream};
use crate::error::{EchError, Result};

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a TLS client configuration with the given ECHConfigList applied.
/// An empty list is a hard error; ECH is required, never best-effort, so a
/// server that rejects it fails the handshake instead of falling back to a
/// cleartext SNI.
pub fn build_ech_client_config(list: &[u8]) -> Result<rustls::ClientConfig> {
    if list.is_empty() {
        return Err(EchError::EchUnavailable("empty ECH config list".to_string()));
    }
    let suites = rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES;
    let ech = EchConfig::new(EchConfigListBytes::from(list.to_vec()), suites)
        .map_err(|e| EchError::Tls(format!("invalid ECH config list: {e}")))?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_ech(EchMode::from(ech))
        .map_err(|e| EchError::Tls(format!("ECH mode rejected: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Dials TLS-ECH connections. The TCP endpoint may be pinned to a fixed IP
/// while the SNI keeps the logical host name.
#[derive(Clone)]
pub struct EchDialer {
    ech: Arc<EchManager>,
    pinned_ip: Option<IpAddr>,
}

impl EchDialer {
    pub fn new(ech: Arc<EchManager>, pinned_ip: Option<IpAddr>) -> Self {
        Self { ech, pinned_ip }
    }

    pub fn manager(&self) -> &EchManager {
        &self.ech
    }

    /// TCP + TLS to `host:port`, SNI = `host`, ECH from the current
    /// snapshot.
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let list = self.ech.snapshot()?;
        let tls_config = build_ech_client_config(&list)?;

        let tcp = match self.pinned_ip {
            Some(ip) => connect_tcp(SocketAddr::new(ip, port)).await?,
            None => {
                let mut addrs = lookup_host((host, port))
                    .await
                    .map_err(|e| EchError::Dial(format!("resolve {host}: {e}")))?;
                let addr = addrs
                    .next()
                    .ok_or_else(|| EchError::Dial(format!("no addresses for {host}")))?;
                connect_tcp(addr).await?
            }
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| EchError::Config(format!("invalid server name {host:?}: {e}")))?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let tls = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| EchError::Dial(format!("TLS handshake to {host} timed out")))?
            .map_err(|e| EchError::Tls(format!("TLS handshake to {host} failed: {e}")))?;
        debug!(host, port, pinned = ?self.pinned_ip, "TLS-ECH connection established");
        Ok(tls)
    }
}

async fn connect_tcp(addr: SocketAddr) -> Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| EchError::Dial(format!("TCP connect to {addr} timed out")))?
        .map_err(|e| EchError::Dial(format!("TCP connect to {addr} failed: {e}")))?;
    if let Err(e) = SockRef::from(&stream).set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
    }
    Ok(stream)
}

/// Production `RelayConnector`: WSS over TLS-ECH, the auth token carried
/// as the sole WebSocket subprotocol, with one ECH refresh between the two
/// dial attempts.
pub struct EchRelayConnector {
    dialer: EchDialer,
    host: String,
    port: u16,
    path: String,
    token: String,
}

impl EchRelayConnector {
    pub fn new(dialer: EchDialer, host: String, port: u16, path: String, token: String) -> Self {
        Self { dialer, host, port, path, token }
    }

    async fn connect_once(&self) -> Result<RelayStream> {
        let tls = self.dialer.dial(&self.host, self.port).await?;

        let url = format!("wss://{}:{}{}", self.host, self.port, self.path);
        let mut request = url
            .into_client_request()
            .map_err(|e| EchError::Config(format!("invalid relay URL: {e}")))?;
        let proto = HeaderValue::from_str(&self.token)
            .map_err(|e| EchError::Config(format!("token not header-safe: {e}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, proto);

        let (ws, _resp) = timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::client_async(request, MaybeTlsStream::Rustls(tls)),
        )
        .await
        .map_err(|_| EchError::Dial("WebSocket handshake timed out".to_string()))?
        .map_err(|e| EchError::Dial(format!("WebSocket handshake failed: {e}")))?;
        Ok(ws)
    }
}

#[async_trait]
impl RelayConnector for EchRelayConnector {
    async fn connect(&self) -> Result<RelayStream> {
        dial_with_ech_retry(self.dialer.manager(), || self.connect_once()).await
    }
}
