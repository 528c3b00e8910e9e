use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::Deserialize;

use super::types::RoutingMode;
use crate::error::{EchError, Result};

/// Default local listen endpoint (SOCKS5 and HTTP share the port).
pub const DEFAULT_LISTEN: &str = "127.0.0.1:30000";
/// Default shared token, sent as the WebSocket subprotocol.
pub const DEFAULT_TOKEN: &str = "147258369";
/// Default bootstrap DoH server used for the ECH lookup.
pub const DEFAULT_DOH_URL: &str = "dns.alidns.com/dns-query";
/// Default name whose HTTPS RR carries the ECHConfigList.
pub const DEFAULT_ECH_DOMAIN: &str = "cloudflare-ech.com";

/// Client-side configuration, immutable per run of the listener.
/// `Engine::update_config` replaces it wholesale and restarts.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Address the SOCKS5/HTTP listener binds
    /// Example: "127.0.0.1:30000"
    pub listen: SocketAddr,
    /// Relay host name; also the TLS SNI (outer and inner)
    pub server_host: String,
    /// Relay port
    pub server_port: u16,
    /// Path of the WebSocket endpoint on the relay
    /// Default: "/"
    #[serde(default = "default_path")]
    pub server_path: String,
    /// Pin the TCP dial to this IP while keeping the SNI from `server_host`
    #[serde(default)]
    pub pinned_ip: Option<IpAddr>,
    /// Shared token carried as the sole `Sec-WebSocket-Protocol`
    pub token: String,
    /// Bootstrap DoH endpoint for the ECH HTTPS-RR lookup
    /// Scheme may be omitted; https is assumed
    pub doh_url: String,
    /// Name whose HTTPS RR advertises the ECHConfigList
    pub ech_domain: String,
    /// Routing mode: global, bypass_cn or none
    pub routing: RoutingMode,
    /// Directory holding traffic_stats.json and the CN-IP range files
    pub store_dir: PathBuf,
}

fn default_path() -> String {
    "/".to_string()
}

impl ClientConfig {
    /// Split a `host:port[/path]` relay endpoint as given on the command
    /// line into its parts.
    pub fn parse_server(s: &str) -> Result<(String, u16, String)> {
        let (hostport, path) = match s.find('/') {
            Some(idx) => (&s[..idx], s[idx..].to_string()),
            None => (s, "/".to_string()),
        };
        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| EchError::Config(format!("server {s:?} is missing a port")))?;
        if host.is_empty() {
            return Err(EchError::Config(format!("server {s:?} is missing a host")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| EchError::Config(format!("invalid server port in {s:?}")))?;
        Ok((host.to_string(), port, path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_host.is_empty() {
            return Err(EchError::Config("server host is required".to_string()));
        }
        if self.server_port == 0 {
            return Err(EchError::Config("server port must be non-zero".to_string()));
        }
        if self.token.is_empty() {
            return Err(EchError::Config("auth token must not be empty".to_string()));
        }
        if self.ech_domain.is_empty() {
            return Err(EchError::Config("ECH query domain is required".to_string()));
        }
        Ok(())
    }
}

/// Relay-server configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Required client token; empty disables the auth gate
    pub token: String,
}
