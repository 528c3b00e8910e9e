use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::net::lookup_host;
use tracing::debug;

use crate::config::RoutingMode;
use crate::geoip::CnIpDatabase;

/// Name resolution seam; injected so routing stays deterministic in tests
/// (the OS resolver caches make `BypassCn` flaky otherwise).
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

fn private_networks() -> &'static Vec<IpNet> {
    static NETS: OnceLock<Vec<IpNet>> = OnceLock::new();
    NETS.get_or_init(|| {
        [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "100.64.0.0/10",
            "::1/128",
            "fc00::/7",
            "fe80::/10",
        ]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
    })
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    private_networks().iter().any(|net| net.contains(&ip))
}

/// Decides direct-vs-tunnel per target host.
pub struct RouteDecider {
    mode: RoutingMode,
    cnip: Arc<CnIpDatabase>,
    resolver: Arc<dyn Resolver>,
}

impl RouteDecider {
    pub fn new(mode: RoutingMode, cnip: Arc<CnIpDatabase>, resolver: Arc<dyn Resolver>) -> Self {
        Self { mode, cnip, resolver }
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// True when `host` should be dialed directly instead of tunneled.
    ///
    /// In `BypassCn` mode a name bypasses when *any* resolved address is
    /// Chinese: a single poisoned foreign record must not drag a domestic
    /// site into the tunnel.
    pub async fn should_bypass(&self, host: &str) -> bool {
        if self.mode == RoutingMode::None {
            return true;
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(ip) {
                return true;
            }
            return match self.mode {
                RoutingMode::Global => false,
                RoutingMode::BypassCn => self.cnip.contains(ip),
                RoutingMode::None => true,
            };
        }

        match self.mode {
            RoutingMode::Global => {
                // Names resolving exclusively to private addresses stay local.
                match self.resolver.resolve(host).await {
                    Ok(addrs) if !addrs.is_empty() => addrs.iter().all(|ip| is_private_ip(*ip)),
                    _ => false,
                }
            }
            RoutingMode::BypassCn => match self.resolver.resolve(host).await {
                Ok(addrs) if !addrs.is_empty() => {
                    if addrs.iter().all(|ip| is_private_ip(*ip)) {
                        return true;
                    }
                    addrs.iter().any(|ip| self.cnip.contains(*ip))
                }
                _ => {
                    debug!(host, "resolution failed, routing through tunnel");
                    false
                }
            },
            RoutingMode::None => true,
        }
    }
}
