pub mod dialer;
pub mod doh;
pub mod resolver;

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::error::{EchError, Result};

pub use dialer::{build_ech_client_config, EchDialer, EchRelayConnector};
pub use doh::{DnsProxy, DohClient};

/// WebSocket connection to the relay, TLS in production and plain in tests.
pub type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Source of ECHConfigList bytes. Production fetches over DoH; tests
/// substitute canned lists.
#[async_trait]
pub trait EchProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// DoH-backed provider querying `domain`'s HTTPS RR.
pub struct DohEchProvider {
    client: reqwest::Client,
    doh_url: String,
    domain: String,
}

impl DohEchProvider {
    pub fn new(client: reqwest::Client, doh_url: String, domain: String) -> Self {
        Self { client, doh_url, domain }
    }
}

#[async_trait]
impl EchProvider for DohEchProvider {
    async fn fetch(&self) -> Result<Vec<u8>> {
        resolver::query_ech_config(&self.client, &self.doh_url, &self.domain).await
    }
}

/// Holds the current ECHConfigList. Readers take a snapshot for the
/// duration of one dial; `refresh` swaps the whole list atomically, so the
/// state is always either empty-and-unusable or complete.
pub struct EchManager {
    list: ArcSwap<Vec<u8>>,
    provider: Arc<dyn EchProvider>,
}

impl EchManager {
    /// Fetch the initial list. Failure here is fatal at start-up.
    pub async fn bootstrap(provider: Arc<dyn EchProvider>) -> Result<Self> {
        let list = provider.fetch().await?;
        if list.is_empty() {
            return Err(EchError::EchUnavailable("provider returned an empty list".to_string()));
        }
        info!(len = list.len(), "ECH config list acquired");
        Ok(Self { list: ArcSwap::from_pointee(list), provider })
    }

    pub fn snapshot(&self) -> Result<Arc<Vec<u8>>> {
        let list = self.list.load_full();
        if list.is_empty() {
            return Err(EchError::EchUnavailable("no ECH config list loaded".to_string()));
        }
        Ok(list)
    }

    pub async fn refresh(&self) -> Result<()> {
        let list = self.provider.fetch().await?;
        if list.is_empty() {
            return Err(EchError::EchUnavailable("refresh returned an empty list".to_string()));
        }
        info!(len = list.len(), "ECH config list refreshed");
        self.list.store(Arc::new(list));
        Ok(())
    }
}

/// Run `attempt` up to twice, refreshing the ECH list in between when the
/// first failure is ECH-tagged. Any other failure is returned as-is.
pub async fn dial_with_ech_retry<T, F, Fut>(ech: &EchManager, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match attempt().await {
        Ok(v) => Ok(v),
        Err(e) if e.mentions_ech() => {
            warn!(error = %e, "ECH-tagged dial failure, refreshing config list");
            ech.refresh().await?;
            attempt().await
        }
        Err(e) => Err(e),
    }
}

/// Produces relay connections. The production implementation dials
/// TLS-ECH; tests connect over plain WebSocket.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<RelayStream>;
}
