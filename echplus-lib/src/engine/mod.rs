//! Lifecycle controller: Start, Stop, Restart and UpdateConfig over the
//! client proxy core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ClientConfig, RoutingMode};
use crate::ech::{DohClient, DohEchProvider, EchDialer, EchManager, EchRelayConnector};
use crate::error::{EchError, Result};
use crate::geoip::CnIpDatabase;
use crate::listener;
use crate::routing::{RouteDecider, SystemResolver};
use crate::session::ProxyContext;
use crate::stats::{TrafficStore, AUTOSAVE_INTERVAL};

const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub running: bool,
    pub listen: Option<SocketAddr>,
    pub routing: RoutingMode,
}

/// Owns the proxy's lifecycle. States are Stopped and Running; the traffic
/// store survives restarts so counters keep accumulating.
pub struct Engine {
    config: Mutex<ClientConfig>,
    running: Mutex<Option<Running>>,
    stats: Arc<TrafficStore>,
}

impl Engine {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        if let Err(e) = std::fs::create_dir_all(&config.store_dir) {
            return Err(EchError::Persistence(format!(
                "create store dir {}: {e}",
                config.store_dir.display()
            )));
        }
        let stats = Arc::new(TrafficStore::open(&config.store_dir));
        Ok(Self { config: Mutex::new(config), running: Mutex::new(None), stats })
    }

    pub fn stats(&self) -> &Arc<TrafficStore> {
        &self.stats
    }

    /// Acquire ECH, load the CN-IP tables, bind the listener and spawn the
    /// background tasks. ECH failure aborts; a missing CN-IP list is only
    /// logged.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(EchError::Config("engine is already running".to_string()));
        }
        let config = self.config.lock().await.clone();
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()
            .map_err(|e| EchError::Config(format!("HTTP client: {e}")))?;

        let provider = Arc::new(DohEchProvider::new(
            http.clone(),
            config.doh_url.clone(),
            config.ech_domain.clone(),
        ));
        let ech = Arc::new(EchManager::bootstrap(provider).await?);

        let cnip = match CnIpDatabase::load(&config.store_dir, &http).await {
            Ok(db) => Arc::new(db),
            Err(e) => {
                warn!(error = %e, "CN-IP load failed, bypass_cn matches nothing");
                Arc::new(CnIpDatabase::empty())
            }
        };

        let dialer = EchDialer::new(ech.clone(), config.pinned_ip);
        let connector = Arc::new(EchRelayConnector::new(
            dialer.clone(),
            config.server_host.clone(),
            config.server_port,
            config.server_path.clone(),
            config.token.clone(),
        ));
        let ctx = Arc::new(ProxyContext {
            stats: self.stats.clone(),
            decider: RouteDecider::new(config.routing, cnip, Arc::new(SystemResolver)),
            connector,
            dns: Arc::new(DohClient::new(dialer)),
        });

        let tcp = TcpListener::bind(config.listen).await.map_err(|e| {
            EchError::Config(format!("bind {}: {e}", config.listen))
        })?;
        let local_addr = tcp.local_addr()?;
        info!(%local_addr, routing = %config.routing, "proxy listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(listener::run(tcp, ctx, shutdown_rx.clone())));
        tasks.push(tokio::spawn(autosave_loop(self.stats.clone(), shutdown_rx.clone())));
        tasks.push(tokio::spawn(speed_sampler(self.stats.clone(), shutdown_rx)));

        *running = Some(Running { shutdown: shutdown_tx, tasks, local_addr });
        Ok(())
    }

    /// Stop the accept loop and background tasks, then snapshot the stats.
    /// In-flight sessions drain on their own.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(EchError::Config("engine is not running".to_string()));
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "background task failed");
                }
            }
        }
        if let Err(e) = self.stats.save() {
            warn!(error = %e, "failed to save traffic stats on stop");
        }
        info!("proxy stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        if self.is_running().await {
            self.stop().await?;
        }
        self.start().await
    }

    /// Replace the configuration atomically; a running engine restarts to
    /// pick it up.
    pub async fn update_config(&self, config: ClientConfig) -> Result<()> {
        config.validate()?;
        let was_running = self.is_running().await;
        *self.config.lock().await = config;
        if was_running {
            self.restart().await?;
        }
        Ok(())
    }

    pub async fn set_routing(&self, mode: RoutingMode) -> Result<()> {
        let mut config = self.config.lock().await.clone();
        config.routing = mode;
        self.update_config(config).await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn status(&self) -> EngineStatus {
        let running = self.running.lock().await;
        let config = self.config.lock().await;
        EngineStatus {
            running: running.is_some(),
            listen: running.as_ref().map(|r| r.local_addr),
            routing: config.routing,
        }
    }
}

async fn autosave_loop(stats: Arc<TrafficStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(AUTOSAVE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = stats.save() {
                    warn!(error = %e, "traffic autosave failed");
                }
            }
        }
    }
}

async fn speed_sampler(stats: Arc<TrafficStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SPEED_SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => stats.sample_speed(),
        }
    }
}
