#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use echplus_lib::config::{DEFAULT_DOH_URL, DEFAULT_ECH_DOMAIN, DEFAULT_LISTEN, DEFAULT_TOKEN};
use echplus_lib::{ClientConfig, Engine, RoutingMode};
use tokio::io::AsyncBufReadExt;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "EchPlus client: local SOCKS5/HTTP proxy over a TLS-ECH tunnel")]
struct Cli {
    /// Local listen address (SOCKS5 and HTTP share the port)
    #[arg(short = 'l', long = "listen", env = "ECHPLUS_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Relay WSS endpoint, host:port[/path]
    #[arg(short = 'f', long = "server", env = "ECHPLUS_SERVER")]
    server: String,

    /// Pin dialing to this IP; TLS SNI still uses the host from the server endpoint
    #[arg(long = "ip", env = "ECHPLUS_IP")]
    ip: Option<IpAddr>,

    /// Auth token, sent as Sec-WebSocket-Protocol
    #[arg(long = "token", env = "ECHPLUS_TOKEN", default_value = DEFAULT_TOKEN)]
    token: String,

    /// Bootstrap DoH server for the ECH lookup
    #[arg(long = "dns", env = "ECHPLUS_DNS", default_value = DEFAULT_DOH_URL)]
    dns: String,

    /// Name whose HTTPS RR carries the ECHConfigList
    #[arg(long = "ech", env = "ECHPLUS_ECH", default_value = DEFAULT_ECH_DOMAIN)]
    ech: String,

    /// Routing mode: global, bypass_cn or none
    #[arg(long = "routing", env = "ECHPLUS_ROUTING", default_value = "global")]
    routing: RoutingMode,

    /// Directory holding traffic stats and the CN-IP range files
    #[arg(short = 'd', long = "store-dir", env = "ECHPLUS_STORE_DIR", default_value = ".echplus")]
    store_dir: PathBuf,
}

impl Cli {
    fn into_config(self) -> echplus_lib::Result<ClientConfig> {
        let (server_host, server_port, server_path) = ClientConfig::parse_server(&self.server)?;
        Ok(ClientConfig {
            listen: self.listen,
            server_host,
            server_port,
            server_path,
            pinned_ip: self.ip,
            token: self.token,
            doh_url: self.dns,
            ech_domain: self.ech,
            routing: self.routing,
            store_dir: self.store_dir,
        })
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };
    let engine = match Engine::new(config) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            error!(%err, "failed to initialize");
            std::process::exit(1);
        }
    };
    if let Err(err) = engine.start().await {
        error!(%err, "failed to start proxy");
        std::process::exit(1);
    }

    run_repl(&engine).await;

    if engine.is_running().await {
        if let Err(err) = engine.stop().await {
            error!(%err, "shutdown error");
        }
    }
}

async fn run_repl(engine: &Arc<Engine>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                // stdin closed: keep serving until interrupted
                Ok(None) => {
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
                Err(_) => break,
            },
        };
        let mut parts = line.split_whitespace();
        match parts.next() {
            None => continue,
            Some("help") => print_help(),
            Some("status") => print_status(engine).await,
            Some("restart") => match engine.restart().await {
                Ok(()) => println!("restarted"),
                Err(err) => println!("restart failed: {err}"),
            },
            Some("routing") => match parts.next().map(str::parse::<RoutingMode>) {
                Some(Ok(mode)) => match engine.set_routing(mode).await {
                    Ok(()) => println!("routing set to {mode}"),
                    Err(err) => println!("routing change failed: {err}"),
                },
                Some(Err(err)) => println!("{err}"),
                None => println!("usage: routing <global|bypass_cn|none>"),
            },
            Some("quit" | "exit" | "q") => break,
            Some(other) => println!("unknown command {other:?}, try 'help'"),
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  status            show engine state and traffic totals");
    println!("  restart           restart the proxy");
    println!("  routing <mode>    switch to global, bypass_cn or none");
    println!("  quit|exit|q       stop and leave");
}

async fn print_status(engine: &Arc<Engine>) {
    let status = engine.status().await;
    match status.listen {
        Some(addr) => println!("running on {addr}, routing {}", status.routing),
        None => println!("stopped, routing {}", status.routing),
    }
    let totals = engine.stats().total_stats();
    let speed = engine.stats().speed();
    println!(
        "up {} B down {} B, {} B/s up {} B/s down",
        totals.upload, totals.download, speed.upload_bps, speed.download_bps
    );
    for site in engine.stats().top_sites(5) {
        println!(
            "  {:<40} up {:>10} down {:>10} conns {}",
            site.host, site.upload, site.download, site.connections
        );
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
