#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, SocketAddr};

use clap::Parser;
use echplus_lib::config::DEFAULT_TOKEN;
use echplus_lib::{relay, RelayConfig};
use tokio::net::TcpListener;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "EchPlus relay: terminates tunnel WebSockets and dials targets")]
struct Cli {
    /// Token clients must present as the WebSocket subprotocol
    #[arg(short = 't', long = "token", env = "TOKEN", default_value = DEFAULT_TOKEN)]
    token: String,

    /// Port to listen on
    #[arg(short = 'p', long = "port", env = "PORT", default_value_t = 3325)]
    port: u16,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, %addr, "failed to bind");
            std::process::exit(1);
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = relay::serve(listener, RelayConfig { token: cli.token }, shutdown).await {
        error!(%err, "relay exited with error");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
