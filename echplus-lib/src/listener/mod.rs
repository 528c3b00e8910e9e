pub mod http;
pub mod socks5;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{EchError, Result};
use crate::session::{self, ProxyContext, StreamIntent};

/// Covers protocol negotiation only; streaming runs without a deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of the protocol handshake on an accepted connection.
pub enum Handshake {
    /// A stream session ready to be routed.
    Stream(StreamIntent),
    /// SOCKS5 UDP ASSOCIATE: the relay loop runs until `control` closes.
    UdpAssociate { control: TcpStream, socket: UdpSocket },
}

/// Accept loop. Exits when the shutdown signal fires; in-flight sessions
/// drain on their own.
pub async fn run(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let result = tokio::select! {
            res = listener.accept() => res,
            res = shutdown.changed() => {
                if res.is_ok() {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                } else {
                    // sender dropped; treat as no shutdown signal
                    continue;
                }
            }
        };
        let (stream, addr) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        debug!(%addr, "accepted connection");
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_conn(ctx, stream, addr).await;
        });
    }
}

async fn handle_conn(ctx: Arc<ProxyContext>, stream: TcpStream, peer: SocketAddr) {
    match timeout(HANDSHAKE_TIMEOUT, demux(stream)).await {
        Err(_) => debug!(%peer, "handshake deadline exceeded"),
        Ok(Err(e)) => debug!(%peer, error = %e, "handshake failed"),
        Ok(Ok(Handshake::Stream(intent))) => session::establish(&ctx, intent, peer).await,
        Ok(Ok(Handshake::UdpAssociate { control, socket })) => {
            socks5::run_udp_relay(control, socket, &ctx).await;
        }
    }
}

/// Read exactly one byte and route to the protocol handler; the byte is
/// handed along as the first buffered byte so nothing is consumed twice.
async fn demux(mut stream: TcpStream) -> Result<Handshake> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    match first[0] {
        0x05 => socks5::handshake(stream).await,
        // First letter of a supported HTTP method.
        b'C' | b'G' | b'P' | b'H' | b'D' | b'O' | b'T' => http::handshake(stream, first[0]).await,
        other => Err(EchError::Protocol(format!("unknown protocol byte {other:#04x}"))),
    }
}
