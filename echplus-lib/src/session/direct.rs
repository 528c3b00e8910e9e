use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{send_failure, send_success, ClientMode, SessionTarget};
use crate::error::{EchError, Result};
use crate::stats::TrafficStore;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Plain TCP relay for targets routing says to bypass.
pub(crate) async fn run(
    mut client: TcpStream,
    target: &SessionTarget,
    mode: ClientMode,
    first_frame: Vec<u8>,
    stats: &Arc<TrafficStore>,
) -> Result<()> {
    let key = target.to_string();
    let upstream = match timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            let _ = send_failure(&mut client, mode).await;
            return Err(EchError::Dial(format!("direct dial {key}: {e}")));
        }
        Err(_) => {
            let _ = send_failure(&mut client, mode).await;
            return Err(EchError::Dial(format!("direct dial {key} timed out")));
        }
    };

    send_success(&mut client, mode).await?;

    let mut upstream = upstream;
    if !first_frame.is_empty() {
        stats.record_upload(&key, first_frame.len() as u64);
        upstream.write_all(&first_frame).await?;
    }

    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    let up_stats = stats.clone();
    let up_key = key.clone();
    let up = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            match client_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    up_stats.record_upload(&up_key, n as u64);
                    if upstream_wr.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = upstream_wr.shutdown().await;
    });

    let down_stats = stats.clone();
    let down_key = key.clone();
    let down = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            match upstream_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    down_stats.record_download(&down_key, n as u64);
                    if client_wr.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = client_wr.shutdown().await;
    });

    let _ = tokio::join!(up, down);
    debug!(target = %key, "direct session closed");
    Ok(())
}
