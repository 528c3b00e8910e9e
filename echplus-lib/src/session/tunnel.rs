use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::{CONNECT_PREFIX, DATA_PREFIX, ERROR_PREFIX, MSG_CLOSE, MSG_CONNECTED};
use super::{send_failure, send_success, ClientMode, SessionTarget};
use crate::ech::RelayStream;
use crate::error::{EchError, Result};
use crate::stats::TrafficStore;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the opportunistic first-frame read on SOCKS5 sessions.
const FIRST_FRAME_WINDOW: Duration = Duration::from_millis(100);
const COPY_BUF_SIZE: usize = 32 * 1024;

type WsSink = SplitSink<RelayStream, Message>;
type WsSource = SplitStream<RelayStream>;
type SharedSink = Arc<Mutex<WsSink>>;

/// Relay one client connection through an established relay WebSocket.
///
/// All WS writes (heartbeat, CONNECT, upstream data, CLOSE) go through one
/// lock; the read side has a single consumer. One cancellation token stops
/// the up-pump, down-pump and heartbeat together.
pub(crate) async fn run(
    ws: RelayStream,
    mut client: TcpStream,
    target: &SessionTarget,
    mode: ClientMode,
    mut first_frame: Vec<u8>,
    stats: &Arc<TrafficStore>,
) -> Result<()> {
    let key = target.to_string();
    let (sink, mut source) = ws.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    // A SOCKS5 client only speaks once it has seen the success reply, so
    // that reply goes out as soon as the relay leg is up; the short read
    // that follows captures client-speaks-first protocols (TLS
    // ClientHello) into the first-frame, saving one round trip.
    let mut reply_sent = false;
    if mode == ClientMode::Socks5 {
        send_success(&mut client, mode).await?;
        reply_sent = true;
        if first_frame.is_empty() {
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            if let Ok(Ok(n)) = timeout(FIRST_FRAME_WINDOW, client.read(&mut buf)).await {
                buf.truncate(n);
                first_frame = buf;
            }
        }
    }

    let connect_text = format!("{CONNECT_PREFIX}{key}|");
    stats.record_upload(&key, (connect_text.len() + first_frame.len()) as u64);
    {
        let mut sink = sink.lock().await;
        sink.send(Message::Text(connect_text.into()))
            .await
            .map_err(|e| EchError::Dial(format!("relay CONNECT send failed: {e}")))?;
        // The first-frame rides a binary frame right behind CONNECT; text
        // frames cannot carry arbitrary bytes.
        if !first_frame.is_empty() {
            sink.send(Message::Binary(Bytes::from(std::mem::take(&mut first_frame))))
                .await
                .map_err(|e| EchError::Dial(format!("relay first-frame send failed: {e}")))?;
        }
    }

    await_connected(&mut source, &mut client, mode, reply_sent).await?;
    if !reply_sent {
        send_success(&mut client, mode).await?;
    }

    let cancel = CancellationToken::new();
    let (client_rd, client_wr) = client.into_split();

    let up = tokio::spawn(up_pump(
        client_rd,
        sink.clone(),
        stats.clone(),
        key.clone(),
        cancel.clone(),
    ));
    let down = tokio::spawn(down_pump(source, client_wr, stats.clone(), key.clone(), cancel.clone()));
    let hb = tokio::spawn(heartbeat(sink.clone(), cancel.clone()));

    let _ = tokio::join!(up, down);
    cancel.cancel();
    let _ = hb.await;

    let _ = sink.lock().await.close().await;
    debug!(target = %key, "tunnel session closed");
    Ok(())
}

/// Wait for exactly one control reply to CONNECT.
async fn await_connected(
    source: &mut WsSource,
    client: &mut TcpStream,
    mode: ClientMode,
    reply_sent: bool,
) -> Result<()> {
    let reply = loop {
        let msg = timeout(CONNECT_REPLY_TIMEOUT, source.next())
            .await
            .map_err(|_| EchError::Dial("relay did not answer CONNECT".to_string()))?;
        match msg {
            Some(Ok(Message::Text(t))) => break t,
            // Heartbeats may interleave with the reply.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => {
                return Err(EchError::Protocol(format!(
                    "unexpected relay frame while connecting: {other:?}"
                )));
            }
            Some(Err(e)) => return Err(EchError::Dial(format!("relay read failed: {e}"))),
            None => return Err(EchError::Dial("relay closed before CONNECTED".to_string())),
        }
    };

    if reply.as_str() == MSG_CONNECTED {
        return Ok(());
    }
    if let Some(reason) = reply.as_str().strip_prefix(ERROR_PREFIX) {
        if !reply_sent {
            let _ = send_failure(client, mode).await;
        }
        return Err(EchError::Dial(format!("relay: {reason}")));
    }
    Err(EchError::Protocol(format!("unexpected relay reply {:?}", reply.as_str())))
}

/// client → relay. EOF or error sends `CLOSE` and cancels the session.
async fn up_pump(
    mut client: OwnedReadHalf,
    sink: SharedSink,
    stats: Arc<TrafficStore>,
    key: String,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            r = client.read(&mut buf) => match r {
                Ok(0) => {
                    let _ = sink.lock().await.send(Message::Text(MSG_CLOSE.into())).await;
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    super::log_io_end("client read ended", &e);
                    let _ = sink.lock().await.send(Message::Text(MSG_CLOSE.into())).await;
                    break;
                }
            },
        };
        stats.record_upload(&key, n as u64);
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if let Err(e) = sink.lock().await.send(Message::Binary(chunk)).await {
            debug!(error = %e, "relay write failed");
            break;
        }
    }
    cancel.cancel();
}

/// relay → client. `CLOSE`, read errors and stream end cancel the session.
async fn down_pump(
    mut source: WsSource,
    mut client: OwnedWriteHalf,
    stats: Arc<TrafficStore>,
    key: String,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            m = source.next() => m,
        };
        match msg {
            Some(Ok(Message::Binary(data))) => {
                stats.record_download(&key, data.len() as u64);
                if let Err(e) = client.write_all(&data).await {
                    super::log_io_end("client write ended", &e);
                    break;
                }
            }
            Some(Ok(Message::Text(t))) => {
                let text = t.as_str();
                if text == MSG_CLOSE {
                    break;
                }
                if let Some(data) = text.strip_prefix(DATA_PREFIX) {
                    // Legacy text-encoded payload.
                    stats.record_download(&key, data.len() as u64);
                    if client.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                } else if !text.starts_with(CONNECT_PREFIX) {
                    debug!(frame = text, "ignoring unexpected relay text frame");
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "relay read ended");
                break;
            }
        }
    }
    let _ = client.shutdown().await;
    cancel.cancel();
}

/// Ping the relay on a fixed cadence, serialized with data writes.
async fn heartbeat(sink: SharedSink, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sink.lock().await.send(Message::Ping(Bytes::new())).await {
                    warn!(error = %e, "heartbeat failed");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}
