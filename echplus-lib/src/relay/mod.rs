//! Relay server: terminates the WebSocket leg, dials the ultimate TCP
//! target and pumps bytes both ways.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::session::protocol::{
    parse_connect, CONNECT_PREFIX, DATA_PREFIX, ERROR_PREFIX, MSG_CLOSE, MSG_CONNECTED,
};

/// Read deadline, refreshed on every received message.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const FIRST_FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const COPY_BUF_SIZE: usize = 32 * 1024;

struct RelayState {
    token: String,
}

pub fn router(config: RelayConfig) -> Router {
    let state = Arc::new(RelayState { token: config.token });
    Router::new()
        .route("/health", get(health))
        .fallback(upgrade)
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: RelayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "relay listening");
    axum::serve(
        listener,
        router(config).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

/// Every non-health path requires a WebSocket upgrade whose subprotocol
/// equals the configured token; the accepted protocol echoes it back.
async fn upgrade(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => {
            return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
        }
    };
    if !state.token.is_empty() {
        let offered = headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if offered != Some(state.token.as_str()) {
            warn!(%peer, "rejecting tunnel with missing or wrong token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    }
    let ws = if state.token.is_empty() {
        ws
    } else {
        ws.protocols([state.token.clone()])
    };
    ws.on_upgrade(move |socket| session(socket, peer))
}

type WsSink = SplitSink<WebSocket, Message>;
type WsSource = SplitStream<WebSocket>;
type SharedSink = Arc<Mutex<WsSink>>;

enum Flow {
    Continue,
    Stop,
}

/// Per-connection state machine: one `CONNECT`, then opaque byte pumping
/// until either side closes.
async fn session(ws: WebSocket, peer: SocketAddr) {
    let (sink, mut source) = ws.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));
    let cancel = CancellationToken::new();
    let mut target: Option<OwnedWriteHalf> = None;
    let mut pump: Option<JoinHandle<()>> = None;

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping.tick() => {
                if sink.lock().await.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            msg = timeout(READ_IDLE_TIMEOUT, source.next()) => {
                let msg = match msg {
                    Err(_) => {
                        info!(%peer, "relay session idle, closing");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        debug!(%peer, error = %e, "websocket read ended");
                        break;
                    }
                    Ok(Some(Ok(m))) => m,
                };
                match handle_frame(msg, &mut target, &mut pump, &sink, &cancel, peer).await {
                    Flow::Continue => {}
                    Flow::Stop => break,
                }
            }
        }
    }

    // Tear-down is idempotent: the token is already cancelled when the
    // target pump initiated the close.
    cancel.cancel();
    if let Some(mut wr) = target.take() {
        let _ = wr.shutdown().await;
    }
    if let Some(p) = pump.take() {
        let _ = p.await;
    }
    let _ = sink.lock().await.send(Message::Close(None)).await;
    debug!(%peer, "relay session closed");
}

async fn handle_frame(
    msg: Message,
    target: &mut Option<OwnedWriteHalf>,
    pump: &mut Option<JoinHandle<()>>,
    sink: &SharedSink,
    cancel: &CancellationToken,
    peer: SocketAddr,
) -> Flow {
    match msg {
        Message::Text(text) => handle_text(text, target, pump, sink, cancel, peer).await,
        Message::Binary(data) => {
            let Some(wr) = target.as_mut() else {
                let _ = send_error(sink, "no target connected").await;
                return Flow::Stop;
            };
            if let Err(e) = wr.write_all(&data).await {
                debug!(%peer, error = %e, "target write failed");
                return Flow::Stop;
            }
            Flow::Continue
        }
        Message::Ping(_) | Message::Pong(_) => Flow::Continue,
        Message::Close(_) => Flow::Stop,
    }
}

async fn handle_text(
    text: Utf8Bytes,
    target: &mut Option<OwnedWriteHalf>,
    pump: &mut Option<JoinHandle<()>>,
    sink: &SharedSink,
    cancel: &CancellationToken,
    peer: SocketAddr,
) -> Flow {
    let text = text.as_str();
    if let Some(payload) = text.strip_prefix(CONNECT_PREFIX) {
        if target.is_some() {
            let _ = send_error(sink, "duplicate CONNECT").await;
            return Flow::Stop;
        }
        let request = match parse_connect(payload.as_bytes()) {
            Ok(req) => req,
            Err(reason) => {
                let _ = send_error(sink, &reason).await;
                return Flow::Stop;
            }
        };
        let addr = (request.host.as_str(), request.port);
        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(%peer, host = %request.host, port = request.port, error = %e, "target dial failed");
                let _ = send_error(sink, &format!("dial {}:{}: {e}", request.host, request.port)).await;
                return Flow::Stop;
            }
            Err(_) => {
                let _ = send_error(sink, &format!("dial {}:{} timed out", request.host, request.port)).await;
                return Flow::Stop;
            }
        };
        let (rd, mut wr) = stream.into_split();
        if !request.first_frame.is_empty() {
            let write = timeout(FIRST_FRAME_WRITE_TIMEOUT, wr.write_all(&request.first_frame)).await;
            if !matches!(write, Ok(Ok(()))) {
                let _ = send_error(sink, "first-frame write failed").await;
                return Flow::Stop;
            }
        }
        info!(%peer, host = %request.host, port = request.port, "target connected");
        *target = Some(wr);
        // CONNECTED must precede any pumped target bytes.
        let reply = sink
            .lock()
            .await
            .send(Message::Text(MSG_CONNECTED.into()))
            .await;
        if reply.is_err() {
            return Flow::Stop;
        }
        *pump = Some(tokio::spawn(pump_target(rd, sink.clone(), cancel.clone())));
        return Flow::Continue;
    }

    if let Some(data) = text.strip_prefix(DATA_PREFIX) {
        // Legacy text-encoded payload; binary frames are the normal path.
        let Some(wr) = target.as_mut() else {
            let _ = send_error(sink, "no target connected").await;
            return Flow::Stop;
        };
        if wr.write_all(data.as_bytes()).await.is_err() {
            return Flow::Stop;
        }
        return Flow::Continue;
    }

    if text == MSG_CLOSE {
        return Flow::Stop;
    }

    let _ = send_error(sink, &format!("unsupported frame {text:?}")).await;
    Flow::Stop
}

async fn send_error(sink: &SharedSink, reason: &str) -> std::result::Result<(), axum::Error> {
    sink.lock()
        .await
        .send(Message::Text(format!("{ERROR_PREFIX}{reason}").into()))
        .await
}

/// target → WebSocket. EOF or error sends `CLOSE` and cancels the session.
async fn pump_target(mut rd: OwnedReadHalf, sink: SharedSink, cancel: CancellationToken) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            r = rd.read(&mut buf) => match r {
                Ok(0) => {
                    let _ = sink.lock().await.send(Message::Text(MSG_CLOSE.into())).await;
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "target read ended");
                    let _ = sink.lock().await.send(Message::Text(MSG_CLOSE.into())).await;
                    break;
                }
            },
        };
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if sink.lock().await.send(Message::Binary(chunk)).await.is_err() {
            break;
        }
    }
    cancel.cancel();
}
