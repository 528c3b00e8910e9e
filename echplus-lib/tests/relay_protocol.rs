#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use echplus_lib::relay;
use echplus_lib::RelayConfig;
use futures_util::{SinkExt, StreamExt};
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::MaybeTlsStream;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
type WsClient = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN: &str = "test-token";

async fn spawn_relay(token: &str) -> TestResult<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let config = RelayConfig { token: token.to_string() };
    tokio::spawn(async move {
        let _ = relay::serve(listener, config, std::future::pending()).await;
    });
    sleep(Duration::from_millis(50)).await;
    Ok(addr)
}

async fn ws_connect(addr: SocketAddr, token: Option<&str>) -> Result<WsClient, WsError> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| WsError::Io(e))?;
    let mut request = format!("ws://{addr}/").into_client_request()?;
    if let Some(token) = token {
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(token).expect("header-safe token"),
        );
    }
    let (ws, _resp) = tokio_tungstenite::client_async(request, MaybeTlsStream::Plain(tcp)).await?;
    Ok(ws)
}

/// Echo server recording everything it reads.
async fn spawn_echo_server() -> TestResult<(SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut s, _)) = listener.accept().await else {
                continue;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match s.read(&mut buf).await {
                        Ok(0) | Err(_) => {
                            let _ = tx.send(Vec::new()); // EOF marker
                            break;
                        }
                        Ok(n) => {
                            let _ = tx.send(buf[..n].to_vec());
                            if s.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    sleep(Duration::from_millis(50)).await;
    Ok((addr, rx))
}

async fn next_text(ws: &mut WsClient) -> TestResult<String> {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await?
            .ok_or("websocket closed")??;
        match msg {
            Message::Text(t) => return Ok(t.as_str().to_string()),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Err(format!("expected text, got {other:?}").into()),
        }
    }
}

async fn next_binary(ws: &mut WsClient) -> TestResult<Vec<u8>> {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await?
            .ok_or("websocket closed")??;
        match msg {
            Message::Binary(b) => return Ok(b.to_vec()),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Err(format!("expected binary, got {other:?}").into()),
        }
    }
}

#[tokio::test]
async fn health_endpoint_answers_ok() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: relay\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.ends_with("OK"), "got: {text}");
    Ok(())
}

#[tokio::test]
async fn non_upgrade_request_gets_426() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET /anything HTTP/1.1\r\nHost: relay\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 426"), "got: {text}");
    Ok(())
}

#[tokio::test]
async fn missing_token_is_rejected_with_401() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    match ws_connect(addr, None).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 401),
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
    match ws_connect(addr, Some("wrong")).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 401),
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn correct_token_upgrades_and_echoes_protocol() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    let tcp = TcpStream::connect(addr).await?;
    let mut request = format!("ws://{addr}/").into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(TOKEN));
    let (_ws, resp) = tokio_tungstenite::client_async(request, MaybeTlsStream::Plain(tcp)).await?;
    let proto = resp
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    assert_eq!(proto, Some(TOKEN));
    Ok(())
}

#[tokio::test]
async fn connect_writes_first_frame_and_relays_binary() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    let (echo_addr, mut seen) = spawn_echo_server().await?;
    let mut ws = ws_connect(addr, Some(TOKEN)).await?;

    ws.send(Message::Text(format!("CONNECT:{echo_addr}|HELLO").into()))
        .await?;

    // The relay writes the first frame before answering CONNECTED.
    let first = timeout(Duration::from_secs(2), seen.recv())
        .await?
        .ok_or("echo server saw nothing")?;
    assert_eq!(first, b"HELLO");
    assert_eq!(next_text(&mut ws).await?, "CONNECTED");
    // The echo of HELLO comes back as a binary frame.
    assert_eq!(next_binary(&mut ws).await?, b"HELLO");

    ws.send(Message::Binary(b"ping".to_vec().into())).await?;
    let relayed = timeout(Duration::from_secs(2), seen.recv())
        .await?
        .ok_or("echo server saw no binary payload")?;
    assert_eq!(relayed, b"ping");
    assert_eq!(next_binary(&mut ws).await?, b"ping");

    // CLOSE tears the target connection down.
    ws.send(Message::Text("CLOSE".into())).await?;
    let eof = timeout(Duration::from_secs(2), seen.recv())
        .await?
        .ok_or("echo server never saw the close")?;
    assert!(eof.is_empty(), "expected EOF marker, got {eof:?}");
    Ok(())
}

#[tokio::test]
async fn legacy_data_text_frames_reach_the_target() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    let (echo_addr, mut seen) = spawn_echo_server().await?;
    let mut ws = ws_connect(addr, Some(TOKEN)).await?;

    ws.send(Message::Text(format!("CONNECT:{echo_addr}|").into()))
        .await?;
    assert_eq!(next_text(&mut ws).await?, "CONNECTED");

    ws.send(Message::Text("DATA:legacy-bytes".into())).await?;
    let relayed = timeout(Duration::from_secs(2), seen.recv())
        .await?
        .ok_or("echo server saw nothing")?;
    assert_eq!(relayed, b"legacy-bytes");
    Ok(())
}

#[tokio::test]
async fn malformed_connect_yields_error_frame() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    let mut ws = ws_connect(addr, Some(TOKEN)).await?;
    ws.send(Message::Text("CONNECT:no-separator".into())).await?;
    let reply = next_text(&mut ws).await?;
    assert!(reply.starts_with("ERROR:"), "got: {reply}");
    Ok(())
}

#[tokio::test]
async fn dial_failure_yields_error_frame() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    // Reserve a port nobody listens on.
    let dead = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let mut ws = ws_connect(addr, Some(TOKEN)).await?;
    ws.send(Message::Text(format!("CONNECT:{dead}|").into()))
        .await?;
    let reply = next_text(&mut ws).await?;
    assert!(reply.starts_with("ERROR:"), "got: {reply}");
    Ok(())
}

#[tokio::test]
async fn binary_before_connect_is_a_protocol_error() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    let mut ws = ws_connect(addr, Some(TOKEN)).await?;
    ws.send(Message::Binary(b"stray".to_vec().into())).await?;
    let reply = next_text(&mut ws).await?;
    assert!(reply.starts_with("ERROR:"), "got: {reply}");
    Ok(())
}

#[tokio::test]
async fn target_eof_sends_close_frame() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    // Target writes a banner, then closes.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let banner_addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut s, _)) = listener.accept().await {
            let _ = s.write_all(b"SSH-2.0-banner\r\n").await;
        }
    });
    sleep(Duration::from_millis(50)).await;

    let mut ws = ws_connect(addr, Some(TOKEN)).await?;
    ws.send(Message::Text(format!("CONNECT:{banner_addr}|").into()))
        .await?;
    assert_eq!(next_text(&mut ws).await?, "CONNECTED");
    assert_eq!(next_binary(&mut ws).await?, b"SSH-2.0-banner\r\n");
    assert_eq!(next_text(&mut ws).await?, "CLOSE");
    Ok(())
}

#[tokio::test]
async fn bracketed_ipv6_connect_is_dialed() -> TestResult<()> {
    let addr = spawn_relay(TOKEN).await?;
    // Not every environment has a loopback v6 interface.
    let Ok(listener) = TcpListener::bind("[::1]:0").await else {
        return Ok(());
    };
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = listener.accept().await {
            let _ = s.write_all(b"v6-banner").await;
        }
    });
    sleep(Duration::from_millis(50)).await;

    let mut ws = ws_connect(addr, Some(TOKEN)).await?;
    ws.send(Message::Text(format!("CONNECT:[::1]:{port}|").into()))
        .await?;
    assert_eq!(next_text(&mut ws).await?, "CONNECTED");
    assert_eq!(next_binary(&mut ws).await?, b"v6-banner");
    Ok(())
}
