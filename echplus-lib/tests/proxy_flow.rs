#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use echplus_lib::ech::{DnsProxy, RelayConnector, RelayStream};
use echplus_lib::relay;
use echplus_lib::session::ProxyContext;
use echplus_lib::{
    listener, CnIpDatabase, EchError, RelayConfig, Resolver, RouteDecider, RoutingMode,
    TrafficStore,
};
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::MaybeTlsStream;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const TOKEN: &str = "test-token";

/// Plain-WS connector standing in for the TLS-ECH dialer.
struct PlainConnector {
    addr: SocketAddr,
    token: String,
}

#[async_trait]
impl RelayConnector for PlainConnector {
    async fn connect(&self) -> echplus_lib::Result<RelayStream> {
        let tcp = TcpStream::connect(self.addr)
            .await
            .map_err(|e| EchError::Dial(e.to_string()))?;
        let mut request = format!("ws://{}/", self.addr)
            .into_client_request()
            .map_err(|e| EchError::Config(e.to_string()))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&self.token).map_err(|e| EchError::Config(e.to_string()))?,
        );
        let (ws, _) = tokio_tungstenite::client_async(request, MaybeTlsStream::Plain(tcp))
            .await
            .map_err(|e| EchError::Dial(e.to_string()))?;
        Ok(ws)
    }
}

struct NullDns;

#[async_trait]
impl DnsProxy for NullDns {
    async fn query(&self, _packet: &[u8]) -> echplus_lib::Result<Vec<u8>> {
        Err(EchError::Dial("no DNS in this test".to_string()))
    }
}

/// Answers every name with a fixed address so routing can be steered from
/// the test: a public address forces the tunnel, a private one the bypass.
struct FixedResolver(IpAddr);

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec![self.0])
    }
}

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

async fn spawn_proxy(
    connector: Arc<dyn RelayConnector>,
    resolver: Arc<dyn Resolver>,
    stats: Arc<TrafficStore>,
) -> TestResult<(SocketAddr, watch::Sender<bool>)> {
    let ctx = Arc::new(ProxyContext {
        stats,
        decider: RouteDecider::new(RoutingMode::Global, Arc::new(CnIpDatabase::empty()), resolver),
        connector,
        dns: Arc::new(NullDns),
    });
    let tcp = TcpListener::bind("127.0.0.1:0").await?;
    let addr = tcp.local_addr()?;
    let (tx, rx) = watch::channel(false);
    tokio::spawn(listener::run(tcp, ctx, rx));
    sleep(Duration::from_millis(50)).await;
    Ok((addr, tx))
}

fn temp_stats() -> (tempfile::TempDir, Arc<TrafficStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let stats = Arc::new(TrafficStore::open(dir.path()));
    (dir, stats)
}

async fn spawn_echo_server() -> TestResult<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut s, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match s.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
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
    Ok(addr)
}

/// Minimal HTTP origin recording the request head it sees.
async fn spawn_http_origin() -> TestResult<(SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>)> {
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
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match s.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = tx.send(buf);
                let _ = s
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi")
                    .await;
            });
        }
    });
    sleep(Duration::from_millis(50)).await;
    Ok((addr, rx))
}

async fn socks5_connect_localhost(proxy: SocketAddr, port: u16) -> TestResult<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 9];
    request.extend_from_slice(b"localhost");
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    Ok(stream)
}

#[tokio::test]
async fn socks5_connect_through_tunnel() -> TestResult<()> {
    let relay_addr = spawn_relay(TOKEN).await?;
    let echo_addr = spawn_echo_server().await?;
    let (_dir, stats) = temp_stats();
    // "localhost" resolves to a public address for the decider, so the
    // session takes the tunnel; the relay itself dials localhost fine.
    let (proxy, _shutdown) = spawn_proxy(
        Arc::new(PlainConnector { addr: relay_addr, token: TOKEN.to_string() }),
        Arc::new(FixedResolver("8.8.8.8".parse()?)),
        stats.clone(),
    )
    .await?;

    let mut stream = socks5_connect_localhost(proxy, echo_addr.port()).await?;
    stream.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"ping");

    let key = format!("localhost:{}", echo_addr.port());
    let site = stats.site_stats(&key).ok_or("no stats recorded")?;
    assert!(site.upload > 0);
    assert!(site.download > 0);
    assert!(site.connections >= 1);
    Ok(())
}

#[tokio::test]
async fn socks5_connect_direct_for_private_target() -> TestResult<()> {
    let echo_addr = spawn_echo_server().await?;
    let (_dir, stats) = temp_stats();
    // Failing connector proves the bypass: any tunnel attempt would error.
    let dead = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let (proxy, _shutdown) = spawn_proxy(
        Arc::new(PlainConnector { addr: dead, token: TOKEN.to_string() }),
        Arc::new(FixedResolver("127.0.0.1".parse()?)),
        stats.clone(),
    )
    .await?;

    let mut stream = socks5_connect_localhost(proxy, echo_addr.port()).await?;
    stream.write_all(b"direct").await?;
    let mut buf = [0u8; 6];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"direct");
    Ok(())
}

#[tokio::test]
async fn socks5_tunnel_failure_maps_to_host_unreachable() -> TestResult<()> {
    let (_dir, stats) = temp_stats();
    let dead = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let (proxy, _shutdown) = spawn_proxy(
        Arc::new(PlainConnector { addr: dead, token: TOKEN.to_string() }),
        Arc::new(FixedResolver("8.8.8.8".parse()?)),
        stats,
    )
    .await?;

    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
    request.extend_from_slice(b"tunnel.test");
    request.extend_from_slice(&80u16.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply)).await??;
    assert_eq!(reply[..4], [0x05, 0x04, 0x00, 0x01]);
    Ok(())
}

#[tokio::test]
async fn http_absolute_form_rewrites_and_tunnels() -> TestResult<()> {
    let relay_addr = spawn_relay(TOKEN).await?;
    let (origin_addr, mut seen) = spawn_http_origin().await?;
    let (_dir, stats) = temp_stats();
    let (proxy, _shutdown) = spawn_proxy(
        Arc::new(PlainConnector { addr: relay_addr, token: TOKEN.to_string() }),
        Arc::new(FixedResolver("8.8.8.8".parse()?)),
        stats.clone(),
    )
    .await?;

    let port = origin_addr.port();
    let mut stream = TcpStream::connect(proxy).await?;
    let request = format!(
        "GET http://localhost:{port}/ip HTTP/1.1\r\nHost: localhost:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    timeout(Duration::from_secs(2), stream.read_to_end(&mut response)).await??;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
    assert!(text.ends_with("hi"), "got: {text}");

    let head = timeout(Duration::from_secs(2), seen.recv())
        .await?
        .ok_or("origin saw nothing")?;
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("GET /ip HTTP/1.1\r\n"), "got: {head}");
    assert!(!head.contains("Proxy-Connection"), "got: {head}");

    let key = format!("localhost:{port}");
    let site = stats.site_stats(&key).ok_or("no stats recorded")?;
    assert!(site.upload > 0);
    assert!(site.download > 0);
    Ok(())
}

#[tokio::test]
async fn http_connect_through_tunnel() -> TestResult<()> {
    let relay_addr = spawn_relay(TOKEN).await?;
    let echo_addr = spawn_echo_server().await?;
    let (_dir, stats) = temp_stats();
    let (proxy, _shutdown) = spawn_proxy(
        Arc::new(PlainConnector { addr: relay_addr, token: TOKEN.to_string() }),
        Arc::new(FixedResolver("8.8.8.8".parse()?)),
        stats,
    )
    .await?;

    let mut stream = TcpStream::connect(proxy).await?;
    let request = format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", echo_addr.port());
    stream.write_all(request.as_bytes()).await?;

    let mut reply = [0u8; 39];
    timeout(Duration::from_secs(2), stream.read_exact(&mut reply)).await??;
    assert_eq!(&reply[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

    stream.write_all(b"tls-ish bytes").await?;
    let mut buf = [0u8; 13];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"tls-ish bytes");
    Ok(())
}

#[tokio::test]
async fn http_tunnel_failure_maps_to_502() -> TestResult<()> {
    let (_dir, stats) = temp_stats();
    let dead = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let (proxy, _shutdown) = spawn_proxy(
        Arc::new(PlainConnector { addr: dead, token: TOKEN.to_string() }),
        Arc::new(FixedResolver("8.8.8.8".parse()?)),
        stats,
    )
    .await?;

    let mut stream = TcpStream::connect(proxy).await?;
    stream
        .write_all(b"CONNECT unreachable.test:443 HTTP/1.1\r\n\r\n")
        .await?;
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await??;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 502"), "got: {text}");
    Ok(())
}

#[tokio::test]
async fn unknown_protocol_byte_closes_the_connection() -> TestResult<()> {
    let (_dir, stats) = temp_stats();
    let dead = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let (proxy, _shutdown) = spawn_proxy(
        Arc::new(PlainConnector { addr: dead, token: TOKEN.to_string() }),
        Arc::new(FixedResolver("8.8.8.8".parse()?)),
        stats,
    )
    .await?;

    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(&[0xff, 0x00, 0x01]).await?;
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf)).await??;
    assert_eq!(n, 0, "expected the listener to drop the connection");
    Ok(())
}

#[tokio::test]
async fn listener_survives_relay_outage() -> TestResult<()> {
    let echo_addr = spawn_echo_server().await?;
    let (_dir, stats) = temp_stats();

    // Reserve a port for the relay without starting it yet.
    let reserved = TcpListener::bind("127.0.0.1:0").await?;
    let relay_addr = reserved.local_addr()?;
    drop(reserved);

    let (proxy, _shutdown) = spawn_proxy(
        Arc::new(PlainConnector { addr: relay_addr, token: TOKEN.to_string() }),
        Arc::new(FixedResolver("8.8.8.8".parse()?)),
        stats,
    )
    .await?;

    // First request fails: relay is down.
    {
        let mut stream = TcpStream::connect(proxy).await?;
        stream
            .write_all(b"CONNECT localhost:1 HTTP/1.1\r\n\r\n")
            .await?;
        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await??;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502"));
    }

    // Relay comes back on the reserved port; the listener kept accepting.
    let listener = TcpListener::bind(relay_addr).await?;
    let config = RelayConfig { token: TOKEN.to_string() };
    tokio::spawn(async move {
        let _ = relay::serve(listener, config, std::future::pending()).await;
    });
    sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect(proxy).await?;
    let request = format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", echo_addr.port());
    stream.write_all(request.as_bytes()).await?;
    let mut reply = [0u8; 39];
    timeout(Duration::from_secs(2), stream.read_exact(&mut reply)).await??;
    assert_eq!(&reply[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");
    Ok(())
}
