//! SOCKS5 handler, RFC 1928 subset: CONNECT and DNS-only UDP ASSOCIATE.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use super::Handshake;
use crate::error::{EchError, Result};
use crate::session::{ClientMode, ProxyContext, SessionTarget, StreamIntent};

const VER: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Host the DNS bytes actually travel through; UDP ASSOCIATE traffic is
/// accounted there.
const DNS_STATS_KEY: &str = "cloudflare-dns.com:443";

/// Method negotiation plus the request; the version byte was consumed by
/// the demux.
pub(crate) async fn handshake(mut stream: TcpStream) -> Result<Handshake> {
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await?;
    // Any offered method list is answered with "no authentication".
    stream.write_all(&[VER, 0x00]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VER {
        return Err(EchError::Protocol(format!("bad SOCKS version {:#04x}", head[0])));
    }
    let cmd = head[1];
    let atyp = head[3];

    match cmd {
        CMD_CONNECT => {
            let target = read_target(&mut stream, atyp).await?;
            Ok(Handshake::Stream(StreamIntent {
                stream,
                target,
                mode: ClientMode::Socks5,
                first_frame: Vec::new(),
            }))
        }
        CMD_UDP_ASSOCIATE => {
            // The client-advertised address is irrelevant for our DNS-only
            // relay but must still be consumed.
            let _ = read_target(&mut stream, atyp).await?;
            let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
            let port = socket.local_addr()?.port();
            let mut reply = vec![VER, 0x00, 0x00, ATYP_V4];
            reply.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
            reply.extend_from_slice(&port.to_be_bytes());
            stream.write_all(&reply).await?;
            debug!(port, "UDP associate bound");
            Ok(Handshake::UdpAssociate { control: stream, socket })
        }
        other => {
            reply_error(&mut stream, REP_COMMAND_NOT_SUPPORTED).await;
            Err(EchError::Protocol(format!("unsupported SOCKS command {other:#04x}")))
        }
    }
}

async fn read_target(stream: &mut TcpStream, atyp: u8) -> Result<SessionTarget> {
    let host = match atyp {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| EchError::Protocol("domain is not valid UTF-8".to_string()))?
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            reply_error(stream, REP_ATYP_NOT_SUPPORTED).await;
            return Err(EchError::Protocol(format!("unsupported ATYP {other:#04x}")));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SessionTarget { host, port: u16::from_be_bytes(port) })
}

async fn reply_error(stream: &mut TcpStream, code: u8) {
    let _ = stream
        .write_all(&[VER, code, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0])
        .await;
}

/// Relay SOCKS5 UDP datagrams carrying DNS queries through the in-tunnel
/// DoH client; everything else is dropped. Ends when the TCP control
/// connection closes.
pub(crate) async fn run_udp_relay(mut control: TcpStream, socket: UdpSocket, ctx: &ProxyContext) {
    let mut ctrl_buf = [0u8; 1];
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            r = control.read(&mut ctrl_buf) => match r {
                // Any read on the control connection only serves as the
                // keep-alive indicator.
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
            r = socket.recv_from(&mut buf) => {
                let (n, from) = match r {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "UDP relay read failed");
                        break;
                    }
                };
                let Some((offset, port)) = parse_udp_header(&buf[..n]) else {
                    debug!("dropping malformed SOCKS5 UDP datagram");
                    continue;
                };
                if port != 53 {
                    debug!(port, "dropping non-DNS UDP datagram");
                    continue;
                }
                let query = &buf[offset..n];
                ctx.stats.record_upload(DNS_STATS_KEY, query.len() as u64);
                match ctx.dns.query(query).await {
                    Ok(answer) => {
                        ctx.stats.record_download(DNS_STATS_KEY, answer.len() as u64);
                        let mut out = buf[..offset].to_vec();
                        out.extend_from_slice(&answer);
                        if let Err(e) = socket.send_to(&out, from).await {
                            debug!(error = %e, "UDP relay send failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "in-tunnel DNS query failed"),
                }
            }
        }
    }
    debug!("UDP associate closed");
}

/// Parse the SOCKS5 UDP request header `RSV RSV FRAG ATYP ADDR PORT`;
/// returns the payload offset and the destination port. Fragmented
/// datagrams are not supported.
fn parse_udp_header(buf: &[u8]) -> Option<(usize, u16)> {
    if buf.len() < 4 || buf[0] != 0 || buf[1] != 0 || buf[2] != 0 {
        return None;
    }
    let addr_len = match buf[3] {
        ATYP_V4 => 4,
        ATYP_DOMAIN => 1 + *buf.get(4)? as usize,
        ATYP_V6 => 16,
        _ => return None,
    };
    let offset = 4 + addr_len + 2;
    if buf.len() < offset {
        return None;
    }
    let port = u16::from_be_bytes([buf[offset - 2], buf[offset - 1]]);
    Some((offset, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_header_v4() {
        // dest 1.2.3.4:53, payload "Q"
        let mut dgram = vec![0, 0, 0, ATYP_V4, 1, 2, 3, 4, 0, 53];
        dgram.push(b'Q');
        let (offset, port) = parse_udp_header(&dgram).unwrap();
        assert_eq!(port, 53);
        assert_eq!(&dgram[offset..], b"Q");
    }

    #[test]
    fn udp_header_domain() {
        let mut dgram = vec![0, 0, 0, ATYP_DOMAIN, 3];
        dgram.extend_from_slice(b"dns");
        dgram.extend_from_slice(&53u16.to_be_bytes());
        dgram.extend_from_slice(b"payload");
        let (offset, port) = parse_udp_header(&dgram).unwrap();
        assert_eq!(port, 53);
        assert_eq!(&dgram[offset..], b"payload");
    }

    #[test]
    fn udp_header_rejects_fragments_and_short_input() {
        assert!(parse_udp_header(&[0, 0, 1, ATYP_V4, 1, 2, 3, 4, 0, 53]).is_none());
        assert!(parse_udp_header(&[0, 0, 0]).is_none());
        assert!(parse_udp_header(&[0, 0, 0, ATYP_V4, 1, 2]).is_none());
        assert!(parse_udp_header(&[0, 0, 0, 0x09, 1, 2, 3, 4, 0, 53]).is_none());
    }
}
