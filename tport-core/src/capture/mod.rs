//! Traffic diagnostics: HEP-style capture and the text dump file.
//!
//! Every message a master sends or receives can be mirrored to a capture
//! server (`udp:host:port`) wrapped in a small binary header, and/or appended
//! to a dump file with a timestamped banner.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const HEP_VERSION: u8 = 1;
const FAMILY_V4: u8 = 2;
const FAMILY_V6: u8 = 10;

/// Which way a message travelled, relative to the local stack.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Traffic {
    Sent,
    Received,
}

/// The fixed capture envelope.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct HepHeader {
    pub version: u8,
    /// IP protocol number of the transport (17, 6 or 132).
    pub protocol: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl HepHeader {
    pub fn new(protocol: u8, src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            version: HEP_VERSION,
            protocol,
            src,
            dst,
        }
    }

    /// Header length on the wire. Mixed-family pairs are sent as IPv6.
    pub fn header_len(&self) -> usize {
        if self.is_v4() {
            4 + 4 + 4 + 4
        } else {
            4 + 16 + 16 + 4
        }
    }

    fn is_v4(&self) -> bool {
        self.src.is_ipv4() && self.dst.is_ipv4()
    }

    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header_len() + payload.len());
        let family = if self.is_v4() { FAMILY_V4 } else { FAMILY_V6 };
        buf.put_u8((self.version << 4) | family);
        buf.put_u8(self.protocol);
        buf.put_u16(self.header_len() as u16);
        if self.is_v4() {
            buf.put_slice(&v4(self.src.ip()).octets());
            buf.put_slice(&v4(self.dst.ip()).octets());
        } else {
            buf.put_slice(&v6(self.src.ip()).octets());
            buf.put_slice(&v6(self.dst.ip()).octets());
        }
        buf.put_u16(self.src.port());
        buf.put_u16(self.dst.port());
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Splits a captured datagram into header and payload.
    pub fn decode(mut packet: Bytes) -> Result<(HepHeader, Bytes)> {
        let short = || Error::Protocol("truncated capture header".into());
        if packet.len() < 4 {
            return Err(short());
        }
        let first = packet.get_u8();
        let protocol = packet.get_u8();
        let len = packet.get_u16() as usize;
        let (version, family) = (first >> 4, first & 0x0f);
        let addr_len = match family {
            FAMILY_V4 => 4,
            FAMILY_V6 => 16,
            other => return Err(Error::Protocol(format!("unknown capture family {other}"))),
        };
        if len != 4 + 2 * addr_len + 4 || packet.len() < len - 4 {
            return Err(short());
        }
        let mut ip = || -> IpAddr {
            if addr_len == 4 {
                let mut o = [0u8; 4];
                packet.copy_to_slice(&mut o);
                IpAddr::V4(Ipv4Addr::from(o))
            } else {
                let mut o = [0u8; 16];
                packet.copy_to_slice(&mut o);
                IpAddr::V6(Ipv6Addr::from(o))
            }
        };
        let (src_ip, dst_ip) = (ip(), ip());
        let src = SocketAddr::new(src_ip, packet.get_u16());
        let dst = SocketAddr::new(dst_ip, packet.get_u16());
        Ok((
            HepHeader {
                version,
                protocol,
                src,
                dst,
            },
            packet,
        ))
    }
}

fn v4(ip: IpAddr) -> Ipv4Addr {
    match ip {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}

fn v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    }
}

/// Where captured traffic goes, parsed from `proto:host:port`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CaptureTarget {
    pub host: String,
    pub port: u16,
}

impl FromStr for CaptureTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("capture target {s:?}, want udp:host:port"));
        let (proto, rest) = s.split_once(':').ok_or_else(invalid)?;
        if !proto.eq_ignore_ascii_case("udp") {
            return Err(Error::NotSupported("capture over anything but udp"));
        }
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Mirrors traffic to a capture server. Sends never block; a capture
/// datagram that cannot be sent right away is lost.
pub struct Capture {
    socket: UdpSocket,
    server: SocketAddr,
}

impl Capture {
    pub fn connect(target: &CaptureTarget) -> Result<Capture> {
        let server = std::net::ToSocketAddrs::to_socket_addrs(&(target.host.as_str(), target.port))
            .with_context(|| format!("resolve capture server {}:{}", target.host, target.port))?
            .next()
            .ok_or_else(|| Error::Config(format!("capture server {} has no address", target.host)))?;
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).with_context(|| format!("bind capture socket {bind}"))?;
        socket.set_nonblocking(true)?;
        Ok(Capture { socket, server })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn record(&self, traffic: Traffic, protocol: u8, local: SocketAddr, peer: SocketAddr, payload: &[u8]) {
        let header = match traffic {
            Traffic::Sent => HepHeader::new(protocol, local, peer),
            Traffic::Received => HepHeader::new(protocol, peer, local),
        };
        if let Err(e) = self.socket.send_to(&header.encode(payload), self.server) {
            log::debug!("capture to {}: {e:?}", self.server);
        }
    }
}

/// Appends a text record of every message to a file.
pub struct TrafficDump {
    file: Mutex<BufWriter<File>>,
}

impl TrafficDump {
    pub fn open(path: &Path) -> Result<TrafficDump> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open dump file {}", path.display()))?;
        Ok(TrafficDump {
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn record(&self, traffic: Traffic, proto: &str, peer: SocketAddr, payload: &[u8]) {
        let line = banner(traffic, proto, peer, payload.len(), chrono::Local::now());
        let mut file = self.file.lock();
        let rs = file
            .write_all(line.as_bytes())
            .and_then(|_| file.write_all(payload))
            .and_then(|_| file.write_all(b"\x0b\n"))
            .and_then(|_| file.flush());
        if let Err(e) = rs {
            log::warn!("dump write: {e:?}");
        }
    }
}

fn banner<Tz: chrono::TimeZone>(
    traffic: Traffic,
    proto: &str,
    peer: SocketAddr,
    len: usize,
    at: chrono::DateTime<Tz>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let (verb, prep) = match traffic {
        Traffic::Sent => ("send", "to"),
        Traffic::Received => ("recv", "from"),
    };
    format!(
        "{verb} {len} bytes {prep} {proto}/[{}]:{} at {}:\n",
        peer.ip(),
        peer.port(),
        at.format("%H:%M:%S%.6f")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn header_layout_v4() {
        let src: SocketAddr = "10.0.0.1:5060".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:5080".parse().unwrap();
        let packet = HepHeader::new(17, src, dst).encode(b"INVITE");
        assert_eq!(packet[0], 0x12);
        assert_eq!(packet[1], 17);
        assert_eq!(&packet[2..4], &[0, 16]);
        assert_eq!(&packet[4..8], &[10, 0, 0, 1]);
        assert_eq!(&packet[8..12], &[10, 0, 0, 2]);
        assert_eq!(&packet[12..14], &5060u16.to_be_bytes());
        assert_eq!(&packet[14..16], &5080u16.to_be_bytes());
        assert_eq!(&packet[16..], b"INVITE");
    }

    #[test]
    fn decode_v6_and_reject_garbage() {
        let src: SocketAddr = "[2001:db8::1]:5061".parse().unwrap();
        let dst: SocketAddr = "[2001:db8::2]:5062".parse().unwrap();
        let packet = HepHeader::new(6, src, dst).encode(b"BYE");
        assert_eq!(packet.len(), 40 + 3);
        let (header, payload) = HepHeader::decode(packet).unwrap();
        assert_eq!((header.src, header.dst, header.protocol), (src, dst, 6));
        assert_eq!(&payload[..], b"BYE");

        assert!(HepHeader::decode(Bytes::from_static(&[0x12, 17, 0])).is_err());
        assert!(HepHeader::decode(Bytes::from_static(&[0x17, 17, 0, 16])).is_err());
    }

    #[test]
    fn capture_target_is_udp_only() {
        let t: CaptureTarget = "udp:127.0.0.1:9060".parse().unwrap();
        assert_eq!((t.host.as_str(), t.port), ("127.0.0.1", 9060));
        let t: CaptureTarget = "udp:[::1]:9060".parse().unwrap();
        assert_eq!(t.host, "::1");
        assert!("tcp:127.0.0.1:9060".parse::<CaptureTarget>().is_err());
        assert!("udp:127.0.0.1".parse::<CaptureTarget>().is_err());
    }

    #[test]
    fn capture_reaches_server() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let target = CaptureTarget {
            host: "127.0.0.1".into(),
            port: server.local_addr().unwrap().port(),
        };
        let capture = Capture::connect(&target).unwrap();
        let local: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:5070".parse().unwrap();
        capture.record(Traffic::Received, 6, local, peer, b"ACK");
        let mut buf = [0u8; 128];
        let (n, _) = server.recv_from(&mut buf).unwrap();
        let (header, payload) = HepHeader::decode(Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!((header.src, header.dst), (peer, local));
        assert_eq!(&payload[..], b"ACK");
    }

    #[test]
    fn dump_banner() {
        let at = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let peer: SocketAddr = "192.0.2.7:5060".parse().unwrap();
        assert_eq!(
            banner(Traffic::Received, "tcp", peer, 12, at),
            "recv 12 bytes from tcp/[192.0.2.7]:5060 at 03:04:05.000000:\n"
        );
    }

    #[test]
    fn dump_appends() {
        let path = std::env::temp_dir().join(format!("tport-dump-{}.txt", std::process::id()));
        let dump = TrafficDump::open(&path).unwrap();
        let peer: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        dump.record(Traffic::Sent, "udp", peer, b"OPTIONS");
        dump.record(Traffic::Received, "udp", peer, b"SIP/2.0 200 OK");
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(text.starts_with("send 7 bytes to udp/[127.0.0.1]:5060 at "));
        assert!(text.contains("OPTIONS\x0b\n"));
        assert!(text.contains("recv 14 bytes from udp/"));
    }
}
