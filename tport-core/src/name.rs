//! Transport names and kinds.
//!
//! A [`TransportName`] identifies a local binding or a remote peer by
//! protocol, host and port, optionally narrowed by an ident. It parses from
//! either `proto:host:port` or `proto/host:port`; IPv6 hosts are bracketed.
//!
//! ```rust
//! use rust_tport_core::name::TransportName;
//!
//! let name: TransportName = "tls:[::1]:5061".parse().unwrap();
//! assert_eq!(name.proto(), "tls");
//! assert_eq!(name.to_string(), "tls/[::1]:5061");
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// The transport kinds a primary can be bound as.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TransportKind {
    Udp,
    /// UDP with inbound STUN datagrams routed to a STUN engine.
    StunUdp,
    Tcp,
    /// TCP tunneled through an HTTP proxy with `CONNECT`.
    Connect,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl TransportKind {
    /// Protocol token as it appears in transport names.
    pub fn proto(&self) -> &'static str {
        match self {
            TransportKind::Udp | TransportKind::StunUdp => "udp",
            TransportKind::Tcp | TransportKind::Connect => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Sctp => "sctp",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }
    pub fn is_connection_oriented(&self) -> bool {
        !matches!(self, TransportKind::Udp | TransportKind::StunUdp)
    }
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }
    /// IANA protocol number of the carrier, used in capture headers.
    pub fn ip_protocol(&self) -> u8 {
        match self {
            TransportKind::Udp | TransportKind::StunUdp => 17,
            TransportKind::Sctp => 132,
            _ => 6,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::StunUdp => "stun-udp",
            TransportKind::Connect => "http-connect",
            other => other.proto(),
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Direction {
    /// Accepted from a listening primary.
    Incoming,
    /// Connected by this side.
    Outgoing,
}

/// Protocol, host and port of a transport endpoint.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct TransportName {
    proto: String,
    host: String,
    port: u16,
    ident: Option<String>,
}

/// Case-normalized ordering key used by the reuse index.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NameKey {
    proto: String,
    host: String,
    port: u16,
}

impl TransportName {
    pub fn new(proto: &str, host: &str, port: u16) -> Self {
        Self {
            proto: proto.to_ascii_lowercase(),
            host: host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            port,
            ident: None,
        }
    }
    pub fn from_addr(proto: &str, addr: SocketAddr) -> Self {
        Self::new(proto, &addr.ip().to_string(), addr.port())
    }
    pub fn with_ident(mut self, ident: impl Into<String>) -> Self {
        self.ident = Some(ident.into());
        self
    }
    pub fn proto(&self) -> &str {
        &self.proto
    }
    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn ident(&self) -> Option<&str> {
        self.ident.as_deref()
    }
    /// The address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
    /// `host:port` suitable for resolution, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
    pub fn key(&self) -> NameKey {
        NameKey {
            proto: self.proto.clone(),
            host: self.host.to_ascii_lowercase(),
            port: self.port,
        }
    }
}

impl fmt::Display for TransportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proto, self.authority())?;
        if let Some(ident) = &self.ident {
            write!(f, ";ident={ident}")?;
        }
        Ok(())
    }
}

impl FromStr for TransportName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidName(s.to_string());
        let split = s.find(['/', ':']).ok_or_else(invalid)?;
        let (proto, rest) = (&s[..split], &s[split + 1..]);
        if proto.is_empty() || !proto.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid());
        }
        let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(invalid)?;
            let port = rest[end + 1..].strip_prefix(':').ok_or_else(invalid)?;
            (&rest[..end], port)
        } else {
            rest.rsplit_once(':').ok_or_else(invalid)?
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(TransportName::new(proto, host, port))
    }
}
