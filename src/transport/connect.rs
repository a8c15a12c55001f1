//! TCP through an HTTP proxy. The secondary opens the tunnel with
//! `CONNECT`, and the proxy's answer is intercepted by [`Transport::deliver`]
//! before anything reaches the upper layer. Queued messages leave only once
//! the proxy has answered 2xx.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::name::{Direction, TransportKind, TransportName};
use rust_tport_core::socket::connect_tcp;
use rust_tport_core::tls::{PeerIdentity, TlsState};

use crate::config::BindConfig;
use crate::transport::{
    Connection, PrimaryIo, PrimarySetup, RawStream, SecondaryCtx, StreamRecv, StreamSend,
    Transport, Wakeup,
};

pub struct ConnectTransport {
    proxy: String,
}

impl ConnectTransport {
    pub fn new(config: &BindConfig) -> Result<Self> {
        Ok(Self {
            proxy: config.proxy_authority()?,
        })
    }
}

pub(crate) fn connect_request(target: &str) -> String {
    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n")
}

/// Status code of an HTTP response head.
pub(crate) fn response_status(head: &[u8]) -> Result<u16> {
    let line = head
        .split(|b| *b == b'\n')
        .next()
        .and_then(|line| std::str::from_utf8(line).ok())
        .unwrap_or_default();
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next().map(str::parse::<u16>)) {
        (Some(version), Some(Ok(code))) if version.starts_with("HTTP/") => Ok(code),
        _ => Err(Error::Protocol(format!("malformed proxy response {:?}", line.trim_end()))),
    }
}

#[async_trait]
impl Transport for ConnectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Connect
    }

    async fn init_primary(&self, setup: &PrimarySetup) -> Result<PrimaryIo> {
        Ok(PrimaryIo::Outbound { local: setup.addr })
    }

    async fn wakeup_primary(&self, _io: &PrimaryIo) -> Result<Wakeup> {
        Err(Error::NotSupported("accept on a proxy tunnel"))
    }

    fn resolves_peer(&self) -> bool {
        false
    }

    async fn connect(&self, setup: &PrimarySetup, _peer: SocketAddr) -> Result<RawStream> {
        let proxy = tokio::net::lookup_host(self.proxy.as_str())
            .await?
            .next()
            .ok_or_else(|| Error::Config(format!("proxy {} has no address", self.proxy)))?;
        Ok(RawStream::Tcp(connect_tcp(proxy, setup.config.tos).await?))
    }

    async fn init_secondary(
        &self,
        _setup: &PrimarySetup,
        stream: RawStream,
        direction: Direction,
        peer_name: &TransportName,
        _on_state: &mut (dyn FnMut(TlsState) + Send),
    ) -> Result<Connection> {
        if direction == Direction::Incoming {
            return Err(Error::NotSupported("incoming connection on a proxy tunnel"));
        }
        let mut stream = stream.into_tcp()?;
        let local = stream.local_addr().ok();
        stream
            .write_all(connect_request(&peer_name.authority()).as_bytes())
            .await?;
        log::debug!("CONNECT {} via {}", peer_name.authority(), self.proxy);
        let (read, write) = stream.into_split();
        Ok(Connection {
            recv: Box::new(StreamRecv::new(read)),
            send: Box::new(StreamSend::new(write)),
            identity: PeerIdentity::default(),
            local,
            tunnel_pending: true,
        })
    }

    async fn deliver(&self, ctx: &mut SecondaryCtx, msg: Bytes) -> Result<Option<Bytes>> {
        if !ctx.tunnel_pending {
            return Ok(Some(msg));
        }
        match response_status(&msg)? {
            200..=299 => {
                log::debug!("tunnel to {} open", ctx.peer);
                ctx.tunnel_pending = false;
                Ok(None)
            }
            code => Err(Error::Protocol(format!("proxy answered {code}"))),
        }
    }
}
