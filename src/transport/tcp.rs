use std::net::SocketAddr;

use async_trait::async_trait;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::name::{Direction, TransportKind, TransportName};
use rust_tport_core::socket::{connect_tcp, create_tcp_listener};
use rust_tport_core::tls::{PeerIdentity, TlsState};

use crate::transport::{
    Connection, PrimaryIo, PrimarySetup, RawStream, StreamRecv, StreamSend, Transport, Wakeup,
};

pub(crate) fn listen(setup: &PrimarySetup) -> Result<PrimaryIo> {
    let listener = create_tcp_listener(setup.addr, setup.config.backlog, setup.config.tos)?;
    Ok(PrimaryIo::Listener(tokio::net::TcpListener::from_std(listener)?))
}

pub(crate) async fn accept(io: &PrimaryIo) -> Result<Wakeup> {
    let PrimaryIo::Listener(listener) = io else {
        return Err(Error::NotSupported("accept without a listener"));
    };
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok(Wakeup::Accepted {
        stream: RawStream::Tcp(stream),
        peer,
    })
}

pub(crate) async fn dial(setup: &PrimarySetup, peer: SocketAddr) -> Result<RawStream> {
    Ok(RawStream::Tcp(connect_tcp(peer, setup.config.tos).await?))
}

pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn init_primary(&self, setup: &PrimarySetup) -> Result<PrimaryIo> {
        listen(setup)
    }

    async fn wakeup_primary(&self, io: &PrimaryIo) -> Result<Wakeup> {
        accept(io).await
    }

    async fn connect(&self, setup: &PrimarySetup, peer: SocketAddr) -> Result<RawStream> {
        dial(setup, peer).await
    }

    async fn init_secondary(
        &self,
        _setup: &PrimarySetup,
        stream: RawStream,
        _direction: Direction,
        _peer_name: &TransportName,
        _on_state: &mut (dyn FnMut(TlsState) + Send),
    ) -> Result<Connection> {
        let stream = stream.into_tcp()?;
        let local = stream.local_addr().ok();
        let (read, write) = stream.into_split();
        Ok(Connection {
            recv: Box::new(StreamRecv::new(read)),
            send: Box::new(StreamSend::new(write)),
            identity: PeerIdentity::default(),
            local,
            tunnel_pending: false,
        })
    }
}
