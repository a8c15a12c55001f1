use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::name::{Direction, TransportKind, TransportName};
use rust_tport_core::tls::{TlsEngine, TlsState};

use crate::config::BindConfig;
use crate::transport::{
    tcp, Connection, PrimaryIo, PrimarySetup, RawStream, StreamRecv, StreamSend, Transport, Wakeup,
};

pub(crate) fn engine_for(config: &BindConfig) -> Result<Arc<TlsEngine>> {
    let tls = config
        .tls
        .as_ref()
        .ok_or_else(|| Error::Config("tls primary needs a tls config".into()))?;
    Ok(Arc::new(TlsEngine::new(tls)?))
}

/// Listens when the engine holds a certificate, otherwise connects only.
pub(crate) fn listen_or_outbound(engine: &TlsEngine, setup: &PrimarySetup) -> Result<PrimaryIo> {
    if engine.can_accept() {
        return tcp::listen(setup);
    }
    log::debug!("{} has no certificate, outbound only", setup.name);
    Ok(PrimaryIo::Outbound { local: setup.addr })
}

/// Runs the handshake for `direction` and splits the encrypted stream.
pub(crate) async fn handshake(
    engine: &TlsEngine,
    stream: RawStream,
    direction: Direction,
    peer_name: &TransportName,
    on_state: &mut (dyn FnMut(TlsState) + Send),
) -> Result<Connection> {
    let stream = stream.into_tcp()?;
    let local = stream.local_addr().ok();
    let connection = match direction {
        Direction::Incoming => {
            let (stream, identity) = engine.accept(stream, on_state).await?;
            let (read, write) = tokio::io::split(stream);
            Connection {
                recv: Box::new(StreamRecv::new(read)),
                send: Box::new(StreamSend::coalescing(write)),
                identity,
                local,
                tunnel_pending: false,
            }
        }
        Direction::Outgoing => {
            let (stream, identity) = engine.connect(stream, peer_name.host(), on_state).await?;
            let (read, write) = tokio::io::split(stream);
            Connection {
                recv: Box::new(StreamRecv::new(read)),
                send: Box::new(StreamSend::coalescing(write)),
                identity,
                local,
                tunnel_pending: false,
            }
        }
    };
    Ok(connection)
}

pub struct TlsTransport {
    engine: Arc<TlsEngine>,
}

impl TlsTransport {
    pub fn new(config: &BindConfig) -> Result<Self> {
        Ok(Self {
            engine: engine_for(config)?,
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    async fn init_primary(&self, setup: &PrimarySetup) -> Result<PrimaryIo> {
        listen_or_outbound(&self.engine, setup)
    }

    async fn wakeup_primary(&self, io: &PrimaryIo) -> Result<Wakeup> {
        tcp::accept(io).await
    }

    async fn connect(&self, setup: &PrimarySetup, peer: SocketAddr) -> Result<RawStream> {
        tcp::dial(setup, peer).await
    }

    async fn init_secondary(
        &self,
        _setup: &PrimarySetup,
        stream: RawStream,
        direction: Direction,
        peer_name: &TransportName,
        on_state: &mut (dyn FnMut(TlsState) + Send),
    ) -> Result<Connection> {
        handshake(&self.engine, stream, direction, peer_name, on_state).await
    }
}
