//! The transport capability table.
//!
//! Every transport kind implements [`Transport`]. A primary holds one
//! `Arc<dyn Transport>` chosen at bind time and every secondary it spawns
//! goes through the same object, so the lifecycle manager never branches on
//! the transport kind. Established connections are a pair of boxed halves,
//! [`RecvHalf`] and [`SendHalf`], owned by the secondary's reader and writer
//! tasks.

use std::io::IoSlice;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::name::{Direction, TransportKind, TransportName};
use rust_tport_core::stun::StunOutcome;
use rust_tport_core::tls::{PeerIdentity, TlsState};
use rust_tport_core::udp::{DatagramKind, DeliveryTicket};

use crate::config::{BindConfig, TportConfig};
use crate::tree::timer::{SecondaryTimers, TimerAction};

pub mod connect;
#[cfg(unix)]
pub mod sctp;
pub mod stun;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

pub use udp::DatagramIo;

const READ_RESERVE: usize = 4096;
/// Payloads up to this size are copied into one buffer before a TLS write.
const COALESCE_LIMIT: usize = 16 * 1024;
pub(crate) const PING: &[u8] = b"\r\n\r\n";
pub(crate) const PONG: &[u8] = b"\r\n";

/// Everything a transport needs to know about the primary it serves.
pub struct PrimarySetup {
    pub name: TransportName,
    /// Resolved address to bind.
    pub addr: SocketAddr,
    pub kind: TransportKind,
    pub config: Arc<BindConfig>,
    pub tport: Arc<TportConfig>,
}

/// The socket state of a primary.
pub enum PrimaryIo {
    Listener(tokio::net::TcpListener),
    Datagram(DatagramIo),
    #[cfg(unix)]
    Sctp(sctp::SctpListener),
    /// Client-only primaries (e.g. a `CONNECT` tunnel) own no socket.
    Outbound { local: SocketAddr },
}

impl PrimaryIo {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            PrimaryIo::Listener(listener) => Ok(listener.local_addr()?),
            PrimaryIo::Datagram(io) => Ok(io.local_addr()),
            #[cfg(unix)]
            PrimaryIo::Sctp(listener) => listener.local_addr(),
            PrimaryIo::Outbound { local } => Ok(*local),
        }
    }
    pub fn datagram(&self) -> Result<&DatagramIo> {
        match self {
            PrimaryIo::Datagram(io) => Ok(io),
            _ => Err(Error::NotSupported("datagram operation on a stream primary")),
        }
    }
}

/// A connected byte stream before any per-kind handshake.
pub enum RawStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Sctp(sctp::SctpStream),
}

impl RawStream {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            RawStream::Tcp(stream) => stream.local_addr().ok(),
            #[cfg(unix)]
            RawStream::Sctp(stream) => stream.local_addr().ok(),
        }
    }
    pub(crate) fn into_tcp(self) -> Result<TcpStream> {
        match self {
            RawStream::Tcp(stream) => Ok(stream),
            #[cfg(unix)]
            RawStream::Sctp(_) => Err(Error::NotSupported("sctp stream where tcp is required")),
        }
    }
}

/// What a primary's readiness produced.
pub enum Wakeup {
    Accepted {
        stream: RawStream,
        peer: SocketAddr,
    },
    Datagram {
        kind: DatagramKind,
        payload: Bytes,
        from: SocketAddr,
        /// Held until the upper layer has taken the message.
        ticket: Option<DeliveryTicket>,
    },
    Stun(StunOutcome),
    /// Readiness consumed without anything to deliver.
    Idle,
}

/// Result of the pre-send hook on datagram primaries.
pub enum Prepared {
    /// Send this payload now.
    Send(Bytes),
    /// Handed to a worker; nothing left to do.
    Queued,
}

/// What one read on a connection yielded.
#[derive(Debug, Eq, PartialEq)]
pub enum Received {
    Eof,
    /// Bytes appended to the receive buffer, to be framed.
    Data(usize),
    /// A whole message from a message-preserving transport.
    Message(Bytes),
    Ping,
    Pong,
}

#[async_trait]
pub trait RecvHalf: Send {
    async fn recv(&mut self, buf: &mut BytesMut) -> Result<Received>;
}

#[async_trait]
pub trait SendHalf: Send {
    /// Writes the messages in order; returns once all bytes are accepted.
    async fn send(&mut self, msgs: &[Bytes]) -> Result<()>;
    async fn ping(&mut self) -> Result<()>;
    async fn pong(&mut self) -> Result<()>;
    async fn shutdown(&mut self, how: Shutdown) -> Result<()>;
}

pub struct Connection {
    pub recv: Box<dyn RecvHalf>,
    pub send: Box<dyn SendHalf>,
    pub identity: PeerIdentity,
    pub local: Option<SocketAddr>,
    /// Nothing but the tunnel setup may be sent until this clears.
    pub tunnel_pending: bool,
}

/// Per-secondary state visible to the delivery hook.
pub struct SecondaryCtx {
    pub peer: SocketAddr,
    pub direction: Direction,
    pub tunnel_pending: bool,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    async fn init_primary(&self, setup: &PrimarySetup) -> Result<PrimaryIo>;

    /// Called once the primary is registered and its io shared.
    fn start_primary(&self, _io: &Arc<PrimaryIo>) -> Result<()> {
        Ok(())
    }

    fn deinit_primary(&self, _io: &PrimaryIo) {}

    /// Waits for readiness on the primary and handles it.
    async fn wakeup_primary(&self, io: &PrimaryIo) -> Result<Wakeup>;

    /// Whether peer names are resolved locally. A transport that hands the
    /// name to an intermediary returns `false`.
    fn resolves_peer(&self) -> bool {
        true
    }

    /// Opens the raw stream towards `peer`.
    async fn connect(&self, _setup: &PrimarySetup, _peer: SocketAddr) -> Result<RawStream> {
        Err(Error::NotSupported("connect on a connectionless transport"))
    }

    /// Runs the per-kind handshake on a raw stream and splits it.
    async fn init_secondary(
        &self,
        _setup: &PrimarySetup,
        _stream: RawStream,
        _direction: Direction,
        _peer_name: &TransportName,
        _on_state: &mut (dyn FnMut(TlsState) + Send),
    ) -> Result<Connection> {
        Err(Error::NotSupported("secondary on a connectionless transport"))
    }

    fn deinit_secondary(&self, _peer: SocketAddr) {}

    /// Hands a received message up, or swallows it. Returns the message to
    /// deliver.
    async fn deliver(&self, _ctx: &mut SecondaryCtx, msg: Bytes) -> Result<Option<Bytes>> {
        Ok(Some(msg))
    }

    fn prepare(&self, _io: &PrimaryIo, msg: Bytes, _to: SocketAddr) -> Result<Prepared> {
        Ok(Prepared::Send(msg))
    }

    async fn send_datagram(&self, _io: &PrimaryIo, _msg: Bytes, _to: SocketAddr) -> Result<()> {
        Err(Error::NotSupported("datagram send on a stream transport"))
    }

    /// Keepalive towards `peer` on a datagram primary.
    fn keepalive(&self, _io: &Arc<PrimaryIo>, _peer: SocketAddr) -> Result<()> {
        Ok(())
    }

    /// Offers a STUN datagram to the STUN engine. Returns whether it was
    /// consumed.
    fn stun_response(&self, _io: &PrimaryIo, _datagram: &[u8], _from: SocketAddr) -> bool {
        false
    }

    fn next_secondary_timer(&self, timers: &SecondaryTimers) -> Option<Instant> {
        timers.next_deadline()
    }

    fn secondary_timer(&self, timers: &SecondaryTimers, now: Instant) -> Option<TimerAction> {
        timers.expired(now)
    }
}

/// Builds the capability table for a primary of `kind`.
pub fn transport_for(kind: TransportKind, config: &BindConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match kind {
        TransportKind::Udp => Arc::new(udp::UdpTransport),
        TransportKind::StunUdp => Arc::new(stun::StunUdpTransport::new(config)?),
        TransportKind::Tcp => Arc::new(tcp::TcpTransport),
        TransportKind::Connect => Arc::new(connect::ConnectTransport::new(config)?),
        TransportKind::Tls => Arc::new(tls::TlsTransport::new(config)?),
        #[cfg(unix)]
        TransportKind::Sctp => Arc::new(sctp::SctpTransport),
        #[cfg(not(unix))]
        TransportKind::Sctp => return Err(Error::NotSupported("sctp on this platform")),
        TransportKind::Ws => Arc::new(ws::WsTransport::new(config, None)?),
        TransportKind::Wss => {
            let engine = tls::engine_for(config)?;
            Arc::new(ws::WsTransport::new(config, Some(engine))?)
        }
    };
    Ok(transport)
}

/// Receive half over any byte stream.
pub struct StreamRecv<R> {
    read: R,
}

impl<R> StreamRecv<R> {
    pub fn new(read: R) -> Self {
        Self { read }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RecvHalf for StreamRecv<R> {
    async fn recv(&mut self, buf: &mut BytesMut) -> Result<Received> {
        buf.reserve(READ_RESERVE);
        match self.read.read_buf(buf).await? {
            0 => Ok(Received::Eof),
            n => Ok(Received::Data(n)),
        }
    }
}

/// Send half over any byte stream.
pub struct StreamSend<W> {
    write: W,
    coalesce: bool,
}

impl<W> StreamSend<W> {
    pub fn new(write: W) -> Self {
        Self {
            write,
            coalesce: false,
        }
    }
    /// Copies small batches into one buffer so they leave in one write.
    pub fn coalescing(write: W) -> Self {
        Self {
            write,
            coalesce: true,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> SendHalf for StreamSend<W> {
    async fn send(&mut self, msgs: &[Bytes]) -> Result<()> {
        let total: usize = msgs.iter().map(Bytes::len).sum();
        if self.coalesce && msgs.len() > 1 && total <= COALESCE_LIMIT {
            let mut joined = BytesMut::with_capacity(total);
            for msg in msgs {
                joined.extend_from_slice(msg);
            }
            self.write.write_all(&joined).await?;
        } else {
            write_all_vectored(&mut self.write, msgs).await?;
        }
        self.write.flush().await?;
        Ok(())
    }
    async fn ping(&mut self) -> Result<()> {
        self.write.write_all(PING).await?;
        self.write.flush().await?;
        Ok(())
    }
    async fn pong(&mut self) -> Result<()> {
        self.write.write_all(PONG).await?;
        self.write.flush().await?;
        Ok(())
    }
    async fn shutdown(&mut self, how: Shutdown) -> Result<()> {
        match how {
            Shutdown::Read => Ok(()),
            Shutdown::Write | Shutdown::Both => Ok(self.write.shutdown().await?),
        }
    }
}

/// Scatter-gather write of every buffer; a partial write resumes where it
/// stopped.
pub async fn write_all_vectored<W: AsyncWrite + Unpin + ?Sized>(write: &mut W, bufs: &[Bytes]) -> std::io::Result<()> {
    let mut index = 0;
    let mut offset = 0;
    while index < bufs.len() {
        let slices: Vec<IoSlice<'_>> = std::iter::once(&bufs[index][offset..])
            .chain(bufs[index + 1..].iter().map(|b| &b[..]))
            .filter(|b| !b.is_empty())
            .map(IoSlice::new)
            .collect();
        if slices.is_empty() {
            break;
        }
        let mut written = write.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        while written > 0 && index < bufs.len() {
            let left = bufs[index].len() - offset;
            if written >= left {
                written -= left;
                index += 1;
                offset = 0;
            } else {
                offset += written;
                written = 0;
            }
        }
        while index < bufs.len() && bufs[index].len() == offset {
            index += 1;
            offset = 0;
        }
    }
    Ok(())
}
