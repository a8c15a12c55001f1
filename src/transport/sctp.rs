//! One-to-one SCTP on a single stream. Each receive yields one message.

use std::io::Write;
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::{MaybeUninitSlice, RecvFlags, Socket};
use tokio::io::unix::AsyncFd;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::name::{Direction, TransportKind, TransportName};
use rust_tport_core::socket::{create_sctp_listener, is_sctp_unsupported, start_sctp_connect};
use rust_tport_core::tls::{PeerIdentity, TlsState};

use crate::transport::{
    Connection, PrimaryIo, PrimarySetup, RawStream, Received, RecvHalf, SendHalf, Transport,
    Wakeup, PING, PONG,
};

fn socket_addr(addr: socket2::SockAddr) -> Result<SocketAddr> {
    addr.as_socket()
        .ok_or(Error::NotSupported("non-inet sctp address"))
}

pub struct SctpListener {
    fd: AsyncFd<Socket>,
}

impl SctpListener {
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<SctpListener> {
        let socket = create_sctp_listener(addr, backlog).map_err(|e| {
            match e.root_cause().downcast_ref::<std::io::Error>() {
                Some(io) if is_sctp_unsupported(io) => Error::NotSupported("sctp in this kernel"),
                _ => Error::Setup(e),
            }
        })?;
        Ok(SctpListener {
            fd: AsyncFd::new(socket)?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        socket_addr(self.fd.get_ref().local_addr()?)
    }

    pub async fn accept(&self) -> Result<(SctpStream, SocketAddr)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|fd| fd.get_ref().accept()) {
                Ok(Ok((socket, peer))) => {
                    socket.set_nonblocking(true)?;
                    return Ok((SctpStream::new(socket)?, socket_addr(peer)?));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

pub struct SctpStream {
    fd: Arc<AsyncFd<Socket>>,
}

impl SctpStream {
    fn new(socket: Socket) -> Result<Self> {
        Ok(Self {
            fd: Arc::new(AsyncFd::new(socket)?),
        })
    }

    pub async fn connect(addr: SocketAddr) -> Result<SctpStream> {
        let socket = start_sctp_connect(addr).map_err(|source| {
            if is_sctp_unsupported(&source) {
                Error::NotSupported("sctp in this kernel")
            } else {
                Error::Connect { addr, source }
            }
        })?;
        let stream = SctpStream::new(socket)?;
        drop(stream.fd.writable().await?);
        if let Some(source) = stream.fd.get_ref().take_error()? {
            return Err(Error::Connect { addr, source });
        }
        Ok(stream)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        socket_addr(self.fd.get_ref().local_addr()?)
    }
}

/// Reads at most one message. Without `MSG_EOR` in the returned flags the
/// message did not fit `buf`.
fn recv_record(socket: &Socket, buf: &mut [u8]) -> std::io::Result<(usize, RecvFlags)> {
    // SAFETY: the buffer is initialized and recvmsg only writes bytes into it
    let buf = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv_vectored_with_flags(&mut [MaybeUninitSlice::new(buf)], 0)
}

pub struct SctpRecv {
    fd: Arc<AsyncFd<Socket>>,
    scratch: Vec<u8>,
}

#[async_trait]
impl RecvHalf for SctpRecv {
    async fn recv(&mut self, _buf: &mut BytesMut) -> Result<Received> {
        loop {
            let mut guard = self.fd.readable().await?;
            let scratch = &mut self.scratch;
            match guard.try_io(|fd| recv_record(fd.get_ref(), scratch)) {
                Ok(Ok((0, _))) => return Ok(Received::Eof),
                Ok(Ok((n, flags))) => {
                    if flags.is_truncated() || !flags.is_end_of_record() {
                        return Err(Error::Protocol(format!(
                            "sctp message exceeds {} bytes",
                            scratch.len()
                        )));
                    }
                    return Ok(match &scratch[..n] {
                        PING => Received::Ping,
                        PONG => Received::Pong,
                        msg => Received::Message(Bytes::copy_from_slice(msg)),
                    })
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

pub struct SctpSend {
    fd: Arc<AsyncFd<Socket>>,
}

impl SctpSend {
    async fn send_one(&self, msg: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < msg.len() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| (&*fd.get_ref()).write(&msg[written..])) {
                Ok(Ok(0)) => return Err(Error::Io(std::io::ErrorKind::WriteZero.into())),
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SendHalf for SctpSend {
    async fn send(&mut self, msgs: &[Bytes]) -> Result<()> {
        for msg in msgs {
            self.send_one(msg).await?;
        }
        Ok(())
    }
    async fn ping(&mut self) -> Result<()> {
        self.send_one(PING).await
    }
    async fn pong(&mut self) -> Result<()> {
        self.send_one(PONG).await
    }
    async fn shutdown(&mut self, how: Shutdown) -> Result<()> {
        match self.fd.get_ref().shutdown(how) {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            rs => Ok(rs?),
        }
    }
}

pub struct SctpTransport;

#[async_trait]
impl Transport for SctpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sctp
    }

    async fn init_primary(&self, setup: &PrimarySetup) -> Result<PrimaryIo> {
        Ok(PrimaryIo::Sctp(SctpListener::bind(setup.addr, setup.config.backlog)?))
    }

    async fn wakeup_primary(&self, io: &PrimaryIo) -> Result<Wakeup> {
        let PrimaryIo::Sctp(listener) = io else {
            return Err(Error::NotSupported("accept without an sctp listener"));
        };
        let (stream, peer) = listener.accept().await?;
        Ok(Wakeup::Accepted {
            stream: RawStream::Sctp(stream),
            peer,
        })
    }

    async fn connect(&self, _setup: &PrimarySetup, peer: SocketAddr) -> Result<RawStream> {
        Ok(RawStream::Sctp(SctpStream::connect(peer).await?))
    }

    async fn init_secondary(
        &self,
        setup: &PrimarySetup,
        stream: RawStream,
        _direction: Direction,
        _peer_name: &TransportName,
        _on_state: &mut (dyn FnMut(TlsState) + Send),
    ) -> Result<Connection> {
        let RawStream::Sctp(stream) = stream else {
            return Err(Error::NotSupported("tcp stream on an sctp primary"));
        };
        let local = stream.local_addr().ok();
        Ok(Connection {
            recv: Box::new(SctpRecv {
                fd: stream.fd.clone(),
                scratch: vec![0; setup.config.sctp_max_message],
            }),
            send: Box::new(SctpSend { fd: stream.fd }),
            identity: PeerIdentity::default(),
            local,
            tunnel_pending: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindConfig, TportConfig};
    use rust_tport_core::error::ErrorCode;

    /// A connected client and server, or `None` without kernel sctp.
    async fn pair(config: BindConfig) -> Option<(Connection, Connection)> {
        let setup = PrimarySetup {
            name: "sctp:127.0.0.1:0".parse().unwrap(),
            addr: "127.0.0.1:0".parse().unwrap(),
            kind: TransportKind::Sctp,
            config: Arc::new(config),
            tport: Arc::new(TportConfig::default()),
        };
        let transport = SctpTransport;
        let io = match transport.init_primary(&setup).await {
            Ok(io) => io,
            Err(e) if e.code() == ErrorCode::NotSupported => {
                log::warn!("skipping, no sctp: {e}");
                return None;
            }
            Err(e) => panic!("{e}"),
        };
        let addr = io.local_addr().unwrap();
        let name = TransportName::from_addr("sctp", addr);
        let mut noop = |_s: TlsState| {};
        let (client, accepted) = tokio::join!(transport.connect(&setup, addr), transport.wakeup_primary(&io));
        let Ok(Wakeup::Accepted { stream, .. }) = accepted else {
            panic!("accept failed");
        };
        let server = transport
            .init_secondary(&setup, stream, Direction::Incoming, &name, &mut noop)
            .await
            .unwrap();
        let client = transport
            .init_secondary(&setup, client.unwrap(), Direction::Outgoing, &name, &mut noop)
            .await
            .unwrap();
        Some((client, server))
    }

    #[tokio::test]
    async fn message_boundaries_survive() {
        let Some((mut client, mut server)) = pair(BindConfig::default()).await else {
            return;
        };
        client
            .send
            .send(&[Bytes::from_static(b"INVITE"), Bytes::from_static(b"BYE")])
            .await
            .unwrap();
        client.send.ping().await.unwrap();
        let mut buf = BytesMut::new();
        assert_eq!(
            server.recv.recv(&mut buf).await.unwrap(),
            Received::Message(Bytes::from_static(b"INVITE"))
        );
        assert_eq!(
            server.recv.recv(&mut buf).await.unwrap(),
            Received::Message(Bytes::from_static(b"BYE"))
        );
        assert_eq!(server.recv.recv(&mut buf).await.unwrap(), Received::Ping);
    }

    #[tokio::test]
    async fn oversized_message_is_not_split() {
        let config = BindConfig::default().set_sctp_max_message(32);
        let Some((mut client, mut server)) = pair(config).await else {
            return;
        };
        let fits = Bytes::from(vec![b'a'; 32]);
        client.send.send(&[fits.clone(), Bytes::from(vec![b'b'; 100])]).await.unwrap();
        let mut buf = BytesMut::new();
        assert_eq!(server.recv.recv(&mut buf).await.unwrap(), Received::Message(fits));
        let e = server.recv.recv(&mut buf).await.unwrap_err();
        assert_eq!(e.code(), ErrorCode::Protocol);
    }
}
