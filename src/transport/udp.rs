use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::name::TransportKind;
use rust_tport_core::socket::bind_udp;
use rust_tport_core::stun::DatagramSink;
use rust_tport_core::udp::{
    admit, DatagramClassifier, PacketDropper, PoolDelivery, ThreadPool,
};
use rust_tport_core::udp::pool::{join_workers, MAX_DATAGRAM};

use crate::transport::{Prepared, PrimaryIo, PrimarySetup, Transport, Wakeup};

enum DatagramSocket {
    Direct {
        socket: tokio::net::UdpSocket,
        /// Receive buffer; each datagram is copied out at its own size.
        scratch: async_lock::Mutex<Vec<u8>>,
    },
    Pooled {
        pool: ThreadPool,
        deliveries: async_lock::Mutex<mpsc::UnboundedReceiver<PoolDelivery>>,
    },
}

/// A bound UDP socket, either polled by the event loop or served by a
/// worker pool.
pub struct DatagramIo {
    socket: DatagramSocket,
    dropper: Arc<PacketDropper>,
    classifier: Arc<dyn DatagramClassifier>,
    local: SocketAddr,
}

impl DatagramIo {
    pub fn open(setup: &PrimarySetup) -> Result<DatagramIo> {
        let config = &setup.config;
        let dropper = Arc::new(PacketDropper::new(config.drop_probability)?);
        let classifier = config.classifier.clone();
        let socket = bind_udp(setup.addr, config.tos, config.pool.is_none())?;
        let socket: std::net::UdpSocket = socket.into();
        let local = socket.local_addr()?;
        let socket = match &config.pool {
            Some(pool_config) => {
                let (pool, deliveries) =
                    ThreadPool::spawn(socket, pool_config.clone(), classifier.clone(), dropper.clone())?;
                DatagramSocket::Pooled {
                    pool,
                    deliveries: async_lock::Mutex::new(deliveries),
                }
            }
            None => DatagramSocket::Direct {
                socket: tokio::net::UdpSocket::from_std(socket)?,
                scratch: async_lock::Mutex::new(vec![0; MAX_DATAGRAM]),
            },
        };
        Ok(DatagramIo {
            socket,
            dropper,
            classifier,
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn pool(&self) -> Option<&ThreadPool> {
        match &self.socket {
            DatagramSocket::Pooled { pool, .. } => Some(pool),
            DatagramSocket::Direct { .. } => None,
        }
    }

    pub async fn recv(&self) -> Result<Wakeup> {
        match &self.socket {
            DatagramSocket::Direct { socket, scratch } => {
                let mut scratch = scratch.lock().await;
                let (len, from) = match socket.recv_from(&mut scratch[..]).await {
                    Ok(received) => received,
                    Err(e) if should_ignore(&e) => return Ok(Wakeup::Idle),
                    Err(e) => return Err(e.into()),
                };
                let payload = Bytes::copy_from_slice(&scratch[..len]);
                drop(scratch);
                let kind = self.classifier.classify(&payload[..len.min(2)]);
                Ok(match admit(self.classifier.as_ref(), kind, payload) {
                    Some((kind, payload)) => Wakeup::Datagram {
                        kind,
                        payload,
                        from,
                        ticket: None,
                    },
                    None => Wakeup::Idle,
                })
            }
            DatagramSocket::Pooled { deliveries, .. } => {
                let delivery = deliveries.lock().await.recv().await.ok_or(Error::Closed)?;
                Ok(Wakeup::Datagram {
                    kind: delivery.kind,
                    payload: delivery.payload,
                    from: delivery.from,
                    ticket: Some(delivery.ticket),
                })
            }
        }
    }

    pub async fn send_to(&self, msg: Bytes, to: SocketAddr) -> Result<()> {
        match &self.socket {
            DatagramSocket::Direct { socket, .. } => {
                if self.dropper.should_drop() {
                    log::debug!("dropping {} bytes to {to}", msg.len());
                    return Ok(());
                }
                socket.send_to(&msg, to).await?;
                Ok(())
            }
            DatagramSocket::Pooled { pool, .. } => pool.send(msg, to).map(|_| ()),
        }
    }

    fn try_send_to(&self, msg: Bytes, to: SocketAddr) -> Result<()> {
        match &self.socket {
            DatagramSocket::Direct { socket, .. } => {
                socket.try_send_to(&msg, to)?;
                Ok(())
            }
            DatagramSocket::Pooled { pool, .. } => pool.send(msg, to).map(|_| ()),
        }
    }

    /// Stops a worker pool. The threads are joined off the event loop.
    pub(crate) fn shutdown(&self) {
        let DatagramSocket::Pooled { pool, .. } = &self.socket else {
            return;
        };
        let workers = pool.stop();
        if workers.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || join_workers(workers));
            }
            Err(_) => join_workers(workers),
        }
    }
}

/// STUN requests leave through the primary's own socket.
pub(crate) struct IoSink(pub(crate) Weak<PrimaryIo>);

impl DatagramSink for IoSink {
    fn send_to(&self, payload: Bytes, to: SocketAddr) -> Result<()> {
        let io = self.0.upgrade().ok_or(Error::Closed)?;
        io.datagram()?.try_send_to(payload, to)
    }
}

fn should_ignore(e: &std::io::Error) -> bool {
    #[cfg(windows)]
    if matches!(e.raw_os_error(), Some(10040) | Some(10054)) {
        return true;
    }
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

pub struct UdpTransport;

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn init_primary(&self, setup: &PrimarySetup) -> Result<PrimaryIo> {
        Ok(PrimaryIo::Datagram(DatagramIo::open(setup)?))
    }

    fn deinit_primary(&self, io: &PrimaryIo) {
        if let PrimaryIo::Datagram(io) = io {
            io.shutdown();
        }
    }

    async fn wakeup_primary(&self, io: &PrimaryIo) -> Result<Wakeup> {
        io.datagram()?.recv().await
    }

    fn prepare(&self, io: &PrimaryIo, msg: Bytes, to: SocketAddr) -> Result<Prepared> {
        let io = io.datagram()?;
        match io.pool() {
            Some(pool) => {
                pool.send(msg, to)?;
                Ok(Prepared::Queued)
            }
            None => Ok(Prepared::Send(msg)),
        }
    }

    async fn send_datagram(&self, io: &PrimaryIo, msg: Bytes, to: SocketAddr) -> Result<()> {
        io.datagram()?.send_to(msg, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindConfig, TportConfig};
    use rust_tport_core::udp::PoolConfig;
    use std::time::Duration;

    fn setup(config: BindConfig) -> PrimarySetup {
        PrimarySetup {
            name: "udp:127.0.0.1:0".parse().unwrap(),
            addr: "127.0.0.1:0".parse().unwrap(),
            kind: TransportKind::Udp,
            config: Arc::new(config),
            tport: Arc::new(TportConfig::default()),
        }
    }

    #[tokio::test]
    async fn datagrams_keep_their_own_size() {
        let io = DatagramIo::open(&setup(BindConfig::default())).unwrap();
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let long = format!("OPTIONS sip:a SIP/2.0\r\nX-Pad: {}\r\n\r\n", "x".repeat(900));
        let short = "OPTIONS sip:b SIP/2.0\r\n\r\n";
        peer.send_to(long.as_bytes(), io.local_addr()).await.unwrap();
        peer.send_to(short.as_bytes(), io.local_addr()).await.unwrap();
        for expected in [long.as_str(), short] {
            let wakeup = tokio::time::timeout(Duration::from_secs(2), io.recv())
                .await
                .unwrap()
                .unwrap();
            let Wakeup::Datagram { payload, from, .. } = wakeup else {
                panic!("expected a datagram");
            };
            assert_eq!(from, peer.local_addr().unwrap());
            assert_eq!(payload.len(), expected.len());
            assert_eq!(&payload[..], expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn pool_shutdown_does_not_block_the_loop() {
        let config = BindConfig::default().set_pool(PoolConfig::default().set_threads(2));
        let io = DatagramIo::open(&setup(config)).unwrap();
        io.shutdown();
        let pool = io.pool().unwrap();
        assert!(matches!(
            pool.send(Bytes::from_static(b"OPTIONS"), io.local_addr()),
            Err(Error::Closed)
        ));
        // a second shutdown has nothing left to join
        io.shutdown();
        assert!(pool.stop().is_empty());
    }
}
