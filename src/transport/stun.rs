use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::name::TransportKind;
use rust_tport_core::stun::{is_stun_datagram, StunCallback, StunClient, StunOutcome};

use crate::config::BindConfig;
use crate::transport::udp::{IoSink, UdpTransport};
use crate::transport::{Prepared, PrimaryIo, PrimarySetup, Transport, Wakeup};

/// UDP whose STUN traffic is routed to an external STUN engine. Outcomes of
/// discovery and keepalives surface from `wakeup_primary`.
pub struct StunUdpTransport {
    udp: UdpTransport,
    client: Arc<dyn StunClient>,
    outcome_sender: mpsc::UnboundedSender<StunOutcome>,
    outcomes: async_lock::Mutex<mpsc::UnboundedReceiver<StunOutcome>>,
}

impl StunUdpTransport {
    pub fn new(config: &BindConfig) -> Result<Self> {
        let client = config
            .stun
            .clone()
            .ok_or_else(|| Error::Config("stun-udp primary needs a stun client".into()))?;
        let (outcome_sender, outcomes) = mpsc::unbounded_channel();
        Ok(Self {
            udp: UdpTransport,
            client,
            outcome_sender,
            outcomes: async_lock::Mutex::new(outcomes),
        })
    }

    fn callback(&self) -> StunCallback {
        let sender = self.outcome_sender.clone();
        Box::new(move |outcome| {
            if sender.send(outcome).is_err() {
                log::debug!("stun outcome after primary closed");
            }
        })
    }
}

#[async_trait]
impl Transport for StunUdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StunUdp
    }

    async fn init_primary(&self, setup: &PrimarySetup) -> Result<PrimaryIo> {
        self.udp.init_primary(setup).await
    }

    fn start_primary(&self, io: &Arc<PrimaryIo>) -> Result<()> {
        let local = io.local_addr()?;
        let sink = Arc::new(IoSink(Arc::downgrade(io)));
        self.client.bind(local, sink, self.callback())
    }

    fn deinit_primary(&self, io: &PrimaryIo) {
        self.udp.deinit_primary(io)
    }

    async fn wakeup_primary(&self, io: &PrimaryIo) -> Result<Wakeup> {
        let datagram = io.datagram()?;
        let mut outcomes = self.outcomes.lock().await;
        tokio::select! {
            outcome = outcomes.recv() => Ok(outcome.map_or(Wakeup::Idle, Wakeup::Stun)),
            rs = datagram.recv() => rs,
        }
    }

    fn prepare(&self, io: &PrimaryIo, msg: Bytes, to: SocketAddr) -> Result<Prepared> {
        self.udp.prepare(io, msg, to)
    }

    async fn send_datagram(&self, io: &PrimaryIo, msg: Bytes, to: SocketAddr) -> Result<()> {
        self.udp.send_datagram(io, msg, to).await
    }

    fn keepalive(&self, io: &Arc<PrimaryIo>, peer: SocketAddr) -> Result<()> {
        let local = io.local_addr()?;
        let sink = Arc::new(IoSink(Arc::downgrade(io)));
        self.client.keepalive(local, peer, sink, self.callback())
    }

    fn stun_response(&self, _io: &PrimaryIo, datagram: &[u8], from: SocketAddr) -> bool {
        if !is_stun_datagram(datagram) {
            return false;
        }
        self.client.process_response(datagram, from);
        true
    }
}
