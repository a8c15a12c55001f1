//! The STUN collaborator contract.
//!
//! Address discovery and NAT keepalives are driven by an external STUN
//! engine. A STUN-aware UDP primary hands the engine a [`DatagramSink`] for
//! sending requests over the primary's own socket, routes STUN responses
//! back through [`StunClient::process_response`], and learns the outcome
//! through a one-shot [`StunCallback`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum StunOutcome {
    /// The externally visible address of the socket.
    Discovered(SocketAddr),
    Failed(String),
    TimedOut,
}

impl StunOutcome {
    pub fn public_addr(&self) -> Option<SocketAddr> {
        match self {
            StunOutcome::Discovered(addr) => Some(*addr),
            _ => None,
        }
    }
}

pub type StunCallback = Box<dyn FnOnce(StunOutcome) + Send>;

/// Sends raw datagrams over a primary's socket.
pub trait DatagramSink: Send + Sync {
    fn send_to(&self, payload: Bytes, to: SocketAddr) -> Result<()>;
}

pub trait StunClient: Send + Sync {
    /// Starts discovery of the public address of the socket bound to `local`.
    fn bind(&self, local: SocketAddr, sink: Arc<dyn DatagramSink>, done: StunCallback) -> Result<()>;

    /// Starts a keepalive exchange towards `peer`. The callback reports the
    /// mapped address seen by the server, which may differ from the last one.
    fn keepalive(
        &self,
        local: SocketAddr,
        peer: SocketAddr,
        sink: Arc<dyn DatagramSink>,
        done: StunCallback,
    ) -> Result<()>;

    /// Feeds a STUN datagram received on the primary's socket to the engine.
    fn process_response(&self, datagram: &[u8], from: SocketAddr);
}

impl fmt::Debug for dyn StunClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StunClient")
    }
}

/// Whether a datagram carries a STUN header: two leading zero bits, a
/// length that is a multiple of four and the magic cookie.
pub fn is_stun_datagram(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN || data[0] & 0xc0 != 0 {
        return false;
    }
    let len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    len % 4 == 0 && cookie == MAGIC_COOKIE && HEADER_LEN + len <= data.len()
}
