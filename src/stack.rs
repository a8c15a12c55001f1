//! The boundary towards the protocol stack above the transports.
//!
//! The master calls a [`Stack`] from a single delivery task, in the order the
//! events happened. A stack that prefers pulling events can use
//! [`ChannelStack`].

use std::net::SocketAddr;

use bytes::Bytes;
use flume::{Receiver, Sender};

use rust_tport_core::error::Error;
use rust_tport_core::name::TransportKind;

use crate::master::Tport;
use crate::tree::{PrimaryInfo, SecondaryInfo};

/// Where a message came from and what the transport vouches for.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Provenance {
    /// Arrived over TLS or WSS.
    pub secure: bool,
    /// The peer's certificate chain was verified.
    pub verified: bool,
    /// Names taken from the peer certificate.
    pub subjects: Vec<String>,
}

/// A complete message on its way up.
#[derive(Debug)]
pub struct IncomingMessage {
    /// The transport it arrived on; replies sent here go back to `from`.
    pub tport: Tport,
    pub kind: TransportKind,
    pub from: SocketAddr,
    pub payload: Bytes,
    pub provenance: Provenance,
}

pub trait Stack: Send + Sync + 'static {
    fn deliver(&self, msg: IncomingMessage);

    /// An error the transports could not handle themselves. `peer` is the
    /// remote end involved, when there is one.
    fn report_error(&self, error: Error, peer: Option<SocketAddr>);

    /// A primary's externally visible address changed.
    fn address_changed(&self, _primary: &PrimaryInfo) {}

    fn closed(&self, _secondary: &SecondaryInfo) {}
}

#[derive(Debug)]
pub enum StackEvent {
    Message(IncomingMessage),
    Error {
        error: Error,
        peer: Option<SocketAddr>,
    },
    AddressChanged(PrimaryInfo),
    Closed(SecondaryInfo),
}

/// Turns stack callbacks into a stream of [`StackEvent`]s.
#[derive(Clone)]
pub struct ChannelStack {
    sender: Sender<StackEvent>,
}

impl ChannelStack {
    pub fn new() -> (ChannelStack, Receiver<StackEvent>) {
        let (sender, receiver) = flume::unbounded();
        (ChannelStack { sender }, receiver)
    }

    fn push(&self, event: StackEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("stack event receiver is gone");
        }
    }
}

impl Stack for ChannelStack {
    fn deliver(&self, msg: IncomingMessage) {
        self.push(StackEvent::Message(msg))
    }
    fn report_error(&self, error: Error, peer: Option<SocketAddr>) {
        self.push(StackEvent::Error { error, peer })
    }
    fn address_changed(&self, primary: &PrimaryInfo) {
        self.push(StackEvent::AddressChanged(primary.clone()))
    }
    fn closed(&self, secondary: &SecondaryInfo) {
        self.push(StackEvent::Closed(secondary.clone()))
    }
}
