//! The master → primary → secondary tree.
//!
//! Entries live in two generational arenas and refer to each other by
//! [`Handle`]. A primary records which of its secondaries are still open and
//! which are closed but referenced; the reuse index maps a peer name to its
//! open secondaries so `connect` can find an existing connection in
//! logarithmic time.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use rust_tport_core::name::{Direction, NameKey, TransportKind, TransportName};
use rust_tport_core::tls::{PeerIdentity, TlsState};

use crate::transport::{PrimaryIo, PrimarySetup, Transport};

pub mod arena;
pub mod timer;

use arena::{Arena, Handle};
use timer::TimerParams;

/// Traffic counters shared between an entry and its tasks.
#[derive(Default, Debug)]
pub struct Stats {
    msgs_sent: AtomicU64,
    bytes_sent: AtomicU64,
    msgs_recv: AtomicU64,
    bytes_recv: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
    last_sent: Mutex<Option<Instant>>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct StatsSnapshot {
    pub msgs_sent: u64,
    pub bytes_sent: u64,
    pub msgs_recv: u64,
    pub bytes_recv: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
}

impl Stats {
    pub fn on_sent(&self, bytes: usize) {
        self.msgs_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_sent.lock() = Some(Instant::now());
    }
    pub fn on_recv(&self, bytes: usize) {
        self.msgs_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }
    pub fn on_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn on_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }
    /// When the last message left.
    pub fn last_sent(&self) -> Option<Instant> {
        *self.last_sent.lock()
    }
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            msgs_sent: self.msgs_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            msgs_recv: self.msgs_recv.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SecondaryState {
    Connecting,
    Handshaking,
    Established,
    Closed,
}

/// Items on a secondary's send queue.
#[derive(Debug)]
pub enum Outgoing {
    Message(Bytes),
    Ping,
    Pong,
    /// Flush what is queued, then shut the write side.
    ShutdownWrite,
    /// Flush what is queued, then signal.
    Flush(oneshot::Sender<()>),
}

pub struct PrimaryEntry {
    pub kind: TransportKind,
    pub name: TransportName,
    pub local: SocketAddr,
    /// Public address learned through STUN.
    pub public: Option<SocketAddr>,
    pub setup: Arc<PrimarySetup>,
    pub transport: Arc<dyn Transport>,
    pub io: Arc<PrimaryIo>,
    pub open: Vec<Handle>,
    pub closed: Vec<Handle>,
    pub stats: Arc<Stats>,
    pub cancel: CancellationToken,
}

impl PrimaryEntry {
    pub fn info(&self) -> PrimaryInfo {
        PrimaryInfo {
            name: self.name.clone(),
            kind: self.kind,
            local: self.local,
            public: self.public,
        }
    }
}

pub struct SecondaryEntry {
    pub primary: Handle,
    pub kind: TransportKind,
    pub peer_name: TransportName,
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    pub direction: Direction,
    pub state: SecondaryState,
    pub tls_state: Option<TlsState>,
    pub identity: PeerIdentity,
    pub sender: tachyonix::Sender<Outgoing>,
    pub cancel: CancellationToken,
    /// Live [`crate::Tport`] handles pointing here.
    pub refs: usize,
    pub reusable: bool,
    /// The reader/writer task still runs.
    pub running: bool,
    /// The write side was shut down; nothing more may be queued.
    pub write_closed: bool,
    pub stats: Arc<Stats>,
    pub params: watch::Sender<TimerParams>,
}

impl SecondaryEntry {
    pub fn info(&self) -> SecondaryInfo {
        SecondaryInfo {
            kind: self.kind,
            peer_name: self.peer_name.clone(),
            peer: self.peer,
            local: self.local,
            direction: self.direction,
            state: self.state,
            stats: self.stats.snapshot(),
        }
    }
}

/// Snapshot of a primary handed to the upper layer.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PrimaryInfo {
    pub name: TransportName,
    pub kind: TransportKind,
    pub local: SocketAddr,
    pub public: Option<SocketAddr>,
}

/// Snapshot of a secondary handed to the upper layer.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SecondaryInfo {
    pub kind: TransportKind,
    pub peer_name: TransportName,
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    pub direction: Direction,
    pub state: SecondaryState,
    pub stats: StatsSnapshot,
}

/// What [`Tree::release`] and [`Tree::close`] leave for the caller to do
/// outside the lock.
pub struct Destroyed {
    pub transport: Arc<dyn Transport>,
    pub peer: SocketAddr,
}

#[derive(Default)]
pub struct Tree {
    pub primaries: Arena<PrimaryEntry>,
    pub secondaries: Arena<SecondaryEntry>,
    index: BTreeMap<(Handle, NameKey), Vec<Handle>>,
}

impl Tree {
    pub fn add_primary(&mut self, entry: PrimaryEntry) -> Handle {
        self.primaries.insert(entry)
    }

    /// Registers an open secondary under `primary`. Returns `None` when the
    /// primary is gone.
    pub fn add_secondary(&mut self, entry: SecondaryEntry) -> Option<Handle> {
        let primary = entry.primary;
        if !self.primaries.contains(primary) {
            return None;
        }
        let key = (primary, entry.peer_name.key());
        let id = self.secondaries.insert(entry);
        self.index.entry(key).or_default().push(id);
        if let Some(p) = self.primaries.get_mut(primary) {
            p.open.push(id);
        }
        Some(id)
    }

    /// Primaries speaking `proto`, restricted to `ident` when given.
    pub fn primaries_for<'a>(
        &'a self,
        proto: &'a str,
        ident: Option<&'a str>,
    ) -> impl Iterator<Item = (Handle, &'a PrimaryEntry)> + 'a {
        self.primaries.iter().filter(move |(_, p)| {
            p.kind.proto() == proto && (ident.is_none() || p.name.ident() == ident)
        })
    }

    /// First open secondary to `peer` under `primary`, optionally only a
    /// reusable one.
    pub fn find_open(&self, primary: Handle, peer: &NameKey, reusable_only: bool) -> Option<Handle> {
        self.index
            .get(&(primary, peer.clone()))?
            .iter()
            .copied()
            .find(|id| {
                self.secondaries
                    .get(*id)
                    .is_some_and(|s| s.state != SecondaryState::Closed && (!reusable_only || s.reusable))
            })
    }

    /// Bumps the reference count of a live entry.
    pub fn acquire(&mut self, id: Handle) -> bool {
        match self.secondaries.get_mut(id) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Moves a secondary from open to closed and out of the reuse index.
    /// Returns `false` when it was already closed.
    pub fn close(&mut self, id: Handle) -> bool {
        let Some(entry) = self.secondaries.get_mut(id) else {
            return false;
        };
        if entry.state == SecondaryState::Closed {
            return false;
        }
        entry.state = SecondaryState::Closed;
        entry.reusable = false;
        entry.cancel.cancel();
        let primary = entry.primary;
        let key = (primary, entry.peer_name.key());
        if let Some(list) = self.index.get_mut(&key) {
            list.retain(|s| *s != id);
            if list.is_empty() {
                self.index.remove(&key);
            }
        }
        if let Some(p) = self.primaries.get_mut(primary) {
            p.open.retain(|s| *s != id);
            p.closed.push(id);
        }
        true
    }

    /// Drops one reference; destroys the entry when it is closed, its task
    /// has finished and nobody holds it.
    pub fn release(&mut self, id: Handle) -> Option<Destroyed> {
        let entry = self.secondaries.get_mut(id)?;
        entry.refs = entry.refs.saturating_sub(1);
        self.destroy_if_unreferenced(id)
    }

    pub fn destroy_if_unreferenced(&mut self, id: Handle) -> Option<Destroyed> {
        let entry = self.secondaries.get(id)?;
        if entry.refs > 0 || entry.state != SecondaryState::Closed || entry.running {
            return None;
        }
        let entry = self.secondaries.remove(id)?;
        let transport = match self.primaries.get_mut(entry.primary) {
            Some(p) => {
                p.closed.retain(|s| *s != id);
                Some(p.transport.clone())
            }
            None => None,
        }?;
        Some(Destroyed {
            transport,
            peer: entry.peer,
        })
    }

    /// Removes a primary and closes every secondary under it. Returns the
    /// entry so the caller can deinit it outside the lock.
    pub fn remove_primary(&mut self, primary: Handle) -> Option<PrimaryEntry> {
        let open = self.primaries.get(primary)?.open.clone();
        for id in open {
            self.close(id);
        }
        let entry = self.primaries.remove(primary)?;
        entry.cancel.cancel();
        Some(entry)
    }
}
