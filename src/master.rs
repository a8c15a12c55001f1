//! The lifecycle manager.
//!
//! A [`Master`] owns the transport tree. Binding creates a primary and a task
//! serving its socket; connecting or accepting creates a secondary served by
//! a reader task (framing, timers, delivery) and, once the connection is
//! usable, a writer task draining its send queue. Everything the upper layer
//! sees goes through one delivery task calling the [`Stack`].

use std::borrow::Cow;
use std::fmt;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rust_tport_core::capture::{Capture, Traffic, TrafficDump};
use rust_tport_core::error::{Error, ErrorCode, Result};
use rust_tport_core::framing::{Frame, Framer, SipFramer};
use rust_tport_core::name::{Direction, TransportKind, TransportName};
use rust_tport_core::stun::StunOutcome;
use rust_tport_core::tls::{PeerIdentity, TlsState};
use rust_tport_core::udp::{DatagramKind, DeliveryTicket};

use crate::config::{BindConfig, Diagnostics, TportConfig};
use crate::stack::{IncomingMessage, Provenance, Stack};
use crate::transport::{
    transport_for, Connection, Prepared, PrimaryIo, PrimarySetup, RawStream, Received, RecvHalf,
    SecondaryCtx, SendHalf, Transport, Wakeup,
};
use crate::tree::arena::Handle;
use crate::tree::timer::{SecondaryTimers, TimerAction, TimerParams};
use crate::tree::{
    Outgoing, PrimaryEntry, PrimaryInfo, SecondaryEntry, SecondaryInfo, SecondaryState, Stats,
    StatsSnapshot, Tree,
};

/// Bound on connect plus handshake when no TLS handshake timeout applies.
pub const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const WRITE_BATCH: usize = 16;

enum StackCall {
    Deliver(IncomingMessage, Option<DeliveryTicket>),
    Error(Error, Option<SocketAddr>),
    AddressChanged(PrimaryInfo),
    Closed(SecondaryInfo),
}

pub struct Master {
    inner: Arc<MasterInner>,
}

pub(crate) struct MasterInner {
    config: Arc<TportConfig>,
    tree: Mutex<Tree>,
    calls: mpsc::UnboundedSender<StackCall>,
    cancel: CancellationToken,
    live: AtomicUsize,
    drained: Notify,
    dump: Option<TrafficDump>,
    capture: Option<Capture>,
}

/// The parts of a primary a new secondary needs.
struct PrimaryRef {
    id: Handle,
    kind: TransportKind,
    name: TransportName,
    setup: Arc<PrimarySetup>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    stats: Arc<Stats>,
}

impl Master {
    /// Creates a master delivering to `stack`. Must be called inside a tokio
    /// runtime.
    ///
    /// The `TPORT_*` environment variables fill in whatever diagnostics
    /// `config` leaves unset.
    pub fn new(config: TportConfig, stack: Arc<dyn Stack>) -> Result<Master> {
        Self::with_env(config, stack, |key| std::env::var(key).ok())
    }

    pub(crate) fn with_env(
        mut config: TportConfig,
        stack: Arc<dyn Stack>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Master> {
        config.check()?;
        let env = Diagnostics::from_lookup(lookup);
        config.diagnostics = std::mem::take(&mut config.diagnostics).merge(env);
        let diagnostics = &config.diagnostics;
        diagnostics.apply_level();
        let dump = diagnostics.dump.as_deref().and_then(|path| match TrafficDump::open(path) {
            Ok(dump) => Some(dump),
            Err(e) => {
                log::warn!("dump file {},{e:?}", path.display());
                None
            }
        });
        let capture = diagnostics.capture.as_ref().and_then(|target| match Capture::connect(target) {
            Ok(capture) => Some(capture),
            Err(e) => {
                log::warn!("capture server {target:?},{e:?}");
                None
            }
        });
        let (calls, receiver) = mpsc::unbounded_channel();
        tokio::spawn(stack_loop(stack, receiver));
        Ok(Master {
            inner: Arc::new(MasterInner {
                config: Arc::new(config),
                tree: Mutex::new(Tree::default()),
                calls,
                cancel: CancellationToken::new(),
                live: AtomicUsize::new(0),
                drained: Notify::new(),
                dump,
                capture,
            }),
        })
    }

    pub fn config(&self) -> &TportConfig {
        &self.inner.config
    }

    /// Creates a primary for `name`. The transport kind follows from the
    /// name's protocol and `config`; a setup failure is returned and leaves
    /// nothing behind.
    pub async fn bind(&self, name: &TransportName, config: BindConfig) -> Result<Tport> {
        let kind = config.kind_for(name.proto())?;
        config.check(kind)?;
        let addr = resolve(name).await?;
        let transport = transport_for(kind, &config)?;
        let name = match (&config.ident, name.ident()) {
            (Some(ident), None) => name.clone().with_ident(ident.clone()),
            _ => name.clone(),
        };
        let setup = Arc::new(PrimarySetup {
            name: name.clone(),
            addr,
            kind,
            config: Arc::new(config),
            tport: self.inner.config.clone(),
        });
        let io = Arc::new(transport.init_primary(&setup).await?);
        let local = match io.local_addr() {
            Ok(local) => local,
            Err(e) => {
                transport.deinit_primary(&io);
                return Err(e);
            }
        };
        let cancel = self.inner.cancel.child_token();
        let id = self.inner.tree.lock().add_primary(PrimaryEntry {
            kind,
            name: name.clone(),
            local,
            public: None,
            setup,
            transport: transport.clone(),
            io: io.clone(),
            open: Vec::new(),
            closed: Vec::new(),
            stats: Arc::default(),
            cancel: cancel.clone(),
        });
        if let Err(e) = transport.start_primary(&io) {
            self.inner.close_primary(id);
            return Err(e);
        }
        if !matches!(*io, PrimaryIo::Outbound { .. }) {
            tokio::spawn(serve_primary(
                self.inner.clone(),
                id,
                name.clone(),
                transport,
                io,
                cancel,
            ));
        }
        log::info!("bound {kind} {name} on {local}");
        Ok(Tport::new(
            Arc::downgrade(&self.inner),
            Target::Primary { id, peer: None },
        ))
    }

    /// A transport towards `name`. Connection-oriented kinds reuse an open
    /// reusable secondary to the same peer when reuse is configured.
    pub async fn connect(&self, name: &TransportName) -> Result<Tport> {
        self.inner.connect(name, self.inner.config.reuse).await
    }

    /// Like [`Master::connect`] but always opens a new connection.
    pub async fn connect_fresh(&self, name: &TransportName) -> Result<Tport> {
        self.inner.connect(name, false).await
    }

    /// Connects (or reuses) and queues `msg`.
    pub async fn send(&self, name: &TransportName, msg: impl Into<Bytes>) -> Result<Tport> {
        let tport = self.connect(name).await?;
        tport.send(msg).await?;
        Ok(tport)
    }

    /// An open secondary to `name`, without creating one.
    pub fn by_name(&self, name: &TransportName) -> Option<Tport> {
        let mut tree = self.inner.tree.lock();
        let key = name.key();
        let primaries: Vec<Handle> = tree
            .primaries_for(name.proto(), name.ident())
            .map(|(id, _)| id)
            .collect();
        let id = primaries
            .into_iter()
            .find_map(|primary| tree.find_open(primary, &key, false))?;
        tree.acquire(id);
        Some(Tport::new(
            Arc::downgrade(&self.inner),
            Target::Secondary(id),
        ))
    }

    pub fn primaries(&self) -> Vec<PrimaryInfo> {
        let tree = self.inner.tree.lock();
        tree.primaries.iter().map(|(_, p)| p.info()).collect()
    }

    pub fn secondaries(&self) -> Vec<SecondaryInfo> {
        let tree = self.inner.tree.lock();
        tree.secondaries.iter().map(|(_, s)| s.info()).collect()
    }

    /// Closes every primary, waits for the secondaries to flush and stop,
    /// then stops the remaining tasks.
    pub async fn shutdown(&self) {
        let primaries: Vec<Handle> = self
            .inner
            .tree
            .lock()
            .primaries
            .iter()
            .map(|(id, _)| id)
            .collect();
        for id in primaries {
            self.inner.close_primary(id);
        }
        let drained = async {
            while self.inner.live.load(Ordering::Acquire) > 0 {
                self.inner.drained.notified().await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drained).await.is_err() {
            log::warn!(
                "{} secondaries still running at shutdown",
                self.inner.live.load(Ordering::Acquire)
            );
        }
        self.inner.cancel.cancel();
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl MasterInner {
    fn primary_ref(&self, id: Handle) -> Option<PrimaryRef> {
        let tree = self.tree.lock();
        let p = tree.primaries.get(id)?;
        Some(PrimaryRef {
            id,
            kind: p.kind,
            name: p.name.clone(),
            setup: p.setup.clone(),
            transport: p.transport.clone(),
            cancel: p.cancel.clone(),
            stats: p.stats.clone(),
        })
    }

    /// Picks the primary serving `name`: same protocol and ident, preferring
    /// the peer's address family and primaries without an ident.
    fn select_primary(&self, name: &TransportName) -> Result<PrimaryRef> {
        let family = name.socket_addr().map(|a| a.is_ipv4());
        let id = {
            let tree = self.tree.lock();
            tree.primaries_for(name.proto(), name.ident())
                .min_by_key(|(_, p)| {
                    let other_family = family.is_some_and(|v4| v4 != p.local.is_ipv4());
                    (other_family, p.name.ident().is_some())
                })
                .map(|(id, _)| id)
        };
        id.and_then(|id| self.primary_ref(id))
            .ok_or_else(|| Error::InvalidName(format!("no primary for {name}")))
    }

    async fn connect(self: &Arc<Self>, name: &TransportName, reuse: bool) -> Result<Tport> {
        let primary = self.select_primary(name)?;
        if !primary.kind.is_connection_oriented() {
            let peer = resolve(name).await?;
            return Ok(Tport::new(
                Arc::downgrade(self),
                Target::Primary {
                    id: primary.id,
                    peer: Some(peer),
                },
            ));
        }
        let peer = if primary.transport.resolves_peer() {
            resolve(name).await?
        } else {
            name.socket_addr()
                .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), name.port()))
        };
        if reuse && primary.setup.config.reuse {
            let mut tree = self.tree.lock();
            if let Some(id) = tree.find_open(primary.id, &name.key(), true) {
                tree.acquire(id);
                return Ok(Tport::new(Arc::downgrade(self), Target::Secondary(id)));
            }
        }
        let id = self.spawn_secondary(&primary, name.clone(), peer, Direction::Outgoing, None, 1)?;
        log::debug!("{} connecting to {name} ({peer})", primary.name);
        Ok(Tport::new(Arc::downgrade(self), Target::Secondary(id)))
    }

    fn accept(self: &Arc<Self>, primary: Handle, stream: RawStream, peer: SocketAddr) {
        let Some(primary) = self.primary_ref(primary) else {
            return;
        };
        let peer_name = TransportName::from_addr(primary.kind.proto(), peer);
        match self.spawn_secondary(&primary, peer_name, peer, Direction::Incoming, Some(stream), 0) {
            Ok(id) => log::debug!("{} accepted {peer} as {id:?}", primary.name),
            Err(e) => log::debug!("{} accept {peer},{e:?}", primary.name),
        }
    }

    /// Registers a secondary and starts its task. `refs` counts the handles
    /// the caller is about to hand out.
    fn spawn_secondary(
        self: &Arc<Self>,
        primary: &PrimaryRef,
        peer_name: TransportName,
        peer: SocketAddr,
        direction: Direction,
        stream: Option<RawStream>,
        refs: usize,
    ) -> Result<Handle> {
        let (sender, queue) = tachyonix::channel(self.config.queue_size);
        let (params, params_rx) = watch::channel(TimerParams::from(&*self.config));
        let cancel = primary.cancel.child_token();
        let stats = Arc::new(Stats::default());
        let state = if stream.is_some() {
            SecondaryState::Handshaking
        } else {
            SecondaryState::Connecting
        };
        let entry = SecondaryEntry {
            primary: primary.id,
            kind: primary.kind,
            peer_name: peer_name.clone(),
            peer,
            local: stream.as_ref().and_then(RawStream::local_addr),
            direction,
            state,
            tls_state: None,
            identity: PeerIdentity::default(),
            sender: sender.clone(),
            cancel: cancel.clone(),
            refs,
            reusable: self.config.reuse && primary.setup.config.reuse,
            running: true,
            write_closed: false,
            stats: stats.clone(),
            params,
        };
        let id = self.tree.lock().add_secondary(entry).ok_or(Error::Closed)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        let task = SecondaryTask {
            inner: self.clone(),
            id,
            kind: primary.kind,
            setup: primary.setup.clone(),
            transport: primary.transport.clone(),
            peer_name,
            peer,
            direction,
            cancel,
            sender,
            stats: [stats, primary.stats.clone()],
        };
        tokio::spawn(task.run(stream, queue, params_rx));
        Ok(id)
    }

    fn with_secondary<R>(&self, id: Handle, f: impl FnOnce(&mut SecondaryEntry) -> R) -> Option<R> {
        let mut tree = self.tree.lock();
        tree.secondaries.get_mut(id).map(f)
    }

    fn set_state(&self, id: Handle, state: SecondaryState) {
        self.with_secondary(id, |entry| {
            if entry.state != SecondaryState::Closed {
                entry.state = state;
            }
        });
    }

    fn set_tls_state(&self, id: Handle, state: TlsState) {
        self.with_secondary(id, |entry| entry.tls_state = Some(state));
    }

    fn set_connection(&self, id: Handle, identity: PeerIdentity, local: Option<SocketAddr>) {
        self.with_secondary(id, |entry| {
            entry.identity = identity;
            if local.is_some() {
                entry.local = local;
            }
        });
    }

    fn enqueue(&self, id: Handle, item: Outgoing) -> Result<()> {
        let tree = self.tree.lock();
        let entry = tree.secondaries.get(id).ok_or(Error::Closed)?;
        if entry.state == SecondaryState::Closed || entry.write_closed {
            return Err(Error::Closed);
        }
        entry.sender.try_send(item).map_err(|e| match e {
            tachyonix::TrySendError::Full(_) => Error::QueueFull,
            tachyonix::TrySendError::Closed(_) => Error::Closed,
        })
    }

    fn close_secondary(&self, id: Handle) {
        if self.tree.lock().close(id) {
            log::debug!("closing secondary {id:?}");
        }
    }

    fn shutdown_write(&self, id: Handle) -> Result<()> {
        let mut tree = self.tree.lock();
        let entry = tree.secondaries.get_mut(id).ok_or(Error::Closed)?;
        if entry.state == SecondaryState::Closed || entry.write_closed {
            return Ok(());
        }
        entry.reusable = false;
        let rs = entry.sender.try_send(Outgoing::ShutdownWrite).map_err(|e| match e {
            tachyonix::TrySendError::Full(_) => Error::QueueFull,
            tachyonix::TrySendError::Closed(_) => Error::Closed,
        });
        if rs.is_ok() {
            entry.write_closed = true;
        }
        rs
    }

    /// Called once by a secondary's task as it ends.
    fn finish_secondary(&self, id: Handle) {
        let (info, destroyed) = {
            let mut tree = self.tree.lock();
            tree.close(id);
            let info = tree.secondaries.get_mut(id).map(|entry| {
                entry.running = false;
                entry.info()
            });
            (info, tree.destroy_if_unreferenced(id))
        };
        if let Some(info) = info {
            log::debug!("{} closed, {:?}", info.peer_name, info.stats);
            self.call(StackCall::Closed(info));
        }
        if let Some(destroyed) = destroyed {
            destroyed.transport.deinit_secondary(destroyed.peer);
        }
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_one();
        }
    }

    fn release(&self, id: Handle) {
        let destroyed = self.tree.lock().release(id);
        if let Some(destroyed) = destroyed {
            destroyed.transport.deinit_secondary(destroyed.peer);
        }
    }

    fn close_primary(&self, id: Handle) {
        let removed = self.tree.lock().remove_primary(id);
        if let Some(entry) = removed {
            log::info!("closing {} on {}", entry.name, entry.local);
            entry.transport.deinit_primary(&entry.io);
        }
    }

    fn call(&self, call: StackCall) {
        if self.calls.send(call).is_err() {
            log::debug!("stack loop is gone");
        }
    }

    fn report(&self, error: Error, peer: Option<SocketAddr>) {
        self.call(StackCall::Error(error, peer));
    }

    fn trace(&self, traffic: Traffic, kind: TransportKind, local: SocketAddr, peer: SocketAddr, payload: &[u8]) {
        if self.config.diagnostics.log_messages {
            let (verb, dir) = match traffic {
                Traffic::Sent => ("sent", "to"),
                Traffic::Received => ("recv", "from"),
            };
            log::info!(
                "{verb} {} bytes {dir} {}/{peer}: {}",
                payload.len(),
                kind.proto(),
                first_line(payload)
            );
        }
        if let Some(dump) = &self.dump {
            dump.record(traffic, kind.proto(), peer, payload);
        }
        if let Some(capture) = &self.capture {
            capture.record(traffic, kind.ip_protocol(), local, peer, payload);
        }
    }

    fn on_datagram(
        self: &Arc<Self>,
        primary: Handle,
        payload: Bytes,
        from: SocketAddr,
        ticket: Option<DeliveryTicket>,
    ) {
        let found = self
            .tree
            .lock()
            .primaries
            .get(primary)
            .map(|p| (p.kind, p.local, p.stats.clone()));
        let Some((kind, local, stats)) = found else {
            return;
        };
        stats.on_recv(payload.len());
        self.trace(Traffic::Received, kind, local, from, &payload);
        let msg = IncomingMessage {
            tport: Tport::new(
                Arc::downgrade(self),
                Target::Primary {
                    id: primary,
                    peer: Some(from),
                },
            ),
            kind,
            from,
            payload,
            provenance: Provenance::default(),
        };
        self.call(StackCall::Deliver(msg, ticket));
    }

    fn on_stun(&self, primary: Handle, outcome: StunOutcome) {
        let changed = {
            let mut tree = self.tree.lock();
            let Some(entry) = tree.primaries.get_mut(primary) else {
                return;
            };
            let public = outcome.public_addr();
            if entry.public == public {
                None
            } else {
                entry.public = public;
                Some(entry.info())
            }
        };
        match outcome {
            StunOutcome::Discovered(_) => {}
            StunOutcome::Failed(reason) => self.report(Error::Protocol(format!("stun: {reason}")), None),
            StunOutcome::TimedOut => self.report(Error::TimedOut("stun binding"), None),
        }
        if let Some(info) = changed {
            log::info!("{} public address is now {:?}", info.name, info.public);
            self.call(StackCall::AddressChanged(info));
        }
    }

    async fn send_datagram(&self, primary: Handle, msg: Bytes, to: SocketAddr) -> Result<()> {
        let (transport, io, kind, local, stats) = {
            let tree = self.tree.lock();
            let p = tree.primaries.get(primary).ok_or(Error::Closed)?;
            (p.transport.clone(), p.io.clone(), p.kind, p.local, p.stats.clone())
        };
        let len = msg.len();
        let traced = msg.clone();
        let rs = match transport.prepare(&io, msg, to) {
            Ok(Prepared::Send(msg)) => transport.send_datagram(&io, msg, to).await,
            Ok(Prepared::Queued) => Ok(()),
            Err(e) => Err(e),
        };
        match rs {
            Ok(()) => {
                stats.on_sent(len);
                self.trace(Traffic::Sent, kind, local, to, &traced);
                Ok(())
            }
            Err(e) => {
                stats.on_send_error();
                Err(e)
            }
        }
    }

    fn keepalive_datagram(&self, primary: Handle, peer: SocketAddr) -> Result<()> {
        let (transport, io) = {
            let tree = self.tree.lock();
            let p = tree.primaries.get(primary).ok_or(Error::Closed)?;
            (p.transport.clone(), p.io.clone())
        };
        transport.keepalive(&io, peer)
    }
}

async fn stack_loop(stack: Arc<dyn Stack>, mut calls: mpsc::UnboundedReceiver<StackCall>) {
    while let Some(call) = calls.recv().await {
        match call {
            StackCall::Deliver(msg, ticket) => {
                stack.deliver(msg);
                drop(ticket);
            }
            StackCall::Error(error, peer) => stack.report_error(error, peer),
            StackCall::AddressChanged(info) => stack.address_changed(&info),
            StackCall::Closed(info) => stack.closed(&info),
        }
    }
}

async fn serve_primary(
    inner: Arc<MasterInner>,
    id: Handle,
    name: TransportName,
    transport: Arc<dyn Transport>,
    io: Arc<PrimaryIo>,
    cancel: CancellationToken,
) {
    loop {
        let wakeup = tokio::select! {
            _ = cancel.cancelled() => break,
            rs = transport.wakeup_primary(&io) => rs,
        };
        match wakeup {
            Ok(Wakeup::Accepted { stream, peer }) => inner.accept(id, stream, peer),
            Ok(Wakeup::Datagram {
                kind: DatagramKind::Stun,
                payload,
                from,
                ..
            }) => {
                if !transport.stun_response(&io, &payload, from) {
                    log::debug!("{name} dropped stun datagram from {from}");
                }
            }
            Ok(Wakeup::Datagram {
                payload,
                from,
                ticket,
                ..
            }) => inner.on_datagram(id, payload, from, ticket),
            Ok(Wakeup::Stun(outcome)) => inner.on_stun(id, outcome),
            Ok(Wakeup::Idle) => {}
            Err(e) if e.code() == ErrorCode::Closed => break,
            Err(e) => {
                log::warn!("{name},{e:?}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    log::debug!("{name} stopped serving");
}

async fn resolve(name: &TransportName) -> Result<SocketAddr> {
    if let Some(addr) = name.socket_addr() {
        return Ok(addr);
    }
    tokio::net::lookup_host(name.authority())
        .await?
        .next()
        .ok_or_else(|| Error::InvalidName(format!("{name} has no address")))
}

fn first_line(payload: &[u8]) -> Cow<'_, str> {
    let end = payload
        .iter()
        .position(|b| *b == b'\r' || *b == b'\n')
        .unwrap_or(payload.len())
        .min(80);
    String::from_utf8_lossy(&payload[..end])
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Everything a secondary's tasks share.
struct SecondaryTask {
    inner: Arc<MasterInner>,
    id: Handle,
    kind: TransportKind,
    setup: Arc<PrimarySetup>,
    transport: Arc<dyn Transport>,
    peer_name: TransportName,
    peer: SocketAddr,
    direction: Direction,
    cancel: CancellationToken,
    sender: tachyonix::Sender<Outgoing>,
    /// The secondary's own counters and its primary's.
    stats: [Arc<Stats>; 2],
}

impl SecondaryTask {
    fn establish_timeout(&self) -> Duration {
        match &self.setup.config.tls {
            Some(tls) => tls.handshake_timeout.max(ESTABLISH_TIMEOUT),
            None => ESTABLISH_TIMEOUT,
        }
    }

    async fn run(
        self,
        stream: Option<RawStream>,
        queue: tachyonix::Receiver<Outgoing>,
        params: watch::Receiver<TimerParams>,
    ) {
        let established = tokio::select! {
            _ = self.cancel.cancelled() => Err(None),
            rs = tokio::time::timeout(self.establish_timeout(), self.establish(stream)) => match rs {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(Some(e)),
                Err(_) => Err(Some(Error::TimedOut("connection establishment"))),
            },
        };
        let error = match established {
            Ok(conn) => {
                let mut session = Session::new(&self, conn, queue, params);
                let rs = session.run().await;
                self.cancel.cancel();
                let written = match session.writer.take() {
                    Some(writer) => match tokio::time::timeout(FLUSH_TIMEOUT, writer).await {
                        Ok(Ok(rs)) => rs,
                        Ok(Err(e)) => {
                            log::warn!("{} writer,{e:?}", self.peer_name);
                            Ok(())
                        }
                        Err(_) => {
                            log::debug!("{} flush timed out", self.peer_name);
                            Ok(())
                        }
                    },
                    None => Ok(()),
                };
                rs.and(written).err()
            }
            Err(e) => e,
        };
        if let Some(e) = error {
            log::debug!("{},{e:?}", self.peer_name);
            self.inner.report(e, Some(self.peer));
        }
        self.inner.finish_secondary(self.id);
    }

    async fn establish(&self, stream: Option<RawStream>) -> Result<Connection> {
        let stream = match stream {
            Some(stream) => stream,
            None => {
                let stream = self.transport.connect(&self.setup, self.peer).await?;
                self.inner.set_state(self.id, SecondaryState::Handshaking);
                stream
            }
        };
        let inner = &self.inner;
        let id = self.id;
        let mut on_state = move |state: TlsState| inner.set_tls_state(id, state);
        let conn = self
            .transport
            .init_secondary(&self.setup, stream, self.direction, &self.peer_name, &mut on_state)
            .await?;
        self.inner.set_connection(id, conn.identity.clone(), conn.local);
        Ok(conn)
    }

    fn queue(&self, item: Outgoing) {
        if let Err(e) = self.sender.try_send(item) {
            log::debug!("{} keepalive not queued: {e:?}", self.peer_name);
        }
    }
}

/// The reader side of an established secondary.
struct Session<'a> {
    task: &'a SecondaryTask,
    recv: Box<dyn RecvHalf>,
    ctx: SecondaryCtx,
    framer: Box<dyn Framer>,
    timers: SecondaryTimers,
    params: watch::Receiver<TimerParams>,
    /// Send half and queue, until the connection may carry messages.
    parked: Option<(Box<dyn SendHalf>, tachyonix::Receiver<Outgoing>)>,
    writer: Option<JoinHandle<Result<()>>>,
    provenance: Provenance,
    local: Option<SocketAddr>,
    tunnel_deadline: Option<Instant>,
}

impl<'a> Session<'a> {
    fn new(
        task: &'a SecondaryTask,
        conn: Connection,
        queue: tachyonix::Receiver<Outgoing>,
        params: watch::Receiver<TimerParams>,
    ) -> Self {
        let Connection {
            recv,
            send,
            identity,
            local,
            tunnel_pending,
        } = conn;
        let now = Instant::now();
        let timers = SecondaryTimers::new(*params.borrow(), now);
        Session {
            task,
            recv,
            ctx: SecondaryCtx {
                peer: task.peer,
                direction: task.direction,
                tunnel_pending,
            },
            framer: match &task.setup.config.framer {
                Some(init) => init.framer(task.peer),
                None => Box::new(SipFramer::new(task.inner.config.max_message)),
            },
            timers,
            params,
            parked: Some((send, queue)),
            writer: None,
            provenance: Provenance {
                secure: task.kind.is_secure(),
                verified: identity.verified,
                subjects: identity.subjects,
            },
            local,
            tunnel_deadline: tunnel_pending.then(|| now + task.establish_timeout()),
        }
    }

    async fn run(&mut self) -> Result<()> {
        if !self.ctx.tunnel_pending {
            self.open();
        }
        let mut buf = BytesMut::new();
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.task.cancel.cancelled() => return Ok(()),
                changed = self.params.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let params = *self.params.borrow_and_update();
                    self.timers.update(params, Instant::now());
                }
                _ = sleep_until(deadline) => {
                    if !self.on_timer()? {
                        return Ok(());
                    }
                }
                rs = self.recv.recv(&mut buf) => {
                    let received = match rs {
                        Ok(received) => received,
                        Err(e) => {
                            self.task.stats.iter().for_each(|s| s.on_recv_error());
                            return Err(e);
                        }
                    };
                    match received {
                        Received::Eof => {
                            if !buf.is_empty() {
                                log::debug!("{} eof, {} bytes of an incomplete message discarded", self.task.peer_name, buf.len());
                            }
                            return Ok(());
                        }
                        Received::Data(_) => self.drain(&mut buf).await?,
                        Received::Message(msg) => self.on_message(msg).await?,
                        Received::Ping => self.on_ping(),
                        Received::Pong => self.timers.on_pong(),
                    }
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let timer = self.task.transport.next_secondary_timer(&self.timers);
        match (timer, self.tunnel_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Cuts every complete frame off `buf`.
    async fn drain(&mut self, buf: &mut BytesMut) -> Result<()> {
        while let Some(frame) = self.framer.decode(buf)? {
            match frame {
                Frame::Message(msg) => self.on_message(msg).await?,
                Frame::Ping => self.on_ping(),
                Frame::Pong => self.timers.on_pong(),
            }
            if self.task.cancel.is_cancelled() {
                break;
            }
        }
        self.timers.set_incomplete(!buf.is_empty(), Instant::now());
        Ok(())
    }

    async fn on_message(&mut self, msg: Bytes) -> Result<()> {
        let max = self.task.inner.config.max_message;
        if msg.len() > max {
            return Err(Error::Protocol(format!("message of {} bytes exceeds {max}", msg.len())));
        }
        self.timers.on_activity(Instant::now());
        let Some(msg) = self.task.transport.deliver(&mut self.ctx, msg).await? else {
            if !self.ctx.tunnel_pending {
                self.open();
            }
            return Ok(());
        };
        let task = self.task;
        task.stats.iter().for_each(|s| s.on_recv(msg.len()));
        task.inner.trace(
            Traffic::Received,
            task.kind,
            self.local.unwrap_or(unspecified()),
            task.peer,
            &msg,
        );
        if !task.inner.tree.lock().acquire(task.id) {
            return Ok(());
        }
        let msg = IncomingMessage {
            tport: Tport::new(Arc::downgrade(&task.inner), Target::Secondary(task.id)),
            kind: task.kind,
            from: task.peer,
            payload: msg,
            provenance: self.provenance.clone(),
        };
        task.inner.call(StackCall::Deliver(msg, None));
        Ok(())
    }

    fn on_ping(&mut self) {
        if self.timers.params().pong2ping {
            self.task.queue(Outgoing::Pong);
        }
    }

    /// Returns `false` when the secondary should close quietly.
    fn on_timer(&mut self) -> Result<bool> {
        let now = Instant::now();
        if self.tunnel_deadline.is_some_and(|at| at <= now) {
            return Err(Error::TimedOut("proxy tunnel"));
        }
        match self.task.transport.secondary_timer(&self.timers, now) {
            Some(TimerAction::SendPing) => {
                self.task.queue(Outgoing::Ping);
                self.timers.on_ping_sent(now);
            }
            Some(TimerAction::PongTimeout) => return Err(Error::TimedOut("keepalive pong")),
            Some(TimerAction::IncompleteTimeout) => {
                return Err(Error::Protocol("incomplete message timed out".into()))
            }
            Some(TimerAction::IdleTimeout) => match self.task.stats[0].last_sent() {
                // a send restarts the idle period from when it left
                Some(at) if at > self.timers.last_activity() => self.timers.on_activity(at),
                _ => {
                    log::debug!("{} idle, closing", self.task.peer_name);
                    return Ok(false);
                }
            },
            None => {}
        }
        Ok(true)
    }

    /// Starts the writer; queued messages leave from here on.
    fn open(&mut self) {
        let Some((send, queue)) = self.parked.take() else {
            return;
        };
        let task = self.task;
        let writer = Writer {
            send,
            queue,
            inner: task.inner.clone(),
            kind: task.kind,
            local: self.local.unwrap_or(unspecified()),
            peer: task.peer,
            stats: task.stats.clone(),
            cancel: task.cancel.clone(),
        };
        self.writer = Some(tokio::spawn(writer.run()));
        self.tunnel_deadline = None;
        task.inner.set_state(task.id, SecondaryState::Established);
        log::debug!("{} established", task.peer_name);
    }
}

fn unspecified() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
}

/// Drains a secondary's send queue in batches.
struct Writer {
    send: Box<dyn SendHalf>,
    queue: tachyonix::Receiver<Outgoing>,
    inner: Arc<MasterInner>,
    kind: TransportKind,
    local: SocketAddr,
    peer: SocketAddr,
    stats: [Arc<Stats>; 2],
    cancel: CancellationToken,
}

impl Writer {
    async fn run(mut self) -> Result<()> {
        let rs = self.pump().await;
        if rs.is_err() {
            self.stats.iter().for_each(|s| s.on_send_error());
            self.cancel.cancel();
        }
        rs
    }

    async fn pump(&mut self) -> Result<()> {
        let mut batch = Vec::with_capacity(WRITE_BATCH);
        loop {
            let item = tokio::select! {
                biased;
                item = self.queue.recv() => item.ok(),
                _ = self.cancel.cancelled() => None,
            };
            let Some(item) = item else {
                break;
            };
            batch.push(item);
            self.collect(&mut batch);
            if !self.write(&mut batch).await? {
                return Ok(());
            }
        }
        // closing: flush what is still queued
        loop {
            self.collect(&mut batch);
            if batch.is_empty() {
                break;
            }
            if !self.write(&mut batch).await? {
                return Ok(());
            }
        }
        if let Err(e) = self.send.shutdown(Shutdown::Write).await {
            log::debug!("{} shutdown,{e:?}", self.peer);
        }
        Ok(())
    }

    fn collect(&mut self, batch: &mut Vec<Outgoing>) {
        while batch.len() < WRITE_BATCH {
            match self.queue.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
    }

    /// Writes a batch in order. Returns `false` once the write side is shut.
    async fn write(&mut self, batch: &mut Vec<Outgoing>) -> Result<bool> {
        let mut msgs = Vec::with_capacity(batch.len());
        for item in batch.drain(..) {
            match item {
                Outgoing::Message(msg) => msgs.push(msg),
                Outgoing::Ping => {
                    self.flush(&mut msgs).await?;
                    self.send.ping().await?;
                }
                Outgoing::Pong => {
                    self.flush(&mut msgs).await?;
                    self.send.pong().await?;
                }
                Outgoing::ShutdownWrite => {
                    self.flush(&mut msgs).await?;
                    self.send.shutdown(Shutdown::Write).await?;
                    return Ok(false);
                }
                Outgoing::Flush(done) => {
                    self.flush(&mut msgs).await?;
                    let _ = done.send(());
                }
            }
        }
        self.flush(&mut msgs).await?;
        Ok(true)
    }

    async fn flush(&mut self, msgs: &mut Vec<Bytes>) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        self.send.send(msgs).await?;
        for msg in msgs.drain(..) {
            self.stats.iter().for_each(|s| s.on_sent(msg.len()));
            self.inner
                .trace(Traffic::Sent, self.kind, self.local, self.peer, &msg);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Target {
    /// A datagram primary, optionally bound to the peer replies go to.
    Primary { id: Handle, peer: Option<SocketAddr> },
    Secondary(Handle),
}

/// A reference to a primary or secondary transport.
///
/// Handles to a secondary keep it from being destroyed after it closes, so
/// its statistics and identity stay readable. Operations on a transport
/// that is gone fail with [`ErrorCode::Closed`] or return `None`.
pub struct Tport {
    master: Weak<MasterInner>,
    target: Target,
}

impl Tport {
    /// Wraps a target whose reference has already been counted.
    fn new(master: Weak<MasterInner>, target: Target) -> Tport {
        Tport { master, target }
    }

    fn inner(&self) -> Result<Arc<MasterInner>> {
        self.master.upgrade().ok_or(Error::Closed)
    }

    fn with_secondary<R>(&self, f: impl FnOnce(&mut SecondaryEntry) -> R) -> Option<R> {
        let Target::Secondary(id) = self.target else {
            return None;
        };
        self.master.upgrade()?.with_secondary(id, f)
    }

    fn with_primary<R>(&self, f: impl FnOnce(&PrimaryEntry) -> R) -> Option<R> {
        let Target::Primary { id, .. } = self.target else {
            return None;
        };
        let inner = self.master.upgrade()?;
        let tree = inner.tree.lock();
        tree.primaries.get(id).map(f)
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.target, Target::Primary { .. })
    }

    pub fn is_secondary(&self) -> bool {
        matches!(self.target, Target::Secondary(_))
    }

    pub fn kind(&self) -> Option<TransportKind> {
        self.with_primary(|p| p.kind)
            .or_else(|| self.with_secondary(|s| s.kind))
    }

    /// The primary's bound name, or the peer name of a secondary.
    pub fn name(&self) -> Option<TransportName> {
        self.with_primary(|p| p.name.clone())
            .or_else(|| self.with_secondary(|s| s.peer_name.clone()))
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.with_primary(|p| p.local)
            .or_else(|| self.with_secondary(|s| s.local).flatten())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self.target {
            Target::Primary { peer, .. } => peer,
            Target::Secondary(_) => self.with_secondary(|s| s.peer),
        }
    }

    /// Public address learned through STUN, for a primary.
    pub fn public(&self) -> Option<SocketAddr> {
        self.with_primary(|p| p.public).flatten()
    }

    /// For a secondary, whether it finished its handshake and was accepted.
    /// For a primary, whether it is still bound.
    pub fn is_connected(&self) -> bool {
        match self.target {
            Target::Primary { .. } => self.with_primary(|_| ()).is_some(),
            Target::Secondary(_) => self
                .with_secondary(|s| s.state == SecondaryState::Established)
                .unwrap_or(false),
        }
    }

    pub fn state(&self) -> Option<SecondaryState> {
        self.with_secondary(|s| s.state)
    }

    pub fn tls_state(&self) -> Option<TlsState> {
        self.with_secondary(|s| s.tls_state).flatten()
    }

    pub fn identity(&self) -> Option<PeerIdentity> {
        self.with_secondary(|s| s.identity.clone())
    }

    pub fn is_reusable(&self) -> bool {
        self.with_secondary(|s| s.reusable).unwrap_or(false)
    }

    /// Excludes (or re-admits) an open secondary from connection reuse.
    pub fn set_reusable(&self, reusable: bool) {
        self.with_secondary(|s| {
            if s.state != SecondaryState::Closed && !s.write_closed {
                s.reusable = reusable;
            }
        });
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.with_primary(|p| p.stats.snapshot())
            .or_else(|| self.with_secondary(|s| s.stats.snapshot()))
    }

    pub fn params(&self) -> Option<TimerParams> {
        self.with_secondary(|s| *s.params.borrow())
    }

    /// Replaces the timer settings of a live secondary.
    pub fn set_params(&self, params: TimerParams) -> Result<()> {
        if params.pingpong.is_some() && params.keepalive.is_none() {
            return Err(Error::Config("pingpong needs a keepalive interval".into()));
        }
        self.with_secondary(|s| {
            s.params.send_replace(params);
        })
        .ok_or(Error::Closed)
    }

    /// Queues `msg`. On a secondary this only fails when the transport is
    /// closed or its queue is full; on a datagram primary the datagram is
    /// sent to the peer this handle was created for.
    pub async fn send(&self, msg: impl Into<Bytes>) -> Result<()> {
        let inner = self.inner()?;
        match self.target {
            Target::Secondary(id) => inner.enqueue(id, Outgoing::Message(msg.into())),
            Target::Primary { id, peer: Some(peer) } => inner.send_datagram(id, msg.into(), peer).await,
            Target::Primary { peer: None, .. } => {
                Err(Error::NotSupported("send on a primary without a peer"))
            }
        }
    }

    /// Waits until everything queued before this call has been written.
    /// Fails with [`ErrorCode::Closed`] when the secondary closes first.
    pub async fn flush(&self) -> Result<()> {
        let Target::Secondary(id) = self.target else {
            self.inner()?;
            return Ok(());
        };
        let cancel = self.with_secondary(|s| s.cancel.clone()).ok_or(Error::Closed)?;
        let (done, written) = oneshot::channel();
        self.inner()?.enqueue(id, Outgoing::Flush(done))?;
        tokio::select! {
            biased;
            rs = written => rs.map_err(|_| Error::Closed),
            _ = cancel.cancelled() => Err(Error::Closed),
        }
    }

    /// Sends one keepalive now: a ping on a secondary, a STUN keepalive on a
    /// datagram primary.
    pub fn keepalive(&self) -> Result<()> {
        let inner = self.inner()?;
        match self.target {
            Target::Secondary(id) => inner.enqueue(id, Outgoing::Ping),
            Target::Primary { id, peer: Some(peer) } => inner.keepalive_datagram(id, peer),
            Target::Primary { peer: None, .. } => {
                Err(Error::NotSupported("keepalive on a primary without a peer"))
            }
        }
    }

    /// `Write` flushes the queue and half-closes the connection; `Read` and
    /// `Both` close it.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let inner = self.inner()?;
        match (self.target, how) {
            (Target::Secondary(id), Shutdown::Write) => inner.shutdown_write(id),
            _ => {
                self.close();
                Ok(())
            }
        }
    }

    /// Closes the transport. Idempotent. Closing a primary closes every
    /// secondary under it.
    pub fn close(&self) {
        let Some(inner) = self.master.upgrade() else {
            return;
        };
        match self.target {
            Target::Secondary(id) => inner.close_secondary(id),
            Target::Primary { id, .. } => inner.close_primary(id),
        }
    }
}

impl Clone for Tport {
    fn clone(&self) -> Self {
        if let (Target::Secondary(id), Some(inner)) = (self.target, self.master.upgrade()) {
            inner.tree.lock().acquire(id);
        }
        Tport::new(self.master.clone(), self.target)
    }
}

impl Drop for Tport {
    fn drop(&mut self) {
        if let (Target::Secondary(id), Some(inner)) = (self.target, self.master.upgrade()) {
            inner.release(id);
        }
    }
}

impl PartialEq for Tport {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.master, &other.master) && self.target == other.target
    }
}

impl Eq for Tport {}

impl fmt::Debug for Tport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Target::Primary { id, peer } => f
                .debug_struct("Tport")
                .field("primary", &id)
                .field("peer", &peer)
                .finish(),
            Target::Secondary(id) => f.debug_struct("Tport").field("secondary", &id).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Diagnostics;
    use crate::stack::{ChannelStack, StackEvent};
    use rust_tport_core::stun::{DatagramSink, StunCallback, StunClient};
    use rust_tport_core::tls::{TlsConfig, VerifyPolicy};
    use rust_tport_core::udp::PoolConfig;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(5);

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn name(s: &str) -> TransportName {
        s.parse().unwrap()
    }

    fn sip(n: usize) -> Bytes {
        Bytes::from(format!(
            "OPTIONS sip:{n}@example.org SIP/2.0\r\nCSeq: {n} OPTIONS\r\nContent-Length: 0\r\n\r\n"
        ))
    }

    fn master(config: TportConfig) -> (Master, flume::Receiver<StackEvent>) {
        let (stack, events) = ChannelStack::new();
        (Master::new(config, Arc::new(stack)).unwrap(), events)
    }

    async fn event(events: &flume::Receiver<StackEvent>) -> StackEvent {
        tokio::time::timeout(WAIT, events.recv_async())
            .await
            .expect("no stack event")
            .unwrap()
    }

    async fn message(events: &flume::Receiver<StackEvent>) -> IncomingMessage {
        loop {
            if let StackEvent::Message(msg) = event(events).await {
                return msg;
            }
        }
    }

    async fn error(events: &flume::Receiver<StackEvent>) -> (Error, Option<SocketAddr>) {
        loop {
            if let StackEvent::Error { error, peer } = event(events).await {
                return (error, peer);
            }
        }
    }

    async fn closed(events: &flume::Receiver<StackEvent>) -> SecondaryInfo {
        loop {
            if let StackEvent::Closed(info) = event(events).await {
                return info;
            }
        }
    }

    /// Asserts nothing but close notifications and errors arrive for a while.
    async fn no_message(events: &flume::Receiver<StackEvent>, quiet: Duration) {
        let deadline = tokio::time::Instant::now() + quiet;
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv_async()).await {
            if let StackEvent::Message(msg) = event {
                panic!("unexpected message {:?}", msg.payload);
            }
        }
    }

    async fn listen(master: &Master, proto: &str, config: BindConfig) -> SocketAddr {
        let primary = master
            .bind(&name(&format!("{proto}:127.0.0.1:0")), config)
            .await
            .unwrap();
        primary.local().unwrap()
    }

    struct TestCert {
        der: CertificateDer<'static>,
        key: PrivateKeyDer<'static>,
    }

    fn self_signed(names: &[&str]) -> TestCert {
        let key = rcgen::KeyPair::generate().unwrap();
        let params =
            rcgen::CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert = params.self_signed(&key).unwrap();
        TestCert {
            der: cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(key.serialize_der().into()),
        }
    }

    #[tokio::test]
    async fn udp_round_trip() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let (client, client_events) = master(TportConfig::default());
        let server_addr = listen(&server, "udp", BindConfig::default()).await;
        let client_addr = listen(&client, "udp", BindConfig::default()).await;

        let tport = client
            .send(&name(&format!("udp:{server_addr}")), sip(1))
            .await
            .unwrap();
        assert!(tport.is_primary());
        assert_eq!(tport.peer(), Some(server_addr));

        let msg = message(&server_events).await;
        assert_eq!(msg.payload, sip(1));
        assert_eq!(msg.from, client_addr);
        assert_eq!(msg.kind, TransportKind::Udp);
        msg.tport.send(sip(2)).await.unwrap();

        let reply = message(&client_events).await;
        assert_eq!(reply.payload, sip(2));
        assert_eq!(reply.from, server_addr);
        assert_eq!(client.primaries()[0].kind, TransportKind::Udp);
        assert_eq!(tport.stats().unwrap().msgs_sent, 1);
    }

    #[tokio::test]
    async fn tcp_reuse_and_ordering() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let (client, client_events) = master(TportConfig::default());
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        listen(&client, "tcp", BindConfig::default()).await;
        let peer = name(&format!("tcp:{server_addr}"));

        let a = client.connect(&peer).await.unwrap();
        let b = client.connect(&peer).await.unwrap();
        assert_eq!(a, b);
        let fresh = client.connect_fresh(&peer).await.unwrap();
        assert_ne!(a, fresh);
        fresh.close();
        assert!(client.by_name(&peer).is_some());

        for n in 0..20 {
            a.send(sip(n)).await.unwrap();
        }
        for n in 0..20 {
            let msg = message(&server_events).await;
            assert_eq!(msg.payload, sip(n));
            if n == 19 {
                msg.tport.send(sip(100)).await.unwrap();
            }
        }
        let reply = message(&client_events).await;
        assert_eq!(reply.payload, sip(100));
        assert_eq!(reply.tport, a);
        assert!(a.is_connected());
        assert_eq!(a.stats().unwrap().msgs_sent, 20);

        a.set_reusable(false);
        let c = client.connect(&peer).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn close_flushes_and_is_idempotent() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let (client, client_events) = master(TportConfig::default());
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        listen(&client, "tcp", BindConfig::default()).await;

        let tport = client
            .send(&name(&format!("tcp:{server_addr}")), sip(1))
            .await
            .unwrap();
        assert_eq!(message(&server_events).await.payload, sip(1));

        tport.send(sip(2)).await.unwrap();
        tport.close();
        tport.close();
        assert_eq!(
            tport.send(sip(3)).await.unwrap_err().code(),
            ErrorCode::Closed
        );
        assert_eq!(message(&server_events).await.payload, sip(2));

        let info = closed(&client_events).await;
        assert_eq!(info.direction, Direction::Outgoing);
        assert_eq!(info.stats.msgs_sent, 2);
        assert_eq!(tport.state(), Some(SecondaryState::Closed));
        assert!(!tport.is_connected());
        assert_eq!(closed(&server_events).await.direction, Direction::Incoming);
    }

    #[tokio::test]
    async fn full_queue_fails_send() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let (client, _client_events) = master(TportConfig::default().set_queue_size(2));
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        listen(&client, "tcp", BindConfig::default()).await;

        // nothing leaves before the connection task first runs
        let tport = client.connect(&name(&format!("tcp:{server_addr}"))).await.unwrap();
        tport.send(sip(1)).await.unwrap();
        tport.send(sip(2)).await.unwrap();
        assert_eq!(
            tport.send(sip(3)).await.unwrap_err().code(),
            ErrorCode::QueueFull
        );
        assert_eq!(message(&server_events).await.payload, sip(1));
        assert_eq!(message(&server_events).await.payload, sip(2));
    }

    #[tokio::test]
    async fn tls_subject_mismatch_is_rejected() {
        init_log();
        let cert = self_signed(&["other.example.org"]);
        let (server, server_events) = master(TportConfig::default());
        let server_addr = listen(
            &server,
            "tls",
            BindConfig::default().set_tls(
                TlsConfig::default().set_identity(vec![cert.der.clone()], cert.key.clone_key()),
            ),
        )
        .await;
        let peer = name(&format!("tls:{server_addr}"));

        let (strict, strict_events) = master(TportConfig::default());
        listen(
            &strict,
            "tls",
            BindConfig::default().set_tls(
                TlsConfig::default()
                    .add_root(cert.der.clone())
                    .set_policy(VerifyPolicy::SUBJECTS_OUT),
            ),
        )
        .await;
        let tport = strict.send(&peer, sip(1)).await.unwrap();
        let (e, at) = error(&strict_events).await;
        assert_eq!(e.code(), ErrorCode::CertRejected);
        assert_eq!(at, Some(server_addr));
        assert!(!tport.is_connected());
        no_message(&server_events, Duration::from_millis(300)).await;

        let (lenient, lenient_events) = master(TportConfig::default());
        listen(
            &lenient,
            "tls",
            BindConfig::default().set_tls(
                TlsConfig::default()
                    .add_root(cert.der.clone())
                    .set_policy(VerifyPolicy::OUTGOING),
            ),
        )
        .await;
        let tport = lenient.send(&peer, sip(2)).await.unwrap();
        let msg = message(&server_events).await;
        assert_eq!(msg.payload, sip(2));
        assert!(msg.provenance.secure);
        assert!(!msg.provenance.verified);
        msg.tport.send(sip(3)).await.unwrap();

        let reply = message(&lenient_events).await;
        assert_eq!(reply.payload, sip(3));
        assert!(reply.provenance.verified);
        assert!(reply
            .provenance
            .subjects
            .iter()
            .any(|s| s == "other.example.org"));
        assert!(tport.is_connected());
        assert!(tport.identity().unwrap().verified);
    }

    #[tokio::test]
    async fn tls_incoming_verification_needs_a_client_certificate() {
        init_log();
        let cert = self_signed(&["sip.example.org"]);
        let (server, server_events) = master(TportConfig::default());
        let server_addr = listen(
            &server,
            "tls",
            BindConfig::default().set_tls(
                TlsConfig::default()
                    .set_identity(vec![cert.der.clone()], cert.key.clone_key())
                    .add_root(cert.der.clone())
                    .set_policy(VerifyPolicy::INCOMING),
            ),
        )
        .await;

        let (client, _client_events) = master(TportConfig::default());
        listen(&client, "tls", BindConfig::default().set_tls(TlsConfig::default())).await;
        client
            .send(&name(&format!("tls:{server_addr}")), sip(1))
            .await
            .unwrap();

        let (e, peer) = error(&server_events).await;
        assert_eq!(e.code(), ErrorCode::CertRejected);
        assert!(peer.is_some());
        let info = closed(&server_events).await;
        assert_eq!(info.direction, Direction::Incoming);
        assert_eq!(info.stats.msgs_recv, 0);
    }

    async fn fake_proxy(status: &'static str) -> (SocketAddr, JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            stream
                .write_all(format!("HTTP/1.1 {status}\r\n\r\n").as_bytes())
                .await
                .unwrap();
            if status.starts_with("200") {
                // play the far end and echo
                let mut buf = vec![0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
            String::from_utf8(head).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn proxy_tunnel_refused() {
        init_log();
        let (proxy, request) = fake_proxy("407 Proxy Authentication Required").await;
        let (client, events) = master(TportConfig::default());
        listen(
            &client,
            "tcp",
            BindConfig::default().set_proxy(format!("http://{proxy}")),
        )
        .await;
        let tport = client
            .send(&name("tcp:sip.example.org:5060"), sip(1))
            .await
            .unwrap();
        let (e, _) = error(&events).await;
        assert_eq!(e.code(), ErrorCode::Protocol);
        closed(&events).await;
        assert!(!tport.is_connected());
        assert!(request
            .await
            .unwrap()
            .starts_with("CONNECT sip.example.org:5060 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn proxy_tunnel_opened() {
        init_log();
        let (proxy, _request) = fake_proxy("200 Connection established").await;
        let (client, events) = master(TportConfig::default());
        listen(
            &client,
            "tcp",
            BindConfig::default().set_proxy(proxy.to_string()),
        )
        .await;
        let tport = client
            .send(&name("tcp:sip.example.org:5060"), sip(1))
            .await
            .unwrap();
        let echoed = message(&events).await;
        assert_eq!(echoed.payload, sip(1));
        assert_eq!(echoed.kind, TransportKind::Connect);
        assert!(tport.is_connected());
    }

    #[tokio::test]
    async fn websocket_round_trip() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let (client, client_events) = master(TportConfig::default());
        let server_addr = listen(&server, "ws", BindConfig::default()).await;
        listen(&client, "ws", BindConfig::default()).await;

        let tport = client
            .send(&name(&format!("ws:{server_addr}")), sip(1))
            .await
            .unwrap();
        let msg = message(&server_events).await;
        assert_eq!(msg.payload, sip(1));
        assert_eq!(msg.kind, TransportKind::Ws);
        msg.tport.send(sip(2)).await.unwrap();
        assert_eq!(message(&client_events).await.payload, sip(2));
        assert!(tport.is_connected());
    }

    #[tokio::test]
    async fn pooled_udp_delivers_everything() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let (client, client_events) = master(TportConfig::default());
        let server_addr = listen(
            &server,
            "udp",
            BindConfig::default().set_pool(PoolConfig::default().set_threads(3)),
        )
        .await;
        listen(&client, "udp", BindConfig::default()).await;
        let peer = name(&format!("udp:{server_addr}"));

        for n in 0..50 {
            client.send(&peer, sip(n)).await.unwrap();
        }
        let mut seen = std::collections::BTreeSet::new();
        let mut last = None;
        for _ in 0..50 {
            let msg = message(&server_events).await;
            seen.insert(msg.payload.clone());
            last = Some(msg);
        }
        assert_eq!(seen.len(), 50);
        last.unwrap().tport.send(sip(99)).await.unwrap();
        assert_eq!(message(&client_events).await.payload, sip(99));
    }

    struct FakeStun {
        public: SocketAddr,
        responses: flume::Sender<Vec<u8>>,
    }

    impl StunClient for FakeStun {
        fn bind(&self, _local: SocketAddr, _sink: Arc<dyn DatagramSink>, done: StunCallback) -> Result<()> {
            done(StunOutcome::Discovered(self.public));
            Ok(())
        }
        fn keepalive(
            &self,
            _local: SocketAddr,
            _peer: SocketAddr,
            _sink: Arc<dyn DatagramSink>,
            done: StunCallback,
        ) -> Result<()> {
            done(StunOutcome::TimedOut);
            Ok(())
        }
        fn process_response(&self, datagram: &[u8], _from: SocketAddr) {
            let _ = self.responses.send(datagram.to_vec());
        }
    }

    #[tokio::test]
    async fn stun_outcomes_update_the_public_address() {
        init_log();
        let public: SocketAddr = "192.0.2.7:40000".parse().unwrap();
        let (responses, seen) = flume::unbounded();
        let stun = Arc::new(FakeStun { public, responses });
        let (server, events) = master(TportConfig::default());
        let local = listen(&server, "udp", BindConfig::default().set_stun(stun)).await;

        match event(&events).await {
            StackEvent::AddressChanged(info) => {
                assert_eq!(info.kind, TransportKind::StunUdp);
                assert_eq!(info.public, Some(public));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.primaries()[0].public, Some(public));

        // a binding response goes to the STUN engine, not the stack
        let mut response = vec![0x01, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42];
        response.extend_from_slice(&[7u8; 12]);
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&response, local).await.unwrap();
        socket.send_to(&sip(1), local).await.unwrap();
        assert_eq!(message(&events).await.payload, sip(1));
        assert_eq!(seen.recv_async().await.unwrap(), response);

        let tport = server.connect(&name("udp:192.0.2.1:3478")).await.unwrap();
        tport.keepalive().unwrap();
        let (e, _) = error(&events).await;
        assert_eq!(e.code(), ErrorCode::Timeout);
        match event(&events).await {
            StackEvent::AddressChanged(info) => assert_eq!(info.public, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn silent_peer() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn missing_pong_times_out() {
        init_log();
        let peer = silent_peer().await;
        let (client, events) = master(
            TportConfig::default()
                .set_keepalive(Duration::from_millis(100))
                .set_pingpong(Duration::from_millis(200)),
        );
        listen(&client, "tcp", BindConfig::default()).await;
        let tport = client.connect(&name(&format!("tcp:{peer}"))).await.unwrap();
        let (e, at) = error(&events).await;
        assert_eq!(e.code(), ErrorCode::Timeout);
        assert_eq!(at, Some(peer));
        closed(&events).await;
        assert_eq!(tport.state(), Some(SecondaryState::Closed));
    }

    #[tokio::test]
    async fn pong_answers_keep_the_connection() {
        init_log();
        let (server, _server_events) = master(TportConfig::default().set_pong2ping(true));
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let (client, events) = master(
            TportConfig::default()
                .set_keepalive(Duration::from_millis(100))
                .set_pingpong(Duration::from_millis(200)),
        );
        listen(&client, "tcp", BindConfig::default()).await;
        let tport = client
            .connect(&name(&format!("tcp:{server_addr}")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(tport.is_connected());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn pings_do_not_defeat_the_idle_timeout() {
        init_log();
        let (server, _server_events) = master(TportConfig::default().set_pong2ping(true));
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let (client, events) = master(
            TportConfig::default()
                .set_keepalive(Duration::from_millis(100))
                .set_idle(Duration::from_millis(400)),
        );
        listen(&client, "tcp", BindConfig::default()).await;
        let tport = client
            .connect(&name(&format!("tcp:{server_addr}")))
            .await
            .unwrap();
        let started = Instant::now();
        let info = closed(&events).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(info.state, SecondaryState::Closed);
        assert!(client.by_name(&tport.name().unwrap()).is_none());
    }

    #[tokio::test]
    async fn params_apply_to_one_secondary() {
        init_log();
        let (server, _server_events) = master(TportConfig::default());
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let (client, events) = master(TportConfig::default());
        listen(&client, "tcp", BindConfig::default()).await;
        let peer = name(&format!("tcp:{server_addr}"));
        let tport = client.connect(&peer).await.unwrap();
        let other = client.connect_fresh(&peer).await.unwrap();

        assert!(tport
            .set_params(TimerParams::default().set_pingpong(Some(Duration::from_secs(1))))
            .is_err());
        tport
            .set_params(TimerParams::default().set_idle(Some(Duration::from_millis(200))))
            .unwrap();
        assert_eq!(tport.params().unwrap().idle, Some(Duration::from_millis(200)));
        closed(&events).await;
        assert_eq!(tport.state(), Some(SecondaryState::Closed));
        assert!(other.is_connected());
    }

    #[tokio::test]
    async fn incomplete_message_times_out() {
        init_log();
        let (server, events) = master(
            TportConfig::default().set_incomplete_timeout(Some(Duration::from_millis(200))),
        );
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let mut stream = tokio::net::TcpStream::connect(server_addr).await.unwrap();
        stream
            .write_all(b"OPTIONS sip:x SIP/2.0\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        let (e, peer) = error(&events).await;
        assert_eq!(e.code(), ErrorCode::Protocol);
        assert_eq!(peer, Some(stream.local_addr().unwrap()));
        closed(&events).await;
    }

    #[tokio::test]
    async fn write_shutdown_half_closes() {
        init_log();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _events) = master(TportConfig::default());
        listen(&client, "tcp", BindConfig::default()).await;
        let tport = client
            .send(&name(&format!("tcp:{addr}")), sip(1))
            .await
            .unwrap();
        tport.shutdown(Shutdown::Write).unwrap();
        assert_eq!(
            tport.send(sip(2)).await.unwrap_err().code(),
            ErrorCode::Closed
        );
        assert!(!tport.is_reusable());

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, sip(1));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        init_log();
        let (server, _server_events) = master(TportConfig::default());
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let (client, events) = master(TportConfig::default());
        let primary = client
            .bind(&name("tcp:127.0.0.1:0"), BindConfig::default())
            .await
            .unwrap();
        let tport = client
            .connect(&name(&format!("tcp:{server_addr}")))
            .await
            .unwrap();
        client.shutdown().await;
        assert!(client.primaries().is_empty());
        assert!(!primary.is_connected());
        assert_eq!(
            tport.send(sip(1)).await.unwrap_err().code(),
            ErrorCode::Closed
        );
        closed(&events).await;
        assert!(client
            .connect(&name(&format!("tcp:{server_addr}")))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn bind_failures_leave_nothing_behind() {
        init_log();
        let (server, _events) = master(TportConfig::default());
        let addr = listen(&server, "tcp", BindConfig::default()).await;
        let taken = server
            .bind(&name(&format!("tcp:{addr}")), BindConfig::default())
            .await
            .unwrap_err();
        assert_eq!(taken.code(), ErrorCode::Setup);
        assert!(server
            .bind(&name("tls:127.0.0.1:0"), BindConfig::default())
            .await
            .is_err());
        assert!(server
            .bind(&name("foo:127.0.0.1:0"), BindConfig::default())
            .await
            .is_err());
        assert_eq!(server.primaries().len(), 1);
    }

    #[tokio::test]
    async fn idents_select_primaries() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let server_addr = listen(&server, "udp", BindConfig::default()).await;
        let (client, _events) = master(TportConfig::default());
        listen(&client, "udp", BindConfig::default()).await;
        let tagged = listen(&client, "udp", BindConfig::default().set_ident("edge")).await;

        let peer = name(&format!("udp:{server_addr}"));
        client.send(&peer.clone().with_ident("edge"), sip(1)).await.unwrap();
        assert_eq!(message(&server_events).await.from, tagged);
        client.send(&peer, sip(2)).await.unwrap();
        assert_ne!(message(&server_events).await.from, tagged);
        assert!(client
            .connect(&peer.with_ident("core"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn dump_file_records_traffic() {
        init_log();
        let path = std::env::temp_dir().join(format!("tport-dump-{}.txt", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let (server, events) = master(
            TportConfig::default().set_diagnostics(Diagnostics::default().set_dump(&path)),
        );
        let server_addr = listen(&server, "udp", BindConfig::default()).await;
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&sip(7), server_addr).await.unwrap();
        message(&events).await;
        let dump = std::fs::read_to_string(&path).unwrap();
        assert!(dump.starts_with("recv "));
        assert!(dump.contains("OPTIONS sip:7@example.org"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn oversized_stream_message_is_a_protocol_error() {
        init_log();
        let (server, events) = master(TportConfig::default().set_max_message(256));
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let (client, _client_events) = master(TportConfig::default());
        listen(&client, "tcp", BindConfig::default()).await;
        let big = Bytes::from(format!(
            "MESSAGE sip:a SIP/2.0\r\nContent-Length: 1024\r\n\r\n{}",
            "x".repeat(1024)
        ));
        client
            .send(&name(&format!("tcp:{server_addr}")), big)
            .await
            .unwrap();
        let (e, _) = error(&events).await;
        assert_eq!(e.code(), ErrorCode::Protocol);
        closed(&events).await;
        no_message(&events, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn environment_fills_unset_diagnostics() {
        init_log();
        let path = std::env::temp_dir().join(format!("tport-env-dump-{}.txt", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let env_path = path.to_string_lossy().into_owned();
        let (stack, events) = ChannelStack::new();
        let server = Master::with_env(TportConfig::default(), Arc::new(stack), |key| {
            (key == "TPORT_DUMP").then(|| env_path.clone())
        })
        .unwrap();
        assert_eq!(server.config().diagnostics.dump.as_deref(), Some(path.as_path()));
        let server_addr = listen(&server, "udp", BindConfig::default()).await;
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&sip(3), server_addr).await.unwrap();
        message(&events).await;
        let dump = std::fs::read_to_string(&path).unwrap();
        assert!(dump.contains("OPTIONS sip:3@example.org"));
        let _ = std::fs::remove_file(&path);

        let (stack, _events) = ChannelStack::new();
        let own = Diagnostics::default().set_dump("/nonexistent/own.dump");
        let other = Master::with_env(
            TportConfig::default().set_diagnostics(own),
            Arc::new(stack),
            |key| (key == "TPORT_DUMP").then(|| "/tmp/env.dump".to_string()),
        )
        .unwrap();
        assert_eq!(
            other.config().diagnostics.dump.as_deref(),
            Some(std::path::Path::new("/nonexistent/own.dump"))
        );
    }

    #[tokio::test]
    async fn primary_without_reuse_connects_every_time() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let (client, _client_events) = master(TportConfig::default());
        listen(&client, "tcp", BindConfig::default().set_reuse(false)).await;
        let peer = name(&format!("tcp:{server_addr}"));

        let a = client.connect(&peer).await.unwrap();
        let b = client.connect(&peer).await.unwrap();
        assert_ne!(a, b);
        a.send(sip(1)).await.unwrap();
        b.send(sip(2)).await.unwrap();
        let first = message(&server_events).await;
        let second = message(&server_events).await;
        assert_ne!(first.from, second.from);
        let c = client.send(&peer, sip(3)).await.unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[tokio::test]
    async fn flush_waits_for_queued_messages() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let (client, _client_events) = master(TportConfig::default());
        let primary = client
            .bind(&name("tcp:127.0.0.1:0"), BindConfig::default())
            .await
            .unwrap();
        primary.flush().await.unwrap();

        let tport = client
            .connect(&name(&format!("tcp:{server_addr}")))
            .await
            .unwrap();
        for n in 0..10 {
            tport.send(sip(n)).await.unwrap();
        }
        tport.flush().await.unwrap();
        assert_eq!(tport.stats().unwrap().msgs_sent, 10);
        for n in 0..10 {
            assert_eq!(message(&server_events).await.payload, sip(n));
        }
        tport.close();
        assert_eq!(tport.flush().await.unwrap_err().code(), ErrorCode::Closed);
    }

    #[tokio::test]
    async fn idle_period_restarts_at_the_last_send() {
        init_log();
        let (server, server_events) = master(TportConfig::default());
        let server_addr = listen(&server, "tcp", BindConfig::default()).await;
        let (client, events) = master(TportConfig::default().set_idle(Duration::from_millis(600)));
        listen(&client, "tcp", BindConfig::default()).await;
        let tport = client
            .connect(&name(&format!("tcp:{server_addr}")))
            .await
            .unwrap();
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tport.send(sip(1)).await.unwrap();
        tport.flush().await.unwrap();
        let sent = Instant::now();
        assert_eq!(message(&server_events).await.payload, sip(1));
        closed(&events).await;
        assert!(sent.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(1100));
    }

    #[test]
    fn first_line_is_trimmed() {
        assert_eq!(first_line(b"INVITE sip:a SIP/2.0\r\nVia: x"), "INVITE sip:a SIP/2.0");
        assert_eq!(first_line(b""), "");
    }
}
