//! Worker threads doing blocking UDP I/O on behalf of the async stack loop.
//!
//! All workers share one socket. A single read lock makes sure only one of
//! them receives at a time: it peeks two bytes, classifies the datagram and
//! then consumes it. Received datagrams cross over to the loop through an
//! unbounded channel, ordered per worker. Every datagram handed over carries
//! a [`DeliveryTicket`]; until the loop drops it the datagram counts against
//! the worker's undelivered queue. A worker whose queue exceeds
//! `queue_size` stops reading until the queue drains below half of that.
//!
//! Sends are queued to the worker with the fewest outstanding sends.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::udp::classify::{admit, DatagramClassifier, DatagramKind};
use crate::udp::dropper::PacketDropper;

pub const DEFAULT_THREADS: usize = 2;
pub const DEFAULT_QUEUE_SIZE: usize = 64;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const MAX_DATAGRAM: usize = 65535;

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub threads: usize,
    /// Undelivered datagrams a worker tolerates before it stops reading.
    /// Zero disables the limit.
    pub queue_size: usize,
    pub poll_interval: Duration,
    pub max_datagram: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            queue_size: DEFAULT_QUEUE_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_datagram: MAX_DATAGRAM,
        }
    }
}

impl PoolConfig {
    pub fn set_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
    pub fn set_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }
    pub fn set_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
    pub fn check(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::Config("thread pool needs at least one thread".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval cannot be 0".into()));
        }
        if self.max_datagram == 0 || self.max_datagram > MAX_DATAGRAM {
            return Err(Error::Config(format!(
                "max_datagram must be within 1..={MAX_DATAGRAM}"
            )));
        }
        Ok(())
    }
}

/// Picks the least loaded worker; ties go to the first one at or after
/// `start` in round-robin order.
pub fn pick_worker(loads: &[usize], start: usize) -> usize {
    let n = loads.len();
    let mut best = start % n;
    for offset in 1..n {
        let i = (start + offset) % n;
        if loads[i] < loads[best] {
            best = i;
        }
    }
    best
}

#[derive(Default, Debug)]
pub struct PoolStats {
    pub received: AtomicU64,
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
    pub send_errors: AtomicU64,
}

struct Outbound {
    payload: Bytes,
    to: SocketAddr,
}

struct WorkerShared {
    id: usize,
    pending: CachePadded<AtomicUsize>,
    queued: CachePadded<AtomicUsize>,
    reading: AtomicBool,
    sends: SegQueue<Outbound>,
    unparker: Unparker,
}

impl WorkerShared {
    /// Updates the read registration from the undelivered count.
    fn may_read(&self, threshold: usize) -> bool {
        if threshold == 0 {
            return true;
        }
        let pending = self.pending.load(Ordering::Acquire);
        if self.reading.load(Ordering::Acquire) {
            if pending > threshold {
                self.reading.store(false, Ordering::Release);
                log::debug!("udp worker {} yields with {pending} undelivered", self.id);
                return false;
            }
            true
        } else if pending * 2 < threshold {
            self.reading.store(true, Ordering::Release);
            log::debug!("udp worker {} resumes reading", self.id);
            true
        } else {
            false
        }
    }
}

/// Keeps a delivered datagram counted against its worker until dropped.
pub struct DeliveryTicket {
    worker: Arc<WorkerShared>,
}

impl DeliveryTicket {
    fn new(worker: Arc<WorkerShared>) -> Self {
        worker.pending.fetch_add(1, Ordering::AcqRel);
        Self { worker }
    }
}

impl Drop for DeliveryTicket {
    fn drop(&mut self) {
        self.worker.pending.fetch_sub(1, Ordering::AcqRel);
        self.worker.unparker.unpark();
    }
}

/// A datagram received by a worker.
pub struct PoolDelivery {
    pub kind: DatagramKind,
    pub payload: Bytes,
    pub from: SocketAddr,
    pub worker: usize,
    pub ticket: DeliveryTicket,
}

struct WorkerContext {
    socket: Arc<UdpSocket>,
    read_lock: Arc<Mutex<()>>,
    shutdown: Arc<AtomicBool>,
    classifier: Arc<dyn DatagramClassifier>,
    dropper: Arc<PacketDropper>,
    stats: Arc<PoolStats>,
    output: mpsc::UnboundedSender<PoolDelivery>,
    config: PoolConfig,
}

impl WorkerContext {
    fn run(self, worker: Arc<WorkerShared>, parker: Parker) {
        let mut scratch = vec![0u8; self.config.max_datagram];
        while !self.shutdown.load(Ordering::Acquire) {
            let sent = self.flush_sends(&worker);
            if worker.may_read(self.config.queue_size) {
                if let Some(_guard) = self.read_lock.try_lock() {
                    if let Err(e) = self.receive(&worker, &mut scratch) {
                        log::warn!("udp worker {} recv: {e:?}", worker.id);
                    }
                    continue;
                }
            }
            if sent == 0 {
                parker.park_timeout(self.config.poll_interval);
            }
        }
        log::debug!("udp worker {} stopped", worker.id);
    }

    fn flush_sends(&self, worker: &WorkerShared) -> usize {
        let mut sent = 0;
        while let Some(out) = worker.sends.pop() {
            worker.queued.fetch_sub(1, Ordering::AcqRel);
            sent += 1;
            if self.dropper.should_drop() {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.socket.send_to(&out.payload, out.to) {
                Ok(_) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    log::debug!("udp worker {} send to {}: {e:?}", worker.id, out.to);
                }
            }
        }
        sent
    }

    fn receive(&self, worker: &Arc<WorkerShared>, scratch: &mut [u8]) -> io::Result<()> {
        let mut head = [0u8; 2];
        let peeked = match self.socket.peek_from(&mut head) {
            Ok((n, _)) => n,
            Err(e) if is_timeout(&e) => return Ok(()),
            Err(e) if should_ignore_error(&e) => 0,
            Err(e) => return Err(e),
        };
        let kind = self.classifier.classify(&head[..peeked.min(2)]);
        let (len, from) = match self.socket.recv_from(scratch) {
            Ok(v) => v,
            Err(e) if is_timeout(&e) => return Ok(()),
            Err(e) if should_ignore_error(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        let datagram = Bytes::copy_from_slice(&scratch[..len]);
        let Some((kind, payload)) = admit(self.classifier.as_ref(), kind, datagram) else {
            return Ok(());
        };
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let delivery = PoolDelivery {
            kind,
            payload,
            from,
            worker: worker.id,
            ticket: DeliveryTicket::new(worker.clone()),
        };
        if self.output.send(delivery).is_err() {
            log::debug!("udp worker {}: delivery channel closed", worker.id);
            self.shutdown.store(true, Ordering::Release);
        }
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// ICMP-induced errors and truncation reports that say nothing about the socket itself.
fn should_ignore_error(e: &io::Error) -> bool {
    #[cfg(windows)]
    if matches!(e.raw_os_error(), Some(10040) | Some(10054)) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

pub struct ThreadPool {
    workers: Vec<Arc<WorkerShared>>,
    round_robin: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    local_addr: SocketAddr,
}

impl ThreadPool {
    /// Starts the workers on a blocking socket. Returns the pool and the
    /// receiving end of the delivery channel.
    pub fn spawn(
        socket: UdpSocket,
        config: PoolConfig,
        classifier: Arc<dyn DatagramClassifier>,
        dropper: Arc<PacketDropper>,
    ) -> Result<(ThreadPool, mpsc::UnboundedReceiver<PoolDelivery>)> {
        config.check()?;
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(config.poll_interval))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let (output, receiver) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let read_lock = Arc::new(Mutex::new(()));
        let stats = Arc::new(PoolStats::default());
        let mut workers = Vec::with_capacity(config.threads);
        let mut handles = Vec::with_capacity(config.threads);
        for id in 0..config.threads {
            let parker = Parker::new();
            let worker = Arc::new(WorkerShared {
                id,
                pending: CachePadded::new(AtomicUsize::new(0)),
                queued: CachePadded::new(AtomicUsize::new(0)),
                reading: AtomicBool::new(true),
                sends: SegQueue::new(),
                unparker: parker.unparker().clone(),
            });
            let context = WorkerContext {
                socket: socket.clone(),
                read_lock: read_lock.clone(),
                shutdown: shutdown.clone(),
                classifier: classifier.clone(),
                dropper: dropper.clone(),
                stats: stats.clone(),
                output: output.clone(),
                config: config.clone(),
            };
            let thread_worker = worker.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tport-udp-{id}"))
                .spawn(move || context.run(thread_worker, parker))?;
            workers.push(worker);
            handles.push(handle);
        }
        log::debug!("udp pool on {local_addr} started {} workers", config.threads);
        Ok((
            ThreadPool {
                workers,
                round_robin: AtomicUsize::new(0),
                shutdown,
                handles: Mutex::new(handles),
                stats,
                local_addr,
            },
            receiver,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    pub fn workers(&self) -> usize {
        self.workers.len()
    }
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
    /// Whether the worker currently has read readiness registered.
    pub fn is_reading(&self, worker: usize) -> bool {
        self.workers[worker].reading.load(Ordering::Acquire)
    }
    /// Datagrams handed to the loop but not yet released.
    pub fn pending(&self, worker: usize) -> usize {
        self.workers[worker].pending.load(Ordering::Acquire)
    }
    /// Sends queued to the worker and not yet written.
    pub fn queued(&self, worker: usize) -> usize {
        self.workers[worker].queued.load(Ordering::Acquire)
    }

    /// Queues a datagram to the least busy worker and returns its index.
    pub fn send(&self, payload: Bytes, to: SocketAddr) -> Result<usize> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let loads: Vec<usize> = self
            .workers
            .iter()
            .map(|w| w.queued.load(Ordering::Acquire))
            .collect();
        let start = self.round_robin.fetch_add(1, Ordering::Relaxed);
        let index = pick_worker(&loads, start);
        let worker = &self.workers[index];
        worker.queued.fetch_add(1, Ordering::AcqRel);
        worker.sends.push(Outbound { payload, to });
        worker.unparker.unpark();
        Ok(index)
    }

    /// Stops and joins the workers. Idempotent.
    pub fn shutdown(&self) {
        join_workers(self.stop());
    }

    /// Tells the workers to stop and hands back their threads without
    /// waiting. Later calls return nothing.
    pub fn stop(&self) -> Vec<JoinHandle<()>> {
        self.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.unparker.unpark();
        }
        std::mem::take(&mut *self.handles.lock())
    }
}

/// Blocks until every thread returned by [`ThreadPool::stop`] has exited.
pub fn join_workers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            log::error!("udp worker panicked");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
