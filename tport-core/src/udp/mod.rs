//! Datagram classification, simulated loss and the threaded UDP pool.

pub mod classify;
pub mod dropper;
pub mod pool;

pub use classify::{admit, DatagramClassifier, DatagramKind, DefaultClassifier};
pub use dropper::PacketDropper;
pub use pool::{DeliveryTicket, PoolConfig, PoolDelivery, ThreadPool};
