//! # rust-tport-core - Transport building blocks
//!
//! `rust-tport-core` holds the transport-independent pieces of the
//! `rust-tport` SIP transport layer: naming, errors, socket construction,
//! stream framing, the TLS engine, the threaded UDP delivery subsystem and
//! traffic diagnostics. The transport tree itself lives in `rust-tport`.
//!
//! ## Modules
//!
//! - [`name`] - Transport names (`proto/host:port`) and kinds
//! - [`error`] - The crate error type and normalized error codes
//! - [`socket`] - Listener and socket constructors with TOS and backlog
//! - [`framing`] - Cutting byte streams into messages
//! - [`tls`] - Handshake state machine and certificate verification
//! - [`udp`] - Datagram classification, simulated loss and the worker pool
//! - [`capture`] - HEP-style capture and the traffic dump file
//! - [`stun`] - The contract with an external STUN engine
//!
//! ## TLS verification
//!
//! ```rust,no_run
//! use rust_tport_core::tls::{TlsConfig, TlsEngine, VerifyPolicy};
//!
//! # fn main() -> rust_tport_core::error::Result<()> {
//! let config = TlsConfig::default()
//!     .set_cert_file("tport.pem")
//!     .set_key_file("tport.key")
//!     .set_ca_file("ca.pem")
//!     .set_policy(VerifyPolicy::SUBJECTS_IN)
//!     .set_subjects(vec!["*.example.org".to_string()]);
//! let engine = TlsEngine::new(&config)?;
//! assert!(engine.can_accept());
//! # Ok(())
//! # }
//! ```
//!
//! ## Threaded UDP
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rust_tport_core::udp::{DefaultClassifier, PacketDropper, PoolConfig, ThreadPool};
//!
//! # #[tokio::main]
//! # async fn main() -> rust_tport_core::error::Result<()> {
//! let socket = std::net::UdpSocket::bind("0.0.0.0:5060")?;
//! let (pool, mut deliveries) = ThreadPool::spawn(
//!     socket,
//!     PoolConfig::default().set_threads(4),
//!     Arc::new(DefaultClassifier),
//!     Arc::new(PacketDropper::new(0.0)?),
//! )?;
//! while let Some(delivery) = deliveries.recv().await {
//!     // dropping the ticket releases the worker's queue slot
//!     drop(delivery.ticket);
//! }
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod error;
pub mod framing;
pub mod name;
pub mod socket;
pub mod stun;
pub mod tls;
pub mod udp;
