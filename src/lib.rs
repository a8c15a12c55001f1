//! # rust-tport - A pluggable SIP transport layer
//!
//! `rust-tport` moves SIP messages over UDP, TCP, TLS, SCTP, WebSocket,
//! HTTP-CONNECT tunnels and STUN-aware UDP behind one interface. A [`Master`]
//! owns a tree of transports: one *primary* per bound address and protocol,
//! and below each connection-oriented primary the *secondaries*, one per
//! connection. Complete messages go up to a [`Stack`] together with the
//! transport they arrived on, so replies can be sent back the same way.
//!
//! ## Modules
//!
//! - [`master`] - The transport tree, connection tasks and [`Tport`] handles
//! - [`transport`] - One implementation per transport kind
//! - [`tree`] - Bookkeeping of primaries and secondaries, per-connection timers
//! - [`stack`] - The contract with the protocol stack above
//! - [`config`] - Master, primary and diagnostics settings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use rust_tport::{BindConfig, ChannelStack, Master, StackEvent, TportConfig};
//!
//! # async fn run() -> rust_tport::Result<()> {
//! let config = TportConfig::default()
//!     .set_idle(Duration::from_secs(300))
//!     .set_keepalive(Duration::from_secs(30));
//! let (stack, events) = ChannelStack::new();
//! let master = Master::new(config, Arc::new(stack))?;
//!
//! master.bind(&"udp:0.0.0.0:5060".parse()?, BindConfig::default()).await?;
//! master.bind(&"tcp:0.0.0.0:5060".parse()?, BindConfig::default()).await?;
//!
//! while let Ok(event) = events.recv_async().await {
//!     match event {
//!         StackEvent::Message(msg) => {
//!             // answer over the transport the request came in on
//!             msg.tport.send(msg.payload.clone()).await?;
//!         }
//!         StackEvent::Error { error, peer } => log::warn!("{peer:?}: {error}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Sending
//!
//! [`Master::send`] picks a primary matching the destination's protocol
//! (and ident, when the name carries one), reuses an open connection to the
//! same peer when reuse is enabled and queues the message. Messages queued on
//! one secondary are written in order; a full queue fails the send with
//! [`ErrorCode::QueueFull`] instead of waiting.
//!
//! ```rust,no_run
//! # async fn send(master: &rust_tport::Master) -> rust_tport::Result<()> {
//! let tport = master
//!     .send(&"tls:proxy.example.org:5061".parse()?, &b"OPTIONS ..."[..])
//!     .await?;
//! if let Some(identity) = tport.identity() {
//!     println!("peer names: {:?}", identity.subjects);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod master;
pub mod stack;
pub mod transport;
pub mod tree;

pub use config::{BindConfig, Diagnostics, TportConfig};
pub use master::{Master, Tport};
pub use stack::{ChannelStack, IncomingMessage, Provenance, Stack, StackEvent};
pub use tree::timer::TimerParams;

pub use rust_tport_core::error::{Error, ErrorCode, Result};
pub use rust_tport_core::name::{Direction, TransportKind, TransportName};
pub use rust_tport_core::tls::{TlsConfig, VerifyPolicy};
pub use rust_tport_core::udp::PoolConfig;
