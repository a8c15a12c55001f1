//! TLS connection establishment and peer verification.

pub mod config;
pub mod engine;
pub mod verify;

pub use config::{ProtocolVersions, TlsConfig, VerifyPolicy};
pub use engine::{TlsEngine, TlsEvent, TlsState};
pub use verify::{subject_matches, PeerIdentity, PeerVerifier, VerifyError};
