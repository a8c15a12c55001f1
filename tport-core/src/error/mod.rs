use std::io;

use thiserror::Error;

/// Normalized error codes, the only error vocabulary the lifecycle manager
/// and the upper layer reason about.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ErrorCode {
    /// Bind, listen or socket-option failure while creating a primary.
    Setup,
    /// Outbound connection could not be established.
    Connect,
    Timeout,
    Handshake,
    CertRejected,
    Protocol,
    QueueFull,
    Closed,
    Eof,
    Io,
    NotSupported,
    InvalidArgument,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
    #[error("connect {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        source: io::Error,
    },
    #[error("eof")]
    Eof,
    #[error("timed out: {0}")]
    TimedOut(&'static str),
    #[error("tls handshake failed: {0}")]
    Handshake(String),
    #[error("peer certificate rejected: {0}")]
    CertRejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("send queue full")]
    QueueFull,
    #[error("transport closed")]
    Closed,
    #[error("invalid transport name: {0}")]
    InvalidName(String),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("invalid config: {0}")]
    Config(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(e) => match e.kind() {
                io::ErrorKind::TimedOut => ErrorCode::Timeout,
                io::ErrorKind::UnexpectedEof => ErrorCode::Eof,
                _ => ErrorCode::Io,
            },
            Error::Setup(_) => ErrorCode::Setup,
            Error::Connect { .. } => ErrorCode::Connect,
            Error::Eof => ErrorCode::Eof,
            Error::TimedOut(_) => ErrorCode::Timeout,
            Error::Handshake(_) => ErrorCode::Handshake,
            Error::CertRejected(_) => ErrorCode::CertRejected,
            Error::Protocol(_) => ErrorCode::Protocol,
            Error::QueueFull => ErrorCode::QueueFull,
            Error::Closed => ErrorCode::Closed,
            Error::InvalidName(_) | Error::Config(_) => ErrorCode::InvalidArgument,
            Error::NotSupported(_) => ErrorCode::NotSupported,
        }
    }
    /// Errors that end only the operation in progress, not the connection.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            Error::QueueFull => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_normalize_by_kind() {
        let e = Error::from(io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(e.code(), ErrorCode::Timeout);
        let e = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(e.code(), ErrorCode::Io);
        assert!(Error::from(io::Error::from(io::ErrorKind::WouldBlock)).is_transient());
        assert!(!Error::CertRejected("x".into()).is_transient());
    }

    #[test]
    fn setup_errors_keep_context() {
        let e: Error = anyhow::anyhow!("bind 0.0.0.0:5060").into();
        assert_eq!(e.code(), ErrorCode::Setup);
        assert!(e.to_string().contains("5060"));
    }
}
