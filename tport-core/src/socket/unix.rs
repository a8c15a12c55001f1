use std::io;
use std::net::SocketAddr;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};

fn sctp_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    Socket::new(domain, Type::STREAM, Some(Protocol::from(libc::IPPROTO_SCTP)))
}

/// Whether the error means the kernel has no SCTP support.
pub fn is_sctp_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EPROTONOSUPPORT) | Some(libc::ESOCKTNOSUPPORT) | Some(libc::EAFNOSUPPORT)
    )
}

/// One-to-one style SCTP listener on a single stream.
pub fn create_sctp_listener(addr: SocketAddr, backlog: u32) -> anyhow::Result<Socket> {
    let socket = sctp_socket(&addr).with_context(|| format!("sctp socket {addr}"))?;
    socket
        .set_reuse_address(true)
        .context("set_reuse_address")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind sctp {addr}"))?;
    socket
        .listen(backlog as i32)
        .with_context(|| format!("listen sctp {addr}"))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Starts a non-blocking SCTP connect. Completion is signalled by
/// writability; the caller checks `take_error` afterwards.
pub fn start_sctp_connect(addr: SocketAddr) -> io::Result<Socket> {
    let socket = sctp_socket(&addr)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(socket),
        Err(e) => Err(e),
    }
}
