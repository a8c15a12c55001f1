use anyhow::Context;
use socket2::Protocol;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
pub use unix::*;
#[cfg(windows)]
pub use windows::*;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub const DEFAULT_BACKLOG: u32 = 64;

pub(crate) trait TosSocketExt {
    /// Sets the IP type-of-service byte, or the traffic class on IPv6.
    fn set_type_of_service(&self, v6: bool, tos: u32) -> io::Result<()>;
}

impl TosSocketExt for socket2::Socket {
    fn set_type_of_service(&self, v6: bool, tos: u32) -> io::Result<()> {
        if v6 {
            log::debug!("tos {tos} ignored on ipv6 socket");
            return Ok(());
        }
        self.set_tos(tos)
    }
}

fn new_socket(addr: &SocketAddr, ty: socket2::Type, protocol: Protocol) -> io::Result<socket2::Socket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    socket2::Socket::new(domain, ty, Some(protocol))
}

/// Opens an outbound TCP connection with Nagle disabled.
pub async fn connect_tcp(addr: SocketAddr, tos: Option<u32>) -> crate::error::Result<tokio::net::TcpStream> {
    let socket = new_socket(&addr, socket2::Type::STREAM, Protocol::TCP)?;
    if let Some(tos) = tos {
        if let Err(e) = socket.set_type_of_service(addr.is_ipv6(), tos) {
            log::warn!("set tos {tos} for {addr}: {e:?}")
        }
    }
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    let socket = tokio::net::TcpSocket::from_std_stream(socket.into());
    socket
        .connect(addr)
        .await
        .map_err(|source| crate::error::Error::Connect { addr, source })
}

pub fn create_tcp_listener(
    addr: SocketAddr,
    backlog: u32,
    tos: Option<u32>,
) -> anyhow::Result<std::net::TcpListener> {
    let socket = new_socket(&addr, socket2::Type::STREAM, Protocol::TCP)?;
    if addr.is_ipv6() {
        socket
            .set_only_v6(true)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
    }
    socket
        .set_reuse_address(true)
        .context("set_reuse_address")?;
    if let Some(tos) = tos {
        socket
            .set_type_of_service(addr.is_ipv6(), tos)
            .with_context(|| format!("set tos {tos}"))?;
    }
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    socket
        .listen(backlog as i32)
        .with_context(|| format!("listen {addr}"))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

/// Binds a UDP socket. The socket is left blocking when `nonblocking` is
/// false so worker threads can use read timeouts on it.
pub fn bind_udp(addr: SocketAddr, tos: Option<u32>, nonblocking: bool) -> anyhow::Result<socket2::Socket> {
    let socket = new_socket(&addr, socket2::Type::DGRAM, Protocol::UDP)?;
    if addr.is_ipv6() {
        socket
            .set_only_v6(true)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
    }
    #[cfg(windows)]
    if let Err(e) = ignore_conn_reset(&socket) {
        log::warn!("ignore_conn_reset {e:?}")
    }
    if let Some(tos) = tos {
        socket
            .set_type_of_service(addr.is_ipv6(), tos)
            .with_context(|| format!("set tos {tos}"))?;
    }
    socket.set_nonblocking(nonblocking)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind_udp {addr}"))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_and_udp_bind_on_ephemeral_ports() {
        let listener = create_tcp_listener("127.0.0.1:0".parse().unwrap(), 8, None).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        let udp = bind_udp("127.0.0.1:0".parse().unwrap(), Some(0x10), true).unwrap();
        let addr = udp.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn bind_conflict_reports_address() {
        let udp = bind_udp("127.0.0.1:0".parse().unwrap(), None, true).unwrap();
        let addr = udp.local_addr().unwrap().as_socket().unwrap();
        let err = bind_udp(addr, None, true).unwrap_err();
        assert!(format!("{err:#}").contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let listener = create_tcp_listener("127.0.0.1:0".parse().unwrap(), 8, None).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect_tcp(addr, None).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Connect);
    }
}
