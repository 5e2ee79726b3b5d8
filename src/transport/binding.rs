/**
 * transport/binding.rs
 *
 * Listener socket binding with bounded port fallback
 */

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::types::{TransportError, TransportResult};

/// Bind `requested`, moving to `requested + offset` for offsets `0..span`
/// only while the failure is `AddrInUse`. Port 0 binds an ephemeral port
/// once. Returns the socket and the bound port.
pub(crate) fn bind_with_fallback(requested: u16, span: u16) -> TransportResult<(UdpSocket, u16)> {
    bind_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED), requested, span)
}

fn bind_on(ip: IpAddr, requested: u16, span: u16) -> TransportResult<(UdpSocket, u16)> {
    if requested == 0 {
        let socket = bind_exact(SocketAddr::new(ip, 0))
            .map_err(|source| TransportError::Bind { port: 0, source })?;
        let port = socket.local_addr()?.port();
        return Ok((socket, port));
    }

    let mut last_error = None;
    for offset in 0..span.max(1) {
        let Some(port) = requested.checked_add(offset) else {
            break;
        };
        match bind_exact(SocketAddr::new(ip, port)) {
            Ok(socket) => {
                if offset > 0 {
                    info!("Port {} in use, listening on {} instead", requested, port);
                }
                return Ok((socket, port));
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!("Port {} in use", port);
                last_error = Some(TransportError::Bind { port, source: e });
            }
            Err(e) => return Err(TransportError::Bind { port, source: e }),
        }
    }

    Err(last_error.unwrap_or(TransportError::Bind {
        port: requested,
        source: ErrorKind::AddrInUse.into(),
    }))
}

/// Bind without address reuse, so a taken port is reported as taken
fn bind_exact(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    // Convert to Tokio socket
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

#[cfg(test)]
pub(crate) mod test_ports {
    use std::net::UdpSocket;

    /// Find `count` consecutive free UDP ports and hold them
    pub fn occupy_consecutive(count: u16) -> (u16, Vec<UdpSocket>) {
        for _ in 0..200 {
            let base = 20_000 + (rand::random::<u16>() % 30_000);
            let held: Vec<_> = (0..count)
                .map_while(|o| UdpSocket::bind(("0.0.0.0", base + o)).ok())
                .collect();
            if held.len() == count as usize {
                return (base, held);
            }
        }
        panic!("no run of {} free ports found", count);
    }

    /// A port that was free a moment ago, with the next 16 free as well
    pub fn free_base() -> u16 {
        let (base, held) = occupy_consecutive(17);
        drop(held);
        base
    }
}

#[cfg(test)]
mod tests {
    use super::test_ports::*;
    use super::*;

    #[tokio::test]
    async fn binds_requested_port_when_free() {
        let base = free_base();
        let (_socket, port) = bind_with_fallback(base, 16).unwrap();
        assert_eq!(port, base);
    }

    #[tokio::test]
    async fn moves_past_ports_in_use() {
        let (base, held) = occupy_consecutive(3);
        let result = bind_with_fallback(base, 16);
        drop(held);

        let (_socket, port) = result.unwrap();
        assert!(port >= base + 3 && port < base + 16, "bound {}", port);
    }

    #[tokio::test]
    async fn exhausting_the_span_reports_last_error() {
        let (base, held) = occupy_consecutive(16);
        let err = bind_with_fallback(base, 16).unwrap_err();
        drop(held);

        match err {
            TransportError::Bind { port, source } => {
                assert_eq!(port, base + 15);
                assert_eq!(source.kind(), ErrorKind::AddrInUse);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn other_bind_errors_abort_without_retrying() {
        // TEST-NET-1 is never assigned to a local interface
        let unassigned = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let base = free_base();

        match bind_on(unassigned, base, 16).unwrap_err() {
            TransportError::Bind { port, source } => {
                assert_eq!(port, base);
                assert_ne!(source.kind(), ErrorKind::AddrInUse);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn ephemeral_port() {
        let (socket, port) = bind_with_fallback(0, 16).unwrap();
        assert_ne!(port, 0);
        assert_eq!(socket.local_addr().unwrap().port(), port);
    }
}
