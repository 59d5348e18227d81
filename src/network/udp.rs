//! Socket construction

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Bind the receive socket with a large kernel buffer and a read timeout
pub fn bind_receiver(
    addr: SocketAddr,
    recv_buffer_bytes: usize,
    timeout: Duration,
) -> Result<UdpSocket, NetworkError> {
    let bind_err = |what: &str, e: io::Error| {
        NetworkError::BindFailed(format!("{} ({}): {}", what, addr, e))
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| bind_err("create socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| bind_err("set reuse address", e))?;
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_bytes) {
        warn!("Could not set receive buffer to {} bytes: {}", recv_buffer_bytes, e);
    }
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| bind_err("set read timeout", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| bind_err("bind", e))?;

    // The kernel may round or cap the request
    if let Ok(actual) = socket.recv_buffer_size() {
        debug!("Receive socket {} buffer: {} bytes", addr, actual);
    }

    Ok(socket.into())
}

/// Non-blocking socket for sending to `peer`, bound to an ephemeral port
pub fn bind_sender(peer: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let local: SocketAddr = match peer.ip() {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(format!("create send socket: {}", e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(format!("set nonblocking: {}", e)))?;
    socket
        .bind(&local.into())
        .map_err(|e| NetworkError::BindFailed(format!("bind send socket: {}", e)))?;

    Ok(socket.into())
}

/// Errors a receive loop should treat as "nothing this time"
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_times_out() {
        let socket = bind_receiver(
            "127.0.0.1:0".parse().unwrap(),
            1 << 20,
            Duration::from_millis(10),
        )
        .unwrap();
        let mut buf = [0u8; 64];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(is_transient(&err));
    }

    #[test]
    fn test_port_in_use_is_bind_error() {
        let first = UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = first.local_addr().unwrap();
        // The first socket did not opt into address reuse
        let result = bind_receiver(taken, 1 << 16, Duration::from_millis(10));
        assert!(matches!(result, Err(NetworkError::BindFailed(_))));
    }
}
