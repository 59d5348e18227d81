//! Sending and receiving encoded frames over UDP

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, info};

use super::udp::{bind_receiver, bind_sender, is_transient};
use crate::config::AppConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;
use crate::protocol::EncodedPacket;

/// Both halves of the link for one node
pub struct FrameTransport {
    sender: FrameSender,
    receiver: FrameReceiver,
}

impl FrameTransport {
    /// Bind according to the configured role and port convention
    pub fn bind(config: &AppConfig) -> Result<Self, NetworkError> {
        let endpoint = config.endpoint();
        let recv_addr = SocketAddr::new(config.link.bind_address, endpoint.recv_port);
        let transport = Self::open(
            recv_addr,
            endpoint.send_addr(),
            config.link.recv_buffer_bytes,
            config.recv_timeout(),
        )?;
        info!("Link {} as node {}: {}", transport.local_addr_display(), config.link.role, endpoint);
        Ok(transport)
    }

    /// Bind `recv_addr` and target `send_addr`
    pub fn open(
        recv_addr: SocketAddr,
        send_addr: SocketAddr,
        recv_buffer_bytes: usize,
        timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let recv_socket = bind_receiver(recv_addr, recv_buffer_bytes, timeout)?;
        let send_socket = bind_sender(send_addr)?;
        Ok(Self {
            sender: FrameSender::new(send_socket, send_addr),
            receiver: FrameReceiver::new(recv_socket),
        })
    }

    /// Fire-and-forget send to the peer
    pub fn send(&mut self, packet: &EncodedPacket) -> Result<(), NetworkError> {
        self.sender.send(packet)
    }

    /// Non-blocking poll
    pub fn try_receive(&mut self) -> Result<Option<EncodedPacket>, NetworkError> {
        self.receiver.try_receive()
    }

    /// Wait up to the configured timeout for a packet
    pub fn receive_timeout(&mut self) -> Result<Option<EncodedPacket>, NetworkError> {
        self.receiver.receive_timeout()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver.local_addr()
    }

    fn local_addr_display(&self) -> String {
        self.local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".to_string())
    }

    /// Separate the halves so each pipeline thread owns one
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half, owned by the send pipeline
pub struct FrameSender {
    socket: UdpSocket,
    target: SocketAddr,
    packets_sent: u64,
    bytes_sent: u64,
    send_errors: u64,
}

impl FrameSender {
    fn new(socket: UdpSocket, target: SocketAddr) -> Self {
        Self {
            socket,
            target,
            packets_sent: 0,
            bytes_sent: 0,
            send_errors: 0,
        }
    }

    /// One datagram, no retry. Failures are counted and returned.
    pub fn send(&mut self, packet: &EncodedPacket) -> Result<(), NetworkError> {
        let datagram = packet.to_datagram();
        if datagram.len() > MAX_DATAGRAM_SIZE {
            self.send_errors += 1;
            return Err(NetworkError::PacketTooLarge(datagram.len()));
        }

        match self.socket.send_to(&datagram, self.target) {
            Ok(_) => {
                self.packets_sent += 1;
                self.bytes_sent += datagram.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.send_errors += 1;
                Err(NetworkError::SendFailed(format!("{}: {}", self.target, e)))
            }
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors
    }
}

/// Receiving half, owned by the receive pipeline
pub struct FrameReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
    nonblocking: bool,
}

impl FrameReceiver {
    fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            // One spare byte detects oversize datagrams the OS truncated
            buf: vec![0u8; MAX_DATAGRAM_SIZE + 1],
            nonblocking: false,
        }
    }

    /// Return a queued packet without waiting
    pub fn try_receive(&mut self) -> Result<Option<EncodedPacket>, NetworkError> {
        self.set_nonblocking(true)?;
        self.recv()
    }

    /// Return the next packet, or `None` once the read timeout elapses
    pub fn receive_timeout(&mut self) -> Result<Option<EncodedPacket>, NetworkError> {
        self.set_nonblocking(false)?;
        self.recv()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), NetworkError> {
        if self.nonblocking != nonblocking {
            self.socket
                .set_nonblocking(nonblocking)
                .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<EncodedPacket>, NetworkError> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, from)) => {
                if len > MAX_DATAGRAM_SIZE {
                    return Err(NetworkError::PacketTooLarge(len));
                }
                let packet = EncodedPacket::parse(&self.buf[..len])?;
                debug!("Packet #{} ({} bytes) from {}", packet.sequence, len, from);
                Ok(Some(packet))
            }
            Err(e) if is_transient(&e) => Ok(None),
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::thread;

    fn loopback_pair() -> (FrameTransport, FrameTransport) {
        let timeout = Duration::from_millis(20);
        // Bind receivers first so each side knows the other's port
        let a_recv = bind_receiver("127.0.0.1:0".parse().unwrap(), 1 << 16, timeout).unwrap();
        let b_recv = bind_receiver("127.0.0.1:0".parse().unwrap(), 1 << 16, timeout).unwrap();
        let a_addr = a_recv.local_addr().unwrap();
        let b_addr = b_recv.local_addr().unwrap();

        let a = FrameTransport {
            sender: FrameSender::new(bind_sender(b_addr).unwrap(), b_addr),
            receiver: FrameReceiver::new(a_recv),
        };
        let b = FrameTransport {
            sender: FrameSender::new(bind_sender(a_addr).unwrap(), a_addr),
            receiver: FrameReceiver::new(b_recv),
        };
        (a, b)
    }

    #[test]
    fn test_try_receive_empty() {
        let (mut a, _b) = loopback_pair();
        assert!(a.try_receive().unwrap().is_none());
        assert!(a.receive_timeout().unwrap().is_none());
    }

    #[test]
    fn test_packets_cross_in_both_directions() {
        let (mut a, mut b) = loopback_pair();

        a.send(&EncodedPacket::new(1, Bytes::from_static(b"to-b"))).unwrap();
        b.send(&EncodedPacket::new(9, Bytes::from_static(b"to-a"))).unwrap();

        let at_b = b.receive_timeout().unwrap().unwrap();
        assert_eq!(at_b.sequence, 1);
        assert_eq!(&at_b.payload[..], b"to-b");

        let at_a = a.receive_timeout().unwrap().unwrap();
        assert_eq!(at_a.sequence, 9);
    }

    #[test]
    fn test_try_receive_after_arrival() {
        let (mut a, mut b) = loopback_pair();
        a.send(&EncodedPacket::new(3, Bytes::from_static(&[1, 2, 3]))).unwrap();

        let mut received = None;
        for _ in 0..100 {
            if let Some(p) = b.try_receive().unwrap() {
                received = Some(p);
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(received.unwrap().sequence, 3);
    }

    #[test]
    fn test_oversize_packet_not_sent() {
        let (mut a, _b) = loopback_pair();
        let packet = EncodedPacket::new(0, Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE]));
        assert!(matches!(a.send(&packet), Err(NetworkError::PacketTooLarge(_))));
        let (sender, _) = a.split();
        assert_eq!(sender.send_errors(), 1);
    }

    #[test]
    fn test_runt_datagram_rejected() {
        let (_a, mut b) = loopback_pair();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[1, 2], b.local_addr().unwrap()).unwrap();
        assert!(matches!(
            b.receive_timeout(),
            Err(NetworkError::InvalidPacket(_))
        ));
    }
}
