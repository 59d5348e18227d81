//! Link roles, endpoints and the datagram format
//!
//! Each UDP datagram carries exactly one Opus frame behind a 4-byte header:
//!
//! ```text
//! +----------------------+---------------------------+
//! | sequence (u32, BE)   | Opus payload (1..N bytes) |
//! +----------------------+---------------------------+
//! ```
//!
//! The sequence number increases by one per frame and wraps. The receiver
//! uses it to tell loss (gap) from reordering or duplication (not newer).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::NetworkError;

/// Size of the sequence header in bytes
pub const HEADER_LEN: usize = 4;

/// Which end of the link this node is.
///
/// Port usage is fixed per direction, not per node: the A->B port always
/// carries A's audio and the B->A port always carries B's audio. Node A
/// sends on A->B and listens on B->A; node B does the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(alias = "a")]
    A,
    #[serde(alias = "b")]
    B,
}

impl Role {
    /// The role of the node at the other end
    pub fn peer(self) -> Role {
        match self {
            Role::A => Role::B,
            Role::B => Role::A,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::A => write!(f, "A"),
            Role::B => write!(f, "B"),
        }
    }
}

/// Peer address plus the port pair used by this node for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub peer_address: IpAddr,
    pub send_port: u16,
    pub recv_port: u16,
}

impl PeerEndpoint {
    /// Derive the endpoint for `role` from the per-direction port convention
    pub fn for_role(role: Role, peer_address: IpAddr, a_to_b_port: u16, b_to_a_port: u16) -> Self {
        let (send_port, recv_port) = match role {
            Role::A => (a_to_b_port, b_to_a_port),
            Role::B => (b_to_a_port, a_to_b_port),
        };
        Self {
            peer_address,
            send_port,
            recv_port,
        }
    }

    /// Where outgoing datagrams go
    pub fn send_addr(&self) -> SocketAddr {
        SocketAddr::new(self.peer_address, self.send_port)
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "send -> {}:{}, recv <- :{}",
            self.peer_address, self.send_port, self.recv_port
        )
    }
}

/// One compressed frame as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub sequence: u32,
    pub payload: Bytes,
}

impl EncodedPacket {
    pub fn new(sequence: u32, payload: Bytes) -> Self {
        Self { sequence, payload }
    }

    /// Serialize header and payload into one datagram
    pub fn to_datagram(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.sequence);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a received datagram
    pub fn parse(datagram: &[u8]) -> Result<Self, NetworkError> {
        if datagram.len() < HEADER_LEN {
            return Err(NetworkError::InvalidPacket(format!(
                "datagram of {} bytes is shorter than the header",
                datagram.len()
            )));
        }
        let mut buf = datagram;
        let sequence = buf.get_u32();
        Ok(Self {
            sequence,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// True if `a` comes after `b` in wrapping sequence order
pub fn seq_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Forward distance from `from` to `to`
pub fn seq_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_port_convention_is_mirrored() {
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let a = PeerEndpoint::for_role(Role::A, peer, 9999, 9998);
        let b = PeerEndpoint::for_role(Role::B, peer, 9999, 9998);

        assert_eq!(a.send_port, 9999);
        assert_eq!(a.recv_port, 9998);
        // A's send port is B's receive port and vice versa
        assert_eq!(a.send_port, b.recv_port);
        assert_eq!(b.send_port, a.recv_port);
        assert_eq!(Role::A.peer(), Role::B);
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(EncodedPacket::parse(&[0, 1, 2]).is_err());
        let empty_payload = EncodedPacket::parse(&[0, 0, 0, 7]).unwrap();
        assert_eq!(empty_payload.sequence, 7);
        assert!(empty_payload.payload.is_empty());
    }

    #[test]
    fn test_sequence_order_wraps() {
        assert!(seq_newer(1, 0));
        assert!(!seq_newer(0, 0));
        assert!(!seq_newer(0, 1));
        assert!(seq_newer(0, u32::MAX));
        assert_eq!(seq_distance(u32::MAX, 1), 2);
    }

    proptest! {
        #[test]
        fn prop_datagram_header_survives(seq in any::<u32>(), payload in prop::collection::vec(any::<u8>(), 0..200)) {
            let packet = EncodedPacket::new(seq, Bytes::from(payload));
            let parsed = EncodedPacket::parse(&packet.to_datagram()).unwrap();
            prop_assert_eq!(parsed, packet);
        }
    }
}
