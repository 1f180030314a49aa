//! Compact encodings for DHT nodes and peers (spec.md §6.5): a node is 26
//! bytes `id(20)||ip(4)||port(2)` for IPv4; peers are 6 bytes IPv4 or 18
//! bytes IPv6, one entry per `values` list item.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use torrentd_primitives::address::PeerAddress;

use super::node_id::NodeId;

pub const COMPACT_NODE_V4_LEN: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

#[must_use]
pub fn encode_nodes(nodes: &[CompactNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_V4_LEN);
    for node in nodes {
        out.extend_from_slice(&node.id.bytes());
        out.extend_from_slice(&node.addr.ip().octets());
        out.extend_from_slice(&node.addr.port().to_be_bytes());
    }
    out
}

/// # Errors
///
/// Returns `Err` if `bytes.len()` is not a multiple of [`COMPACT_NODE_V4_LEN`].
pub fn decode_nodes(bytes: &[u8]) -> Result<Vec<CompactNode>, &'static str> {
    if bytes.len() % COMPACT_NODE_V4_LEN != 0 {
        return Err("compact node list has wrong length");
    }
    Ok(bytes
        .chunks_exact(COMPACT_NODE_V4_LEN)
        .map(|chunk| {
            let id = NodeId::from_slice(&chunk[0..20]).expect("chunk is exactly 20 bytes");
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            CompactNode { id, addr: SocketAddrV4::new(ip, port) }
        })
        .collect())
}

/// Encodes one compact peer entry (6 bytes IPv4, 18 bytes IPv6).
#[must_use]
pub fn encode_peer(addr: PeerAddress) -> Vec<u8> {
    match addr.socket_addr() {
        SocketAddr::V4(v4) => {
            let mut out = Vec::with_capacity(6);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = Vec::with_capacity(18);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
            out
        }
    }
}

/// # Errors
///
/// Returns `Err` if `bytes.len()` is neither 6 (IPv4) nor 18 (IPv6).
pub fn decode_peer(bytes: &[u8]) -> Result<PeerAddress, &'static str> {
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Ok(PeerAddress::new(SocketAddr::new(ip.into(), port), false))
        }
        18 => {
            let mut ip_bytes = [0u8; 16];
            ip_bytes.copy_from_slice(&bytes[0..16]);
            let ip = std::net::Ipv6Addr::from(ip_bytes);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Ok(PeerAddress::new(SocketAddr::new(ip.into(), port), false))
        }
        _ => Err("compact peer entry has wrong length"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use torrentd_primitives::address::PeerAddress;

    use super::*;

    #[test]
    fn should_round_trip_compact_nodes() {
        let node = CompactNode { id: NodeId::generate(), addr: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881) };
        let encoded = encode_nodes(&[node]);
        let decoded = decode_nodes(&encoded).unwrap();
        assert_eq!(decoded, vec![node]);
    }

    #[test]
    fn should_round_trip_a_compact_ipv4_peer() {
        let addr = PeerAddress::new(SocketAddr::new(Ipv4Addr::new(192, 168, 1, 1).into(), 51413), false);
        let encoded = encode_peer(addr);
        assert_eq!(encoded.len(), 6);
        let decoded = decode_peer(&encoded).unwrap();
        assert_eq!(decoded, addr);
    }
}
