//! Peer address normalization (spec.md §4.6): IPv4-mapped IPv6 addresses are
//! optionally folded to plain IPv4, IPv6 addresses are stored compressed and
//! lowercase, and every address has a canonical bracketed `host:port` string
//! used as the swarm's equality/indexing key.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::IPVersion;

/// A discovered peer network address, already normalized.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct PeerAddress {
    ip: IpAddr,
    port: u16,
}

impl PeerAddress {
    /// Builds a `PeerAddress`, folding IPv4-mapped IPv6 addresses
    /// (`::ffff:a.b.c.d`) to plain IPv4 when `fold_mapped_v4` is set.
    #[must_use]
    pub fn new(addr: SocketAddr, fold_mapped_v4: bool) -> Self {
        let ip = normalize_ip(addr.ip(), fold_mapped_v4);
        Self { ip, port: addr.port() }
    }

    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    #[must_use]
    pub fn family(&self) -> IPVersion {
        match self.ip {
            IpAddr::V4(_) => IPVersion::IPv4,
            IpAddr::V6(_) => IPVersion::IPv6,
        }
    }

    /// The canonical equality/index key for this address: `host:port` for
    /// IPv4, `[host]:port` for IPv6, with IPv6 hosts compressed and
    /// lowercased (`std::net::Ipv6Addr`'s `Display` already does both).
    #[must_use]
    pub fn address_key(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("{ip}:{}", self.port),
            IpAddr::V6(ip) => format!("[{ip}]:{}", self.port),
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address_key())
    }
}

fn normalize_ip(ip: IpAddr, fold_mapped_v4: bool) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => {
            if fold_mapped_v4 {
                if let Some(v4) = mapped_v4(&v6) {
                    return IpAddr::V4(v4);
                }
            }
            IpAddr::V6(v6)
        }
    }
}

fn mapped_v4(v6: &std::net::Ipv6Addr) -> Option<Ipv4Addr> {
    let segments = v6.segments();
    if segments[0..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
        let [a, b, c, d] = v6.to_ipv4()?.octets();
        return Some(Ipv4Addr::new(a, b, c, d));
    }
    None
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

    use super::PeerAddress;

    #[test]
    fn should_fold_ipv4_mapped_ipv6_when_requested() {
        let mapped = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x0102, 0x0304);
        let addr = PeerAddress::new(SocketAddr::new(mapped.into(), 6881), true);
        assert_eq!(addr.ip(), Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(addr.address_key(), "1.2.3.4:6881");
    }

    #[test]
    fn should_keep_ipv6_when_not_folding() {
        let mapped = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x0102, 0x0304);
        let addr = PeerAddress::new(SocketAddr::new(mapped.into(), 6881), false);
        assert!(addr.ip().is_ipv6());
    }

    #[test]
    fn should_bracket_ipv6_keys() {
        let addr = PeerAddress::new(SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 6881), true);
        assert_eq!(addr.address_key(), "[::1]:6881");
    }

    #[test]
    fn should_not_bracket_ipv4_keys() {
        let addr = PeerAddress::new(SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 6881), true);
        assert_eq!(addr.address_key(), "127.0.0.1:6881");
    }
}
