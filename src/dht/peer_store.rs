//! DHT peer store (spec.md §4.7 "PeerStore"): `infoHash -> ordered set of
//! (peer, lastSeen)`, capped per info-hash, expiring stale entries.

use std::collections::HashMap;
use std::time::Duration;

use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::info_hash::InfoHash;

/// Default cap on announced peers retained per info-hash.
pub const DEFAULT_MAX_PEERS_PER_TORRENT: usize = 1000;

/// Announced peers older than this are considered gone (spec.md §4.7).
pub const EXPIRY: Duration = Duration::from_secs(30 * 60);

struct Entry {
    addr: PeerAddress,
    last_seen: Duration,
}

pub struct PeerStore {
    max_peers_per_torrent: usize,
    by_info_hash: HashMap<InfoHash, Vec<Entry>>,
}

impl PeerStore {
    #[must_use]
    pub fn new(max_peers_per_torrent: usize) -> Self {
        Self { max_peers_per_torrent, by_info_hash: HashMap::new() }
    }

    /// Records (or refreshes) an `announce_peer` for `info_hash`. Evicts the
    /// oldest entry if the per-torrent cap would otherwise be exceeded.
    pub fn announce(&mut self, info_hash: InfoHash, addr: PeerAddress, now: Duration) {
        let entries = self.by_info_hash.entry(info_hash).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.addr.address_key() == addr.address_key()) {
            existing.last_seen = now;
            return;
        }
        if entries.len() >= self.max_peers_per_torrent {
            if let Some(oldest) = entries.iter().enumerate().min_by_key(|(_, e)| e.last_seen).map(|(i, _)| i) {
                entries.remove(oldest);
            }
        }
        entries.push(Entry { addr, last_seen: now });
    }

    /// Peers announced for `info_hash` that haven't yet expired.
    #[must_use]
    pub fn get_peers(&self, info_hash: &InfoHash, now: Duration) -> Vec<PeerAddress> {
        self.by_info_hash
            .get(info_hash)
            .into_iter()
            .flatten()
            .filter(|e| now.saturating_sub(e.last_seen) < EXPIRY)
            .map(|e| e.addr)
            .collect()
    }

    /// Drops expired entries across every info-hash; returns how many were
    /// removed (for logging by the caller's maintenance tick).
    pub fn sweep_expired(&mut self, now: Duration) -> usize {
        let mut removed = 0;
        self.by_info_hash.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| now.saturating_sub(e.last_seen) < EXPIRY);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new(SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), port), false)
    }

    #[test]
    fn should_return_announced_peers_for_the_right_info_hash() {
        let mut store = PeerStore::new(DEFAULT_MAX_PEERS_PER_TORRENT);
        let info_hash = InfoHash::from([1u8; 20]);
        store.announce(info_hash, addr(6881), Duration::ZERO);
        assert_eq!(store.get_peers(&info_hash, Duration::ZERO), vec![addr(6881)]);
    }

    #[test]
    fn should_expire_entries_after_thirty_minutes() {
        let mut store = PeerStore::new(DEFAULT_MAX_PEERS_PER_TORRENT);
        let info_hash = InfoHash::from([1u8; 20]);
        store.announce(info_hash, addr(6881), Duration::ZERO);
        assert!(store.get_peers(&info_hash, EXPIRY + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn should_evict_the_oldest_entry_once_the_cap_is_reached() {
        let mut store = PeerStore::new(2);
        let info_hash = InfoHash::from([1u8; 20]);
        store.announce(info_hash, addr(1), Duration::from_secs(1));
        store.announce(info_hash, addr(2), Duration::from_secs(2));
        store.announce(info_hash, addr(3), Duration::from_secs(3));
        let peers = store.get_peers(&info_hash, Duration::from_secs(3));
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&addr(1)));
    }

    #[test]
    fn should_sweep_expired_entries_and_report_the_count() {
        let mut store = PeerStore::new(DEFAULT_MAX_PEERS_PER_TORRENT);
        let info_hash = InfoHash::from([1u8; 20]);
        store.announce(info_hash, addr(1), Duration::ZERO);
        let removed = store.sweep_expired(EXPIRY + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert!(store.get_peers(&info_hash, EXPIRY + Duration::from_secs(1)).is_empty());
    }
}
