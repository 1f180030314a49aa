//! Tracker clients (spec.md §4.5): HTTP (BEP 3) and UDP (BEP 15) announce,
//! tiered announce-list fallback (BEP 12), and the shared failure backoff.
//! Every successful announce produces one [`AnnounceOutcome`] whose `peers`
//! a caller turns into a single batched `peersDiscovered` event, never one
//! event per peer (spec.md §4.5 "Batching contract").

pub mod http;
pub mod udp;

use std::time::Duration;

use bencode::{BDictAccess, BRefAccess, BencodeRef};
pub use http::{HttpTrackerClient, HttpTrackerError, TRACKER_HTTP_LOG_TARGET};
use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::announce_event::AnnounceEvent;
use torrentd_primitives::info_hash::InfoHash;
use torrentd_primitives::peer_id::PeerId;
pub use udp::{ScrapeStats, UdpTrackerClient, UdpTrackerError, TRACKER_UDP_LOG_TARGET};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("http tracker error: {0}")]
    Http(#[from] HttpTrackerError),
    #[error("udp tracker error: {0}")]
    Udp(#[from] UdpTrackerError),
}

/// Parameters for one announce call, independent of transport (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub num_want: i32,
}

/// Result of one successful announce (spec.md §4.5 "Batching contract"):
/// callers emit exactly one `peersDiscovered` event from `peers`, never one
/// per discovered peer.
#[derive(Debug, Clone, Default)]
pub struct AnnounceOutcome {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub peers: Vec<PeerAddress>,
    pub seeders: u32,
    pub leechers: u32,
}

/// Exponential retry/backoff shared by every tracker transport (spec.md
/// §4.5 "Tracker failure policy"): starts at 30s, doubles on each failure,
/// caps at 30 minutes, resets to 30s on the next successful announce.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceBackoff {
    current: Duration,
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

impl Default for AnnounceBackoff {
    fn default() -> Self {
        Self { current: INITIAL_BACKOFF }
    }
}

impl AnnounceBackoff {
    /// Delay to wait before the next retry; doubles every call (capped).
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }

    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }
}

/// One announce-list tier (BEP 12): every tracker in a tier is tried, in
/// order, before the next tier is attempted.
pub type Tier = Vec<String>;

/// The tracker tier list carried by a `.torrent`'s `announce-list`, or a
/// magnet link's repeated `tr=` parameters (SPEC_FULL.md §4.5 supplement).
#[derive(Debug, Clone, Default)]
pub struct TrackerList {
    tiers: Vec<Tier>,
}

impl TrackerList {
    #[must_use]
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self { tiers }
    }

    /// A single-tracker, single-tier list — the common non-multi-tracker case.
    #[must_use]
    pub fn single(url: String) -> Self {
        Self { tiers: vec![vec![url]] }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(std::vec::Vec::is_empty)
    }

    #[must_use]
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// BEP 12: on a successful announce to `url`, move it to the front of
    /// its tier so it's tried first next time.
    pub fn promote(&mut self, url: &str) {
        for tier in &mut self.tiers {
            if let Some(pos) = tier.iter().position(|u| u == url) {
                if pos != 0 {
                    let promoted = tier.remove(pos);
                    tier.insert(0, promoted);
                }
                return;
            }
        }
    }
}

/// Reads `announce`/`announce-list` out of a `.torrent` file's top-level
/// dictionary (BEP 3, BEP 12), independently of [`torrentd_primitives::metadata::Metadata`]
/// since a tracker list is not part of the `info` dictionary the info-hash
/// is computed from. Returns an empty [`TrackerList`] for a trackerless
/// torrent (DHT/PEX-only) rather than an error.
#[must_use]
pub fn extract_tracker_list(bytes: &[u8]) -> TrackerList {
    let Ok(decoded) = BencodeRef::decode(bytes, bencode::BDecodeOpt::default()) else { return TrackerList::default() };
    let Some(top) = decoded.dict() else { return TrackerList::default() };

    if let Some(list) = top.lookup(b"announce-list").and_then(BRefAccess::list) {
        let tiers: Vec<Tier> = (0..list.len())
            .filter_map(|i| list.get(i))
            .filter_map(BRefAccess::list)
            .map(|tier| (0..tier.len()).filter_map(|i| tier.get(i)).filter_map(BRefAccess::str).map(str::to_owned).collect())
            .collect();
        if !tiers.is_empty() {
            return TrackerList::new(tiers);
        }
    }

    top.lookup(b"announce").and_then(BRefAccess::str).map_or_else(TrackerList::default, |url| TrackerList::single(url.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_extract_a_single_announce_url() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"announce".to_vec(), serde_bencode::value::Value::Bytes(b"http://tracker.example/announce".to_vec()));
        let bytes = serde_bencode::to_bytes(&serde_bencode::value::Value::Dict(dict)).unwrap();
        let list = extract_tracker_list(&bytes);
        assert_eq!(list.tiers(), &[vec!["http://tracker.example/announce".to_owned()]]);
    }

    #[test]
    fn should_prefer_announce_list_tiers_over_announce() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"announce".to_vec(), serde_bencode::value::Value::Bytes(b"http://primary/announce".to_vec()));
        dict.insert(
            b"announce-list".to_vec(),
            serde_bencode::value::Value::List(vec![
                serde_bencode::value::Value::List(vec![serde_bencode::value::Value::Bytes(b"http://tier1a/announce".to_vec())]),
                serde_bencode::value::Value::List(vec![serde_bencode::value::Value::Bytes(b"http://tier2a/announce".to_vec())]),
            ]),
        );
        let bytes = serde_bencode::to_bytes(&serde_bencode::value::Value::Dict(dict)).unwrap();
        let list = extract_tracker_list(&bytes);
        assert_eq!(list.tiers().len(), 2);
        assert_eq!(list.tiers()[0], vec!["http://tier1a/announce".to_owned()]);
    }

    #[test]
    fn should_return_an_empty_list_for_a_trackerless_torrent() {
        let dict: std::collections::BTreeMap<Vec<u8>, serde_bencode::value::Value> = std::collections::BTreeMap::new();
        let bytes = serde_bencode::to_bytes(&serde_bencode::value::Value::Dict(dict)).unwrap();
        assert!(extract_tracker_list(&bytes).is_empty());
    }

    #[test]
    fn should_double_backoff_up_to_the_cap() {
        let mut backoff = AnnounceBackoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));
    }

    #[test]
    fn should_reset_backoff_on_success() {
        let mut backoff = AnnounceBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(30));
    }

    #[test]
    fn should_promote_a_successful_tracker_to_the_front_of_its_tier() {
        let mut list = TrackerList::new(vec![vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]]);
        list.promote("c");
        assert_eq!(list.tiers()[0], vec!["c".to_owned(), "a".to_owned(), "b".to_owned()]);
    }
}
