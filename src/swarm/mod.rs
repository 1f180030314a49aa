//! Swarm management (spec.md §3 `Swarm`, §4.6): the set of known peer
//! addresses for one torrent, how they were discovered, their connection
//! backoff, and ban state. `Swarm` owns no sockets — it only decides which
//! addresses `crate::torrent` should hand to `crate::peer` next.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::peer_id::PeerId;

pub const SWARM_LOG_TARGET: &str = "SWARM";

/// Upper bound on how many connectable addresses [`Swarm::connectable_peers`]
/// ever returns in one call, independent of the caller's `limit` (spec.md
/// §4.6 "Connection candidate selection").
pub const MAX_CANDIDATES_RETURNED: usize = 500;

/// How a peer address entered the swarm (spec.md §3 `SwarmEntry`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Lpd,
    Incoming,
    Manual,
}

/// Connection lifecycle of one swarm entry (spec.md §3 `SwarmEntry`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmEntryState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Banned,
}

#[derive(Debug, Clone)]
pub struct SwarmEntry {
    pub address: PeerAddress,
    pub source: PeerSource,
    pub state: SwarmEntryState,
    pub peer_id: Option<PeerId>,
    pub connect_failures: u32,
    pub last_attempt: Option<Duration>,
    /// `true` only for corruption-derived bans (spec.md §4.3 "Ban policy");
    /// these are the only bans [`Swarm::unban_recoverable`] lifts.
    pub ban_is_recoverable: bool,
}

impl SwarmEntry {
    fn new(address: PeerAddress, source: PeerSource) -> Self {
        Self { address, source, state: SwarmEntryState::Idle, peer_id: None, connect_failures: 0, last_attempt: None, ban_is_recoverable: false }
    }
}

/// The known peer population for one torrent (spec.md §3 `Swarm`).
#[derive(Default)]
pub struct Swarm {
    entries: HashMap<String, SwarmEntry>,
    /// Index from a known `PeerId` to every `address_key` it has connected
    /// under, for the "never connect to ourselves twice under a different
    /// address" check (spec.md §4.6). A peer id is not unique to one
    /// address: NAT rebinding or dual-stack hosts can reconnect the same
    /// identity from a different `SwarmEntry`.
    peer_id_index: HashMap<PeerId, HashSet<String>>,
}

impl Swarm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds one discovered address, ignoring it if already known (spec.md
    /// §4.6: first source wins, a rediscovery does not reset backoff or
    /// lift a ban).
    pub fn add_peer(&mut self, address: PeerAddress, source: PeerSource) {
        self.entries.entry(address.address_key()).or_insert_with(|| SwarmEntry::new(address, source));
    }

    pub fn add_peers(&mut self, addresses: impl IntoIterator<Item = PeerAddress>, source: PeerSource) {
        for address in addresses {
            self.add_peer(address, source);
        }
    }

    #[must_use]
    pub fn entry(&self, address_key: &str) -> Option<&SwarmEntry> {
        self.entries.get(address_key)
    }

    /// Backoff before the next connect attempt is allowed, doubling per
    /// failure and capped at 5 minutes (spec.md §4.6 "Connect backoff").
    #[must_use]
    pub fn backoff_for(connect_failures: u32) -> Duration {
        let millis = 1000u64.saturating_mul(1u64 << connect_failures.min(63));
        Duration::from_millis(millis.min(5 * 60 * 1000))
    }

    fn is_connectable(entry: &SwarmEntry, now: Duration) -> bool {
        match entry.state {
            SwarmEntryState::Connected | SwarmEntryState::Connecting | SwarmEntryState::Banned => false,
            SwarmEntryState::Idle | SwarmEntryState::Failed => match entry.last_attempt {
                None => true,
                Some(last) => now.saturating_sub(last) >= Self::backoff_for(entry.connect_failures),
            },
        }
    }

    /// Candidate addresses to dial next (spec.md §4.6 "Connection candidate
    /// selection"): excludes `Connected`/`Connecting`/`Banned` entries and
    /// anything still inside its backoff window, shuffles the remainder with
    /// `rng`, then caps at `3 * limit` or [`MAX_CANDIDATES_RETURNED`],
    /// whichever is smaller, so a caller with a small `limit` still gets a
    /// useful shuffled pool to dial concurrently from.
    pub fn connectable_peers(&self, limit: usize, now: Duration, rng: &mut impl rand::Rng) -> Vec<PeerAddress> {
        let mut candidates: Vec<PeerAddress> = self.entries.values().filter(|e| Self::is_connectable(e, now)).map(|e| e.address).collect();
        rand::seq::SliceRandom::shuffle(candidates.as_mut_slice(), rng);
        let cap = (limit.saturating_mul(3)).min(MAX_CANDIDATES_RETURNED);
        candidates.truncate(cap);
        candidates
    }

    pub fn mark_connecting(&mut self, address_key: &str, now: Duration) {
        if let Some(entry) = self.entries.get_mut(address_key) {
            entry.state = SwarmEntryState::Connecting;
            entry.last_attempt = Some(now);
        }
    }

    pub fn mark_connected(&mut self, address_key: &str, peer_id: PeerId) {
        if let Some(entry) = self.entries.get_mut(address_key) {
            entry.state = SwarmEntryState::Connected;
            entry.connect_failures = 0;
            entry.peer_id = Some(peer_id);
            self.peer_id_index.entry(peer_id).or_default().insert(address_key.to_owned());
        }
    }

    /// Whether `peer_id` is already connected under some address (spec.md
    /// §4.6 "never connect to ourselves twice under a different address").
    #[must_use]
    pub fn is_peer_id_connected(&self, peer_id: &PeerId) -> bool {
        self.peer_id_index.get(peer_id).is_some_and(|set| !set.is_empty())
    }

    pub fn mark_failed(&mut self, address_key: &str) {
        if let Some(entry) = self.entries.get_mut(address_key) {
            entry.state = SwarmEntryState::Failed;
            entry.connect_failures += 1;
        }
    }

    pub fn mark_disconnected(&mut self, address_key: &str) {
        if let Some(entry) = self.entries.get_mut(address_key) {
            entry.state = SwarmEntryState::Idle;
            if let Some(peer_id) = entry.peer_id.take() {
                if let Some(set) = self.peer_id_index.get_mut(&peer_id) {
                    set.remove(address_key);
                    if set.is_empty() {
                        self.peer_id_index.remove(&peer_id);
                    }
                }
            }
        }
    }

    /// Bans an address for protocol corruption (spec.md §4.3 "Ban policy"):
    /// recoverable, unlike bans for other causes (SPEC_FULL.md §3
    /// supplement leaves non-corruption ban causes host-defined, so this
    /// module only models the one the spec requires).
    pub fn ban(&mut self, address_key: &str) {
        if let Some(entry) = self.entries.get_mut(address_key) {
            entry.state = SwarmEntryState::Banned;
            entry.ban_is_recoverable = true;
        }
    }

    #[must_use]
    pub fn is_banned(&self, address_key: &str) -> bool {
        self.entries.get(address_key).is_some_and(|e| e.state == SwarmEntryState::Banned)
    }

    /// Lifts every recoverable ban, returning them to `Idle` (spec.md §4.3:
    /// a corruption ban is lifted once the owning piece's data is
    /// successfully re-verified from other peers, never permanent).
    pub fn unban_recoverable(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.state == SwarmEntryState::Banned && entry.ban_is_recoverable {
                entry.state = SwarmEntryState::Idle;
                entry.connect_failures = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use rand::SeedableRng;

    use super::*;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new(SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), port), true)
    }

    #[test]
    fn should_keep_first_source_when_rediscovered() {
        let mut swarm = Swarm::new();
        swarm.add_peer(addr(1), PeerSource::Tracker);
        swarm.add_peer(addr(1), PeerSource::Dht);
        assert_eq!(swarm.len(), 1);
        assert_eq!(swarm.entry(&addr(1).address_key()).unwrap().source as u8, PeerSource::Tracker as u8);
    }

    #[test]
    fn should_exclude_connected_and_banned_from_candidates() {
        let mut swarm = Swarm::new();
        swarm.add_peer(addr(1), PeerSource::Tracker);
        swarm.add_peer(addr(2), PeerSource::Tracker);
        swarm.mark_connecting(&addr(1).address_key(), Duration::ZERO);
        swarm.mark_connected(&addr(1).address_key(), PeerId::generate(b"-TD0001-"));
        swarm.ban(&addr(2).address_key());

        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let candidates = swarm.connectable_peers(10, Duration::from_secs(1), &mut rng);
        assert!(candidates.is_empty());
    }

    #[test]
    fn should_back_off_after_a_connect_failure() {
        let mut swarm = Swarm::new();
        swarm.add_peer(addr(1), PeerSource::Tracker);
        let key = addr(1).address_key();
        swarm.mark_connecting(&key, Duration::from_secs(0));
        swarm.mark_failed(&key);

        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(swarm.connectable_peers(10, Duration::from_millis(500), &mut rng).is_empty());
        assert_eq!(swarm.connectable_peers(10, Duration::from_secs(2), &mut rng).len(), 1);
    }

    #[test]
    fn should_lift_only_recoverable_bans() {
        let mut swarm = Swarm::new();
        swarm.add_peer(addr(1), PeerSource::Tracker);
        let key = addr(1).address_key();
        swarm.ban(&key);
        assert!(swarm.is_banned(&key));
        swarm.unban_recoverable();
        assert!(!swarm.is_banned(&key));
    }

    #[test]
    fn should_cap_candidates_at_three_times_limit() {
        let mut swarm = Swarm::new();
        for port in 0..20u16 {
            swarm.add_peer(addr(port), PeerSource::Tracker);
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let candidates = swarm.connectable_peers(2, Duration::from_secs(1000), &mut rng);
        assert_eq!(candidates.len(), 6);
    }
}
