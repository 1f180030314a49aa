//! Choke/unchoke tit-for-tat policy (spec.md §4.4): regular slots go to the
//! fastest interested downloaders, one extra optimistic slot rotates
//! periodically to discover otherwise-choked peers. Pure decision logic —
//! sending the resulting `Choke`/`Unchoke` messages is the caller's job.

use std::collections::HashSet;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeManagerConfig {
    pub max_upload_slots: usize,
    pub round_interval: Duration,
    /// How many rounds between optimistic-unchoke rotations (3 rounds of a
    /// 10s round is the spec's 30s rotation).
    pub optimistic_rotate_every_rounds: u32,
}

impl Default for ChokeManagerConfig {
    fn default() -> Self {
        Self { max_upload_slots: 4, round_interval: Duration::from_secs(10), optimistic_rotate_every_rounds: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub key: String,
    /// Bytes/sec received from this peer over the last round, used to rank
    /// regular slots (spec.md §4.4).
    pub download_rate: f64,
    pub interested: bool,
}

/// Runs the round-robin optimistic-unchoke rotation and the rate-ranked
/// regular slots (spec.md §4.4). Stateful only in which peer currently
/// holds the optimistic slot and how many rounds have elapsed.
pub struct ChokeManager {
    config: ChokeManagerConfig,
    rounds_elapsed: u32,
    optimistic_peer: Option<String>,
}

impl ChokeManager {
    #[must_use]
    pub fn new(config: ChokeManagerConfig) -> Self {
        Self { config, rounds_elapsed: 0, optimistic_peer: None }
    }

    #[must_use]
    pub fn config(&self) -> ChokeManagerConfig {
        self.config
    }

    /// Computes the set of peer keys that should be unchoked this round.
    /// `candidates` should include every currently connected peer; peers
    /// absent from it are implicitly choked.
    pub fn run_round(&mut self, candidates: &[PeerCandidate], rng: &mut impl Rng) -> HashSet<String> {
        let regular_slots = self.config.max_upload_slots.saturating_sub(1);

        let mut interested: Vec<&PeerCandidate> = candidates.iter().filter(|c| c.interested).collect();
        interested.sort_by(|a, b| b.download_rate.partial_cmp(&a.download_rate).unwrap_or(std::cmp::Ordering::Equal));

        let mut unchoked: HashSet<String> = interested.iter().take(regular_slots).map(|c| c.key.clone()).collect();

        let rotate_due = self.rounds_elapsed % self.config.optimistic_rotate_every_rounds == 0;
        let optimistic_still_eligible =
            self.optimistic_peer.as_ref().is_some_and(|key| interested.iter().any(|c| &c.key == key) && !unchoked.contains(key));

        if self.config.max_upload_slots > 0 {
            if rotate_due || !optimistic_still_eligible {
                let pool: Vec<&PeerCandidate> = interested.iter().filter(|c| !unchoked.contains(&c.key)).copied().collect();
                self.optimistic_peer = pool.choose(rng).map(|c| c.key.clone());
            }
            if let Some(key) = &self.optimistic_peer {
                unchoked.insert(key.clone());
            }
        }

        self.rounds_elapsed = self.rounds_elapsed.wrapping_add(1);
        unchoked
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn candidate(key: &str, rate: f64, interested: bool) -> PeerCandidate {
        PeerCandidate { key: key.to_owned(), download_rate: rate, interested }
    }

    #[test]
    fn should_unchoke_the_fastest_interested_peers_up_to_regular_slots() {
        let config = ChokeManagerConfig { max_upload_slots: 3, ..ChokeManagerConfig::default() };
        let mut manager = ChokeManager::new(config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let candidates = vec![candidate("slow", 10.0, true), candidate("fast", 1000.0, true), candidate("medium", 100.0, true)];
        let unchoked = manager.run_round(&candidates, &mut rng);
        assert!(unchoked.contains("fast"));
        assert!(unchoked.contains("medium"));
    }

    #[test]
    fn should_never_unchoke_an_uninterested_peer_for_a_regular_slot() {
        let config = ChokeManagerConfig { max_upload_slots: 1, ..ChokeManagerConfig::default() };
        let mut manager = ChokeManager::new(config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let candidates = vec![candidate("bystander", 99999.0, false)];
        let unchoked = manager.run_round(&candidates, &mut rng);
        assert!(!unchoked.contains("bystander"));
    }

    #[test]
    fn should_keep_one_optimistic_slot_separate_from_regular_ranking() {
        let config = ChokeManagerConfig { max_upload_slots: 2, optimistic_rotate_every_rounds: 100, ..ChokeManagerConfig::default() };
        let mut manager = ChokeManager::new(config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let candidates = vec![candidate("best", 1000.0, true), candidate("a", 1.0, true), candidate("b", 1.0, true)];
        let unchoked = manager.run_round(&candidates, &mut rng);
        assert_eq!(unchoked.len(), 2);
        assert!(unchoked.contains("best"));
    }

    #[test]
    fn should_rotate_the_optimistic_slot_when_due() {
        let config = ChokeManagerConfig { max_upload_slots: 1, optimistic_rotate_every_rounds: 1, ..ChokeManagerConfig::default() };
        let mut manager = ChokeManager::new(config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let candidates = vec![candidate("a", 1.0, true), candidate("b", 1.0, true)];
        let first = manager.run_round(&candidates, &mut rng);
        assert_eq!(first.len(), 1);
    }
}
