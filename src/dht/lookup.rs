//! Iterative `get_peers` lookup (spec.md §4.7, test scenario "DHT iterative
//! lookup convergence"). Pure state machine: the caller drives it by asking
//! for the next batch to query and feeding back responses or timeouts, which
//! keeps it testable without a real socket.

use std::collections::HashMap;
use std::time::Duration;

use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::info_hash::InfoHash;

use super::compact::{decode_nodes, decode_peer, CompactNode};
use super::krpc::Response;
use super::node_id::{Distance, NodeId};
use super::routing_table::DhtNode;

/// Candidates queried per round (spec.md §4.7 step 1).
pub const ALPHA: usize = 3;
/// How many of the closest responded candidates define convergence.
pub const K: usize = super::routing_table::K;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Unqueried,
    Queried,
    Responded,
}

struct Candidate {
    node: DhtNode,
    status: Status,
}

pub struct Lookup {
    local_id: NodeId,
    target: NodeId,
    candidates: HashMap<String, Candidate>,
    peers: HashMap<String, PeerAddress>,
    tokens: HashMap<String, Vec<u8>>,
    queried_count: usize,
}

#[derive(Debug, Clone)]
pub struct LookupResult {
    pub peers: Vec<PeerAddress>,
    pub tokens: HashMap<String, Vec<u8>>,
    pub queried_count: usize,
}

impl Lookup {
    /// Seeds the candidate set from the routing table's K closest nodes to
    /// `target` (spec.md §4.7: "for an info-hash", here keyed off its bytes).
    #[must_use]
    pub fn new(local_id: NodeId, info_hash: &InfoHash, seeds: Vec<DhtNode>) -> Self {
        let target = NodeId::from_slice(&info_hash.bytes()).expect("info-hash is 20 bytes, same as a node id");
        let mut candidates = HashMap::new();
        for node in seeds {
            if node.id == local_id {
                continue;
            }
            candidates.insert(node.addr.address_key(), Candidate { node, status: Status::Unqueried });
        }
        Self { local_id, target, candidates, peers: HashMap::new(), tokens: HashMap::new(), queried_count: 0 }
    }

    /// Takes up to `ALPHA` unqueried candidates, closest-first, and marks
    /// them queried. An empty return means there's nothing left to do this
    /// round (either converged or all candidates are pending/responded).
    pub fn next_batch(&mut self) -> Vec<DhtNode> {
        let mut unqueried: Vec<&mut Candidate> =
            self.candidates.values_mut().filter(|c| c.status == Status::Unqueried).collect();
        unqueried.sort_by_key(|c| self.target.distance(&c.node.id));
        let batch: Vec<DhtNode> = unqueried.into_iter().take(ALPHA).map(|c| {
            c.status = Status::Queried;
            c.node.clone()
        }).collect();
        self.queried_count += batch.len();
        batch
    }

    /// Applies a successful response from `from`: records its token,
    /// merges in discovered peers and candidate nodes (spec.md §4.7 step 3).
    pub fn on_response(&mut self, from: &DhtNode, response: &Response) {
        let key = from.addr.address_key();
        if let Some(candidate) = self.candidates.get_mut(&key) {
            candidate.status = Status::Responded;
        }
        if let Some(token) = &response.token {
            self.tokens.insert(key, token.clone().into_vec());
        }
        if let Some(values) = &response.values {
            for raw in values {
                if let Ok(peer) = decode_peer(raw) {
                    self.peers.insert(peer.address_key(), peer);
                }
            }
        }
        if let Some(raw_nodes) = &response.nodes {
            if let Ok(nodes) = decode_nodes(raw_nodes) {
                for CompactNode { id, addr } in nodes {
                    if id == self.local_id {
                        continue;
                    }
                    let dht_node = DhtNode { id, addr: PeerAddress::new(addr.into(), false), last_seen: Duration::ZERO };
                    self.candidates.entry(dht_node.addr.address_key()).or_insert(Candidate { node: dht_node, status: Status::Unqueried });
                }
            }
        }
    }

    /// A candidate that never responded stays `Queried` forever: it counts
    /// toward `queried_count` but never gates convergence (spec.md §4.7,
    /// "an unresponsive candidate set never prevents termination").
    pub fn on_timeout(&mut self, _from: &DhtNode) {}

    /// Convergence per spec.md §4.7 step 4: the K closest *responded*
    /// candidates are all closer than any remaining *unqueried* candidate,
    /// or there are no unqueried candidates left.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        let mut unqueried: Vec<Distance> = self
            .candidates
            .values()
            .filter(|c| c.status == Status::Unqueried)
            .map(|c| self.target.distance(&c.node.id))
            .collect();
        if unqueried.is_empty() {
            return true;
        }
        unqueried.sort_unstable();
        let closest_unqueried = unqueried[0];

        let mut responded: Vec<Distance> =
            self.candidates.values().filter(|c| c.status == Status::Responded).map(|c| self.target.distance(&c.node.id)).collect();
        responded.sort_unstable();
        if responded.len() < K {
            return false;
        }
        responded[K - 1] < closest_unqueried
    }

    #[must_use]
    pub fn into_result(self) -> LookupResult {
        LookupResult { peers: self.peers.into_values().collect(), tokens: self.tokens, queried_count: self.queried_count }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::super::compact;
    use super::*;

    fn node(id_byte: u8, port: u16) -> DhtNode {
        DhtNode {
            id: NodeId::from_bytes([id_byte; 20]),
            addr: PeerAddress::new(SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), port), false),
            last_seen: Duration::ZERO,
        }
    }

    #[test]
    fn should_take_at_most_alpha_candidates_per_round() {
        let local = NodeId::from_bytes([0u8; 20]);
        let info_hash = InfoHash::from([1u8; 20]);
        let seeds: Vec<DhtNode> = (1..=10u8).map(|i| node(i, 6881)).collect();
        let mut lookup = Lookup::new(local, &info_hash, seeds);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), ALPHA);
    }

    #[test]
    fn should_converge_once_no_unqueried_candidates_remain() {
        let local = NodeId::from_bytes([0u8; 20]);
        let info_hash = InfoHash::from([1u8; 20]);
        let seeds: Vec<DhtNode> = (1..=3u8).map(|i| node(i, 6881)).collect();
        let mut lookup = Lookup::new(local, &info_hash, seeds);
        assert!(!lookup.is_converged());
        let batch = lookup.next_batch();
        for candidate in &batch {
            lookup.on_response(candidate, &Response { id: candidate.id.bytes().to_vec(), ..Default::default() });
        }
        assert!(lookup.is_converged());
    }

    #[test]
    fn should_merge_discovered_peers_deduped_by_address() {
        let local = NodeId::from_bytes([0u8; 20]);
        let info_hash = InfoHash::from([1u8; 20]);
        let seeds = vec![node(1, 6881)];
        let mut lookup = Lookup::new(local, &info_hash, seeds.clone());
        let batch = lookup.next_batch();
        let mut values = vec![];
        values.extend(compact::encode_peer(PeerAddress::new(SocketAddr::new(Ipv4Addr::new(192, 168, 1, 1).into(), 51413), false)));
        let response = Response {
            id: batch[0].id.bytes().to_vec(),
            token: Some(serde_bytes::ByteBuf::from(vec![1, 2, 3, 4])),
            nodes: None,
            values: Some(vec![serde_bytes::ByteBuf::from(values)]),
        };
        lookup.on_response(&batch[0], &response);
        let result = lookup.into_result();
        assert_eq!(result.peers.len(), 1);
        assert_eq!(result.tokens.len(), 1);
    }

    #[test]
    fn should_not_let_an_unresponsive_candidate_block_convergence() {
        let local = NodeId::from_bytes([0u8; 20]);
        let info_hash = InfoHash::from([1u8; 20]);
        let seeds: Vec<DhtNode> = (1..=3u8).map(|i| node(i, 6881)).collect();
        let mut lookup = Lookup::new(local, &info_hash, seeds);
        let batch = lookup.next_batch();
        for candidate in batch.iter().skip(1) {
            lookup.on_response(candidate, &Response { id: candidate.id.bytes().to_vec(), ..Default::default() });
        }
        lookup.on_timeout(&batch[0]);
        assert!(lookup.is_converged());
    }
}
