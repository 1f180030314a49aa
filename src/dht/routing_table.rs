//! Kademlia routing table: a binary tree of buckets partitioned by distance
//! from the local node-id (spec.md §4.7, §6.5 "RoutingTable").

use std::time::Duration;

use torrentd_clock::clock::Time;
use torrentd_primitives::address::PeerAddress;

use super::node_id::NodeId;

/// Bucket capacity (spec.md §4.7 "up to K=8 nodes").
pub const K: usize = 8;

/// A bucket's occupant is considered questionable once it hasn't been seen
/// for this long, making it eligible for replacement (spec.md §4.7 step 4).
pub const QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtNode {
    pub id: NodeId,
    pub addr: PeerAddress,
    pub last_seen: Duration,
}

/// Outcome of [`RoutingTable::insert`]: most variants ask the caller to take
/// an action the table itself cannot (pinging requires network I/O).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The node was placed (either fresh or refreshing an existing entry).
    Inserted,
    /// The bucket was full and unsplittable; the caller should `ping` the
    /// named oldest occupant and retry the insert on timeout/failure.
    PingOldest(DhtNode),
    /// The bucket was full, unsplittable, and had no questionable occupant;
    /// the new node is dropped.
    Dropped,
}

struct Bucket {
    /// Shared-prefix-length range this bucket covers: `[prefix_len, ..)`.
    prefix_len: u32,
    nodes: Vec<DhtNode>,
}

impl Bucket {
    fn new(prefix_len: u32) -> Self {
        Self { prefix_len, nodes: Vec::with_capacity(K) }
    }

    fn covers(&self, local: &NodeId, candidate: &NodeId) -> bool {
        local.shared_prefix_len(candidate) >= self.prefix_len
    }
}

/// Binary tree of buckets. Buckets are stored as a flat `Vec` ordered by
/// `prefix_len`; splitting a bucket replaces it with two narrower ones.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    #[must_use]
    pub fn new(local_id: NodeId) -> Self {
        Self { local_id, buckets: vec![Bucket::new(0)] }
    }

    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_index_for(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .enumerate()
            .rev()
            .find(|(_, bucket)| bucket.covers(&self.local_id, id))
            .map_or(0, |(i, _)| i)
    }

    /// Attempts to insert or refresh `node`'s last-seen time.
    ///
    /// Follows spec.md §4.7's five-step insertion rule. `now` is injected so
    /// this stays testable without a live clock.
    pub fn insert(&mut self, node: DhtNode, now: Duration) -> InsertOutcome {
        if node.id == self.local_id {
            return InsertOutcome::Dropped;
        }

        let index = self.bucket_index_for(&node.id);
        if let Some(existing) = self.buckets[index].nodes.iter_mut().find(|n| n.id == node.id) {
            existing.last_seen = now;
            existing.addr = node.addr;
            return InsertOutcome::Inserted;
        }

        if self.buckets[index].nodes.len() < K {
            self.buckets[index].nodes.push(node);
            return InsertOutcome::Inserted;
        }

        if self.bucket_covers_local_prefix(index) {
            self.split(index);
            return self.insert(node, now);
        }

        if let Some(stale_pos) = self.buckets[index]
            .nodes
            .iter()
            .position(|n| now.saturating_sub(n.last_seen) >= QUESTIONABLE_AFTER)
        {
            let oldest = self.buckets[index].nodes[stale_pos].clone();
            return InsertOutcome::PingOldest(oldest);
        }

        InsertOutcome::Dropped
    }

    /// Evicts `stale` from its bucket and places `replacement` in its stead;
    /// called after a `PingOldest` ping times out.
    pub fn replace(&mut self, stale: &NodeId, replacement: DhtNode, now: Duration) {
        let index = self.bucket_index_for(stale);
        self.buckets[index].nodes.retain(|n| &n.id != stale);
        if self.buckets[index].nodes.len() < K {
            self.buckets[index].nodes.push(replacement);
        } else {
            self.insert(replacement, now);
        }
    }

    /// True iff bucket `index` is the one the local id itself would route
    /// into — only that bucket is allowed to keep splitting (spec.md §4.7
    /// step 3: "contains the local id's prefix").
    fn bucket_covers_local_prefix(&self, index: usize) -> bool {
        self.bucket_index_for(&self.local_id) == index
    }

    fn split(&mut self, index: usize) {
        let old = &self.buckets[index];
        let new_prefix_len = old.prefix_len + 1;
        let mut near = Bucket::new(new_prefix_len);
        let mut far = Bucket::new(old.prefix_len);
        for node in &self.buckets[index].nodes {
            if self.local_id.shared_prefix_len(&node.id) >= new_prefix_len {
                near.nodes.push(node.clone());
            } else {
                far.nodes.push(node.clone());
            }
        }
        self.buckets.splice(index..=index, [far, near]);
    }

    /// Returns up to `count` nodes closest to `target`, sorted by ascending
    /// XOR distance (used to seed an iterative lookup, spec.md §4.7).
    #[must_use]
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<DhtNode> {
        let mut all: Vec<&DhtNode> = self.buckets.iter().flat_map(|b| b.nodes.iter()).collect();
        all.sort_by_key(|node| target.distance(&node.id));
        all.into_iter().take(count).cloned().collect()
    }

    /// Every bucket's covering prefix length and the time it was last
    /// touched, for periodic-refresh scheduling (spec.md §4.7 "15 minutes").
    #[must_use]
    pub fn buckets_needing_refresh(&self, now: Duration, refresh_after: Duration) -> Vec<u32> {
        self.buckets
            .iter()
            .filter(|bucket| {
                let last_touch = bucket.nodes.iter().map(|n| n.last_seen).max().unwrap_or(Duration::ZERO);
                now.saturating_sub(last_touch) >= refresh_after
            })
            .map(|bucket| bucket.prefix_len)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[must_use]
pub fn now() -> Duration {
    torrentd_clock::clock::Working::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id_byte: u8, port: u16) -> DhtNode {
        DhtNode {
            id: NodeId::from_bytes([id_byte; 20]),
            addr: PeerAddress::new(([127, 0, 0, 1], port).into(), false),
            last_seen: Duration::from_secs(0),
        }
    }

    #[test]
    fn should_insert_into_the_single_bucket_while_under_capacity() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 20]));
        for i in 1..=K as u8 {
            assert_eq!(table.insert(node(i, 6881), Duration::ZERO), InsertOutcome::Inserted);
        }
        assert_eq!(table.len(), K);
    }

    #[test]
    fn should_refresh_an_existing_node_rather_than_duplicate_it() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 20]));
        table.insert(node(1, 6881), Duration::ZERO);
        let outcome = table.insert(node(1, 6882), Duration::from_secs(60));
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn should_drop_self_id() {
        let local = NodeId::from_bytes([9u8; 20]);
        let mut table = RoutingTable::new(local);
        assert_eq!(table.insert(DhtNode { id: local, addr: node(1, 1).addr, last_seen: Duration::ZERO }, Duration::ZERO), InsertOutcome::Dropped);
    }

    #[test]
    fn should_return_nodes_sorted_by_xor_distance() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 20]));
        for i in 1..=5u8 {
            table.insert(node(i, 6881), Duration::ZERO);
        }
        let target = NodeId::from_bytes([3u8; 20]);
        let closest = table.closest(&target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, NodeId::from_bytes([3u8; 20]));
    }

    #[test]
    fn should_ping_oldest_when_bucket_is_full_and_unsplittable() {
        // All ids share bit pattern with the local id's opposite so the bucket
        // covering them never covers the local prefix; fill past K then push once more.
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);
        for i in 0..K as u8 {
            let mut bytes = [0xFFu8; 20];
            bytes[19] = i;
            table.insert(DhtNode { id: NodeId::from_bytes(bytes), addr: node(0, 6881).addr, last_seen: Duration::ZERO }, Duration::ZERO);
        }
        let mut extra_bytes = [0xFFu8; 20];
        extra_bytes[19] = 200;
        let extra = DhtNode { id: NodeId::from_bytes(extra_bytes), addr: node(0, 6881).addr, last_seen: Duration::ZERO };
        let outcome = table.insert(extra, Duration::from_secs(20 * 60));
        assert!(matches!(outcome, InsertOutcome::PingOldest(_)));
    }
}
