//! Bootstrap seed nodes and periodic bucket-refresh scheduling (spec.md
//! §4.7 "Bootstrap"): populate the routing table from well-known routers,
//! then keep every bucket fresh by `find_node`-ing a random id in its range.

use std::time::Duration;

use super::routing_table::RoutingTable;

/// Well-known public bootstrap routers, queried with `find_node(self)` on
/// startup to seed the routing table (spec.md §4.7).
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] =
    &["router.bittorrent.com:6881", "router.utorrent.com:6881", "dht.transmissionbt.com:6881"];

/// A bucket not touched in this long is due for a refresh (spec.md §4.7
/// "Periodic bucket refresh").
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// One unit of bucket-refresh work: `find_node(random_in_prefix(prefix_len))`
/// against the routing table's own known nodes, to keep a stale bucket's
/// coverage populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTarget {
    pub prefix_len: u32,
}

/// Computes which buckets need refreshing right now, given the routing
/// table's last-touched timestamps.
#[must_use]
pub fn due_refreshes(table: &RoutingTable, now: Duration) -> Vec<RefreshTarget> {
    table.buckets_needing_refresh(now, REFRESH_INTERVAL).into_iter().map(|prefix_len| RefreshTarget { prefix_len }).collect()
}

#[cfg(test)]
mod tests {
    use super::super::node_id::NodeId;
    use super::super::routing_table::DhtNode;
    use super::*;

    #[test]
    fn should_flag_a_never_touched_table_as_due_for_refresh() {
        let table = RoutingTable::new(NodeId::from_bytes([0u8; 20]));
        let due = due_refreshes(&table, REFRESH_INTERVAL);
        assert_eq!(due, vec![RefreshTarget { prefix_len: 0 }]);
    }

    #[test]
    fn should_not_flag_a_recently_touched_bucket() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 20]));
        table.insert(
            DhtNode {
                id: NodeId::from_bytes([1u8; 20]),
                addr: torrentd_primitives::address::PeerAddress::new(([127, 0, 0, 1], 6881).into(), false),
                last_seen: Duration::from_secs(60),
            },
            Duration::from_secs(60),
        );
        assert!(due_refreshes(&table, Duration::from_secs(120)).is_empty());
    }
}
