//! Transaction manager (spec.md §4.7 "Transaction manager"): a pending map
//! keyed by the 2-byte transaction id, timing entries out after 5 seconds
//! and silently dropping replies to unknown ids instead of panicking.

use std::collections::HashMap;
use std::time::Duration;

use torrentd_primitives::address::PeerAddress;

use super::krpc::{Query, Response};

/// Default per-query timeout (spec.md §4.7).
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub target: PeerAddress,
    pub query: Query,
    pub sent_at: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Response(Response),
    Timeout,
}

/// Tracks in-flight KRPC queries by a wrap-around 16-bit counter encoded as
/// 2 raw bytes, matching BEP 5's `t` field convention.
pub struct TransactionManager {
    next_id: u16,
    pending: HashMap<[u8; 2], Pending>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: 0, pending: HashMap::new() }
    }

    /// Allocates a fresh transaction id and records the pending query.
    /// Returns the 2-byte id to embed in the outgoing [`Envelope`].
    ///
    /// [`Envelope`]: super::krpc::Envelope
    pub fn start(&mut self, target: PeerAddress, query: Query, sent_at: Duration) -> [u8; 2] {
        let id = self.next_id.to_be_bytes();
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.insert(id, Pending { target, query, sent_at });
        id
    }

    /// Resolves a reply's transaction id against the pending map. Returns
    /// `None` for an unknown id — the caller must silently drop the packet
    /// rather than treat it as an error (spec.md §4.7).
    #[must_use]
    pub fn resolve(&mut self, transaction_id: &[u8]) -> Option<Pending> {
        let key: [u8; 2] = transaction_id.try_into().ok()?;
        self.pending.remove(&key)
    }

    /// Drains every pending query whose `sent_at` is older than
    /// `QUERY_TIMEOUT`, returning them so the caller can fire `Timeout`
    /// callbacks.
    pub fn drain_timed_out(&mut self, now: Duration) -> Vec<([u8; 2], Pending)> {
        let expired: Vec<[u8; 2]> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_sub(pending.sent_at) >= QUERY_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        expired.into_iter().filter_map(|id| self.pending.remove(&id).map(|p| (id, p))).collect()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn addr() -> PeerAddress {
        PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], 6881)), false)
    }

    fn ping() -> Query {
        Query::Ping { id: vec![1u8; 20] }
    }

    #[test]
    fn should_resolve_a_pending_transaction_exactly_once() {
        let mut manager = TransactionManager::new();
        let id = manager.start(addr(), ping(), Duration::ZERO);
        assert!(manager.resolve(&id).is_some());
        assert!(manager.resolve(&id).is_none());
    }

    #[test]
    fn should_silently_fail_to_resolve_an_unknown_transaction_id() {
        let mut manager = TransactionManager::new();
        assert!(manager.resolve(&[9, 9]).is_none());
    }

    #[test]
    fn should_wrap_around_the_id_counter() {
        let mut manager = TransactionManager { next_id: u16::MAX, pending: HashMap::new() };
        let first = manager.start(addr(), ping(), Duration::ZERO);
        let second = manager.start(addr(), ping(), Duration::ZERO);
        assert_eq!(first, u16::MAX.to_be_bytes());
        assert_eq!(second, 0u16.to_be_bytes());
    }

    #[test]
    fn should_time_out_pending_queries_after_the_default_window() {
        let mut manager = TransactionManager::new();
        manager.start(addr(), ping(), Duration::ZERO);
        assert!(manager.drain_timed_out(QUERY_TIMEOUT - Duration::from_secs(1)).is_empty());
        let timed_out = manager.drain_timed_out(QUERY_TIMEOUT);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(manager.pending_count(), 0);
    }
}
