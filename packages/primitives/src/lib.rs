//! Primitive types shared across the `torrentd` `BitTorrent` engine.
//!
//! These are pure data types with no I/O and no async runtime dependency:
//! info hashes, peer ids, bitfields, torrent metadata (file layout and piece
//! hashes) and peer-address normalization. Everything stateful (connections,
//! state machines, schedulers) lives in the main engine crate.

pub mod address;
pub mod announce_event;
pub mod bitfield;
pub mod info_hash;
pub mod metadata;
pub mod peer_id;

/// A duration elapsed since the Unix epoch, used throughout the engine for
/// timestamps (`updated`, `lastActivity`, backoff deadlines, token rotation).
pub type DurationSinceUnixEpoch = std::time::Duration;

/// Which IP family a peer address belongs to.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug, derive_more::Display)]
pub enum IPVersion {
    /// IPv4 address.
    #[display(fmt = "IPv4")]
    IPv4,
    /// IPv6 address.
    #[display(fmt = "IPv6")]
    IPv6,
}

use serde::{Deserialize, Serialize};
