//! MSE/PE (Message Stream Encryption, Vuze-de-facto spec): wraps a raw TCP
//! transport so the wire protocol always sees a plaintext stream, while
//! peers that require encryption still accept the connection (spec.md §4.4).

pub mod dh;
pub mod handshake;
pub mod rc4_stream;
pub mod stream;

pub use handshake::{accept, initiate, Acceptance, HandshakeOutcome};
pub use stream::MseStream;

use std::time::Duration;

pub const MSE_LOG_TARGET: &str = "MSE";
pub const MSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard cap on bytes scanned while searching for a sync marker (spec.md
/// §4.4: "Sync search has a 512-byte cap; exceeding it is a failure.").
pub const MSE_SYNC_SCAN_CAP: usize = 512;

/// Crypto-methods bitfield (spec.md §6.5, §4.4): bit 0 = plaintext header
/// only, bit 1 = RC4 stream.
pub const CRYPTO_PLAINTEXT: u32 = 0x01;
pub const CRYPTO_RC4: u32 = 0x02;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MseError {
    #[error("mse handshake timed out")]
    Timeout,
    #[error("sync marker not found within the scan cap")]
    SyncNotFound,
    #[error("verification constant mismatch after decryption")]
    BadVc,
    #[error("info-hash recovered from the handshake does not match any known torrent")]
    UnknownInfoHash,
    #[error("initiator and responder share no common crypto method")]
    NoCommonMethod,
    #[error("peer rejected the requested crypto method")]
    PeerRejectedMethod,
    #[error("transport closed during handshake")]
    Closed,
}
