//! Top-level error types for the engine (spec.md §7).
//!
//! Subsystem errors are modeled as their own `thiserror` enums close to
//! where they are produced (`crate::mse::MseError`, `crate::tracker::TrackerError`,
//! `crate::dht::krpc::KrpcError`, ...) and convert into [`EngineError`] only
//! at the point they cross into a `Torrent`/`Engine`-level event, mirroring
//! the propagation policy in spec.md §7: most errors are recovered locally
//! (closed connection, retried tracker, cleared DHT transaction) and never
//! reach this type at all.

use torrentd_primitives::info_hash::InfoHash;

use crate::mse::MseError;
use crate::storage::StorageError;
use crate::wire::ProtocolError;

/// The kind of error surfaced on a `Torrent`'s `error(kind, message)` event
/// (spec.md §6.6, §7).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("protocol error for torrent {info_hash}: {source}")]
    Protocol { info_hash: InfoHash, source: ProtocolError },

    #[error("encryption error for torrent {info_hash}: {source}")]
    Encryption { info_hash: InfoHash, source: MseError },

    #[error("storage error for torrent {info_hash}: {source}")]
    Storage { info_hash: InfoHash, source: StorageError },

    #[error("metadata hash mismatch for torrent {info_hash}")]
    MetadataHashMismatch { info_hash: InfoHash },

    #[error("no known torrent for info-hash {info_hash}")]
    UnknownTorrent { info_hash: InfoHash },
}

impl EngineError {
    /// The `kind` string carried by the `error(kind, message)` event
    /// (spec.md §6.6): `"protocol"`, `"encryption"`, `"storage"`, `"metadata"`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Protocol { .. } => "protocol",
            EngineError::Encryption { .. } => "encryption",
            EngineError::Storage { .. } => "storage",
            EngineError::MetadataHashMismatch { .. } => "metadata",
            EngineError::UnknownTorrent { .. } => "metadata",
        }
    }

    #[must_use]
    pub fn info_hash(&self) -> InfoHash {
        match self {
            EngineError::Protocol { info_hash, .. }
            | EngineError::Encryption { info_hash, .. }
            | EngineError::Storage { info_hash, .. }
            | EngineError::MetadataHashMismatch { info_hash }
            | EngineError::UnknownTorrent { info_hash } => *info_hash,
        }
    }
}

/// Fatal startup conditions (spec.md §7: "Engine-level fatal conditions...
/// prevent the Engine from reaching the ready state").
#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("failed to bind listening socket on port {port}: {source}")]
    ListenBindFailed { port: u16, source: std::io::Error },

    #[error("invalid engine configuration: {0}")]
    InvalidConfiguration(#[from] torrentd_configuration::SemanticValidationError),
}
