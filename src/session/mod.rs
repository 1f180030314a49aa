//! Session persistence (spec.md §4.8, §6.4): the torrent list, per-torrent
//! state (user state, bitfield hex, counters) and binary blobs (`.torrent`
//! bytes, info dictionaries), addressed under the key prefixes `torrents`,
//! `torrent:<hex>:state`, `torrent:<hex>:file`, `torrent:<hex>:info`.
//!
//! Writes are synchronous on every user action and every verified piece —
//! deliberately not debounced (spec.md §9: "a debounced writer racing with
//! `stop` can lose the final state"). `SessionStore` is the injectable seam;
//! `MemorySessionStore` backs tests, `FileSessionStore` is the production
//! backend, storing each key as one file under a root directory (matching
//! the shape of `torrentd_configuration::Storage`'s opaque root handling,
//! without requiring the full `FileSystem` abstraction for what is, at
//! bottom, a flat key-value store).

pub mod memory;
pub mod store_fs;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use torrentd_primitives::info_hash::InfoHash;

pub use memory::MemorySessionStore;
pub use store_fs::{FileSessionStore, FileSessionStoreError};

pub const SESSION_LOG_TARGET: &str = "SESSION";

/// Key under which the torrent list (`Vec<TorrentListEntry>`) is stored.
pub const KEY_TORRENTS: &str = "torrents";

#[must_use]
pub fn key_state(info_hash: &InfoHash) -> String {
    format!("torrent:{}:state", info_hash.to_hex_string())
}

#[must_use]
pub fn key_file(info_hash: &InfoHash) -> String {
    format!("torrent:{}:file", info_hash.to_hex_string())
}

#[must_use]
pub fn key_info(info_hash: &InfoHash) -> String {
    format!("torrent:{}:info", info_hash.to_hex_string())
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("failed to (de)serialize json for key `{key}`: {source}")]
    Json { key: String, source: String },
}

/// Binary key-value store plus a typed JSON helper (spec.md §6.4). Keys are
/// UTF-8 strings; for the same key, later writes overwrite earlier ones
/// without merging (spec.md §5: "serially consistent... no merge").
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), SessionStoreError>;

    async fn delete(&self, key: &str) -> Result<(), SessionStoreError>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SessionStoreError>;

    async fn clear(&self) -> Result<(), SessionStoreError>;
}

/// `getJson`/`setJson` (spec.md §6.4), implemented once over any
/// [`SessionStore`] rather than duplicated per backend.
#[async_trait]
pub trait SessionStoreJsonExt: SessionStore {
    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SessionStoreError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SessionStoreError::Json { key: key.to_owned(), source: e.to_string() }),
        }
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), SessionStoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| SessionStoreError::Json { key: key.to_owned(), source: e.to_string() })?;
        self.set(key, bytes).await
    }
}

impl<S: SessionStore + ?Sized> SessionStoreJsonExt for S {}

/// How the torrent was originally added (spec.md §3 `SessionState`).
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TorrentSource {
    File,
    Magnet,
}

/// One entry in the persisted torrent list (spec.md §3 `SessionState`).
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TorrentListEntry {
    pub info_hash: InfoHash,
    pub source: TorrentSource,
    pub magnet_uri: Option<String>,
    pub added_at: Duration,
}

/// User-visible lifecycle state (spec.md §4.1).
#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Active,
    Stopped,
    Completed,
    Seeding,
    /// A transient storage failure occurred (spec.md §7 "Storage: ... pause
    /// torrent ... user action required"); maintenance, dialing, announces
    /// and DHT lookups are all suspended until the host calls
    /// [`crate::Engine::start_torrent`] again.
    Paused,
}

/// Per-torrent persisted state (spec.md §3 `SessionState`). `version` lets a
/// host detect and migrate old persisted records later; it is not used by
/// the engine itself (SPEC_FULL.md §3 supplement).
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PersistedTorrentState {
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub user_state: UserState,
    pub storage_key: String,
    pub queue_position: Option<u32>,
    pub bitfield_hex: Option<String>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub updated_at: Duration,
}

fn default_schema_version() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_build_the_documented_key_prefixes() {
        let hash = InfoHash::from([0xABu8; 20]);
        assert_eq!(key_state(&hash), format!("torrent:{}:state", hash.to_hex_string()));
        assert_eq!(key_file(&hash), format!("torrent:{}:file", hash.to_hex_string()));
        assert_eq!(key_info(&hash), format!("torrent:{}:info", hash.to_hex_string()));
    }

    #[test]
    fn should_round_trip_every_user_state_through_json() {
        for state in [UserState::Active, UserState::Stopped, UserState::Completed, UserState::Seeding, UserState::Paused] {
            let encoded = serde_json::to_string(&state).unwrap();
            let decoded: UserState = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, state);
        }
        assert_eq!(serde_json::to_string(&UserState::Paused).unwrap(), "\"paused\"");
    }
}
