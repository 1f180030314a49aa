//! In-memory [`SessionStore`] double for deterministic tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{SessionStore, SessionStoreError};

#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), SessionStoreError> {
        self.entries.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionStoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SessionStoreError> {
        Ok(self.entries.lock().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn clear(&self) -> Result<(), SessionStoreError> {
        self.entries.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{SessionStoreJsonExt as _};
    use super::*;

    #[tokio::test]
    async fn should_round_trip_bytes() {
        let store = MemorySessionStore::new();
        store.set("a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(vec![1, 2, 3]));
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn should_round_trip_json() {
        let store = MemorySessionStore::new();
        store.set_json("a", &vec![1u32, 2, 3]).await.unwrap();
        let restored: Option<Vec<u32>> = store.get_json("a").await.unwrap();
        assert_eq!(restored, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn should_filter_keys_by_prefix() {
        let store = MemorySessionStore::new();
        store.set("torrent:aa:state", vec![]).await.unwrap();
        store.set("torrent:bb:state", vec![]).await.unwrap();
        store.set("torrents", vec![]).await.unwrap();
        let mut keys = store.keys("torrent:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["torrent:aa:state".to_owned(), "torrent:bb:state".to_owned()]);
    }
}
