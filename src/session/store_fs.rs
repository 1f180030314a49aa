//! Production [`SessionStore`] backend: one file per key under a root
//! directory. Keys are hex-encoded before becoming file names so arbitrary
//! UTF-8 keys (including the `:`-separated prefixes in spec.md §6.4) never
//! collide with path separators.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{SessionStore, SessionStoreError};

pub struct FileSessionStore {
    root: PathBuf,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FileSessionStoreError {
    #[error("failed to create session store root {path}: {source}")]
    CreateRoot { path: String, source: String },
}

impl FileSessionStore {
    /// # Errors
    ///
    /// Returns [`FileSessionStoreError::CreateRoot`] if `root` cannot be
    /// created.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, FileSessionStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| FileSessionStoreError::CreateRoot { path: root.display().to_string(), source: e.to_string() })?;
        Ok(Self { root })
    }

    fn file_name_for(key: &str) -> String {
        let mut out = vec![0u8; key.len() * 2];
        binascii::bin2hex(key.as_bytes(), &mut out).expect("buffer sized for exact hex length");
        String::from_utf8(out).expect("hex output is always valid utf-8")
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(Self::file_name_for(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        let mut bytes = vec![0u8; file_name.len() / 2];
        binascii::hex2bin(file_name.as_bytes(), &mut bytes).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionStoreError::Io(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), SessionStoreError> {
        fs::write(self.path_for(key), value).await.map_err(|e| SessionStoreError::Io(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), SessionStoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SessionStoreError> {
        let mut out = Vec::new();
        let mut dir = fs::read_dir(&self.root).await.map_err(|e| SessionStoreError::Io(e.to_string()))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| SessionStoreError::Io(e.to_string()))? {
            if let Some(key) = self.key_for(&entry.path()) {
                if key.starts_with(prefix) {
                    out.push(key);
                }
            }
        }
        Ok(out)
    }

    async fn clear(&self) -> Result<(), SessionStoreError> {
        let mut dir = fs::read_dir(&self.root).await.map_err(|e| SessionStoreError::Io(e.to_string()))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| SessionStoreError::Io(e.to_string()))? {
            let _ = fs::remove_file(entry.path()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        store.set("torrent:aa:state", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("torrent:aa:state").await.unwrap(), Some(vec![1, 2, 3]));
        let keys = store.keys("torrent:").await.unwrap();
        assert_eq!(keys, vec!["torrent:aa:state".to_owned()]);
        store.delete("torrent:aa:state").await.unwrap();
        assert_eq!(store.get("torrent:aa:state").await.unwrap(), None);
    }
}
