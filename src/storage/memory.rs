//! In-memory `FileSystem` double for deterministic tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{FileHandle, FileSystem, OpenMode, Stat, StorageError};

type RootedPath = (String, PathBuf);

#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    files: Arc<Mutex<HashMap<RootedPath, Vec<u8>>>>,
    known_roots: Arc<Mutex<Vec<String>>>,
}

impl MemoryFileSystem {
    #[must_use]
    pub fn new(root_keys: impl IntoIterator<Item = String>) -> Self {
        Self { files: Arc::default(), known_roots: Arc::new(Mutex::new(root_keys.into_iter().collect())) }
    }

    fn check_root(&self, root_key: &str) -> Result<(), StorageError> {
        if self.known_roots.lock().iter().any(|k| k == root_key) {
            Ok(())
        } else {
            Err(StorageError::UnknownRoot(root_key.to_owned()))
        }
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn open(&self, root_key: &str, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>, StorageError> {
        self.check_root(root_key)?;
        let key = (root_key.to_owned(), path.to_path_buf());

        if mode == OpenMode::Read && !self.files.lock().contains_key(&key) {
            return Err(StorageError::NotFound(path.display().to_string()));
        }
        self.files.lock().entry(key.clone()).or_default();

        Ok(Box::new(MemoryFileHandle { files: self.files.clone(), key }))
    }

    async fn stat(&self, root_key: &str, path: &Path) -> Result<Stat, StorageError> {
        self.check_root(root_key)?;
        let key = (root_key.to_owned(), path.to_path_buf());
        let files = self.files.lock();
        let bytes = files.get(&key).ok_or_else(|| StorageError::NotFound(path.display().to_string()))?;
        Ok(Stat { len: bytes.len() as u64, is_dir: false })
    }

    async fn mkdir(&self, root_key: &str, _path: &Path) -> Result<(), StorageError> {
        self.check_root(root_key)?;
        Ok(())
    }

    async fn readdir(&self, root_key: &str, path: &Path) -> Result<Vec<String>, StorageError> {
        self.check_root(root_key)?;
        let files = self.files.lock();
        Ok(files
            .keys()
            .filter(|(root, p)| root == root_key && p.parent() == Some(path))
            .filter_map(|(_, p)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    async fn delete(&self, root_key: &str, path: &Path) -> Result<(), StorageError> {
        self.check_root(root_key)?;
        let key = (root_key.to_owned(), path.to_path_buf());
        self.files.lock().remove(&key).ok_or_else(|| StorageError::NotFound(path.display().to_string()))?;
        Ok(())
    }

    async fn exists(&self, root_key: &str, path: &Path) -> Result<bool, StorageError> {
        self.check_root(root_key)?;
        let key = (root_key.to_owned(), path.to_path_buf());
        Ok(self.files.lock().contains_key(&key))
    }
}

#[derive(Debug)]
struct MemoryFileHandle {
    files: Arc<Mutex<HashMap<RootedPath, Vec<u8>>>>,
    key: RootedPath,
}

#[async_trait]
impl FileHandle for MemoryFileHandle {
    async fn read(&mut self, buf: &mut [u8], position: u64) -> Result<usize, StorageError> {
        let files = self.files.lock();
        let bytes = files.get(&self.key).ok_or_else(|| StorageError::NotFound(self.key.1.display().to_string()))?;
        let start = position as usize;
        if start >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8], position: u64) -> Result<usize, StorageError> {
        let mut files = self.files.lock();
        let bytes = files.entry(self.key.clone()).or_default();
        let start = position as usize;
        let end = start + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        let mut files = self.files.lock();
        let bytes = files.entry(self.key.clone()).or_default();
        bytes.resize(len as usize, 0);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_round_trip_a_random_access_write_and_read() {
        let fs = MemoryFileSystem::new(["default".to_owned()]);
        let path = Path::new("file.bin");

        let mut handle = fs.open("default", path, OpenMode::ReadWrite).await.unwrap();
        handle.write(b"abcdef", 2).await.unwrap();

        let mut buf = [0u8; 4];
        let n = handle.read(&mut buf, 2).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"abcd");

        let stat = fs.stat("default", path).await.unwrap();
        assert_eq!(stat.len, 8);
    }

    #[tokio::test]
    async fn should_reject_unknown_storage_roots() {
        let fs = MemoryFileSystem::new(["default".to_owned()]);
        let result = fs.open("missing", Path::new("x"), OpenMode::Write).await;
        assert!(matches!(result, Err(StorageError::UnknownRoot(_))));
    }
}
