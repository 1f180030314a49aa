//! Tokio-backed `FileSystem`, grounded in `torrentd_configuration::Storage`'s
//! `{key, label, rootId}` model: each root key resolves to a base directory
//! and every path argument is joined under it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use super::{FileHandle, FileSystem, OpenMode, Stat, StorageError, STORAGE_LOG_TARGET};

#[derive(Debug, Clone, Default)]
pub struct TokioFileSystem {
    roots: HashMap<String, PathBuf>,
}

impl TokioFileSystem {
    #[must_use]
    pub fn new(roots: HashMap<String, PathBuf>) -> Self {
        Self { roots }
    }

    fn resolve(&self, root_key: &str, path: &Path) -> Result<PathBuf, StorageError> {
        let root = self.roots.get(root_key).ok_or_else(|| StorageError::UnknownRoot(root_key.to_owned()))?;
        Ok(root.join(path))
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn open(&self, root_key: &str, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>, StorageError> {
        let full_path = self.resolve(root_key, path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::Write => {
                options.write(true).create(true);
            }
            OpenMode::ReadWrite => {
                options.read(true).write(true).create(true);
            }
        }

        let file = options.open(&full_path).await?;
        tracing::debug!(target: STORAGE_LOG_TARGET, root_key, path = %full_path.display(), "file opened");
        Ok(Box::new(TokioFileHandle { file }))
    }

    async fn stat(&self, root_key: &str, path: &Path) -> Result<Stat, StorageError> {
        let full_path = self.resolve(root_key, path)?;
        let metadata = tokio::fs::metadata(&full_path).await?;
        Ok(Stat { len: metadata.len(), is_dir: metadata.is_dir() })
    }

    async fn mkdir(&self, root_key: &str, path: &Path) -> Result<(), StorageError> {
        let full_path = self.resolve(root_key, path)?;
        tokio::fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    async fn readdir(&self, root_key: &str, path: &Path) -> Result<Vec<String>, StorageError> {
        let full_path = self.resolve(root_key, path)?;
        let mut entries = tokio::fs::read_dir(&full_path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn delete(&self, root_key: &str, path: &Path) -> Result<(), StorageError> {
        let full_path = self.resolve(root_key, path)?;
        tokio::fs::remove_file(&full_path).await?;
        Ok(())
    }

    async fn exists(&self, root_key: &str, path: &Path) -> Result<bool, StorageError> {
        let full_path = self.resolve(root_key, path)?;
        Ok(tokio::fs::try_exists(&full_path).await?)
    }
}

#[derive(Debug)]
struct TokioFileHandle {
    file: tokio::fs::File,
}

#[async_trait]
impl FileHandle for TokioFileHandle {
    async fn read(&mut self, buf: &mut [u8], position: u64) -> Result<usize, StorageError> {
        self.file.seek(SeekFrom::Start(position)).await?;
        let n = self.file.read(buf).await?;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8], position: u64) -> Result<usize, StorageError> {
        self.file.seek(SeekFrom::Start(position)).await?;
        self.file.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all().await?;
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        self.file.set_len(len).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.file.flush().await?;
        Ok(())
    }
}
