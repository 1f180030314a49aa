//! File-system abstraction (spec.md §6.2).
//!
//! The engine never touches a path directly: every I/O call is scoped to a
//! `{key, label, rootId}` storage root from `torrentd_configuration::Storage`,
//! so a host can sandbox, redirect, or virtualize storage per root without
//! the engine knowing. `Tokio{FileSystem,FileHandle}` is the production
//! backend; `Memory{FileSystem,FileHandle}` backs tests that need determinism
//! without touching a real disk.

pub mod memory;
pub mod tokio_fs;

use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;

pub use memory::MemoryFileSystem;
pub use tokio_fs::TokioFileSystem;

pub const STORAGE_LOG_TARGET: &str = "STORAGE";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("unknown storage root: {0}")]
    UnknownRoot(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(err.to_string())
        } else {
            StorageError::Io(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub len: u64,
    pub is_dir: bool,
}

/// A single open file. Random-access: `read`/`write` take an explicit
/// `position` and must be O(`length`), never O(file size), since piece I/O
/// never spans the whole file.
#[async_trait]
pub trait FileHandle: Send + Sync + Debug {
    async fn read(&mut self, buf: &mut [u8], position: u64) -> Result<usize, StorageError>;

    async fn write(&mut self, buf: &[u8], position: u64) -> Result<usize, StorageError>;

    async fn sync(&mut self) -> Result<(), StorageError>;

    async fn truncate(&mut self, len: u64) -> Result<(), StorageError>;

    async fn close(&mut self) -> Result<(), StorageError>;
}

/// Injectable seam for all disk access (spec.md §6.2), scoped by storage
/// root key so the engine never sees a real filesystem path for a root it
/// wasn't handed.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open(&self, root_key: &str, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>, StorageError>;

    async fn stat(&self, root_key: &str, path: &Path) -> Result<Stat, StorageError>;

    async fn mkdir(&self, root_key: &str, path: &Path) -> Result<(), StorageError>;

    async fn readdir(&self, root_key: &str, path: &Path) -> Result<Vec<String>, StorageError>;

    async fn delete(&self, root_key: &str, path: &Path) -> Result<(), StorageError>;

    async fn exists(&self, root_key: &str, path: &Path) -> Result<bool, StorageError>;
}
