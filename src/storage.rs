// File storage consulted by the transfer state machines.
//
// Files are append-only byte sequences keyed by the name carried in the request. A file that
// exists with no content is either a zero-length file or one whose write has only just begun;
// the two are indistinguishable here, the session tracker is what knows a write is in flight.

use crate::tftp::ErrorCode;
use async_trait::async_trait;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(Debug)]
pub enum StorageError {
    NotFound(String),
    AlreadyExists(String),
    InvalidName(String),
    Io(io::Error),
}

impl StorageError {
    /// The protocol error code reported to a peer when this error ends its request.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StorageError::NotFound(_) => ErrorCode::FileNotFound,
            StorageError::AlreadyExists(_) => ErrorCode::FileAlreadyExists,
            StorageError::InvalidName(_) => ErrorCode::AccessViolation,
            StorageError::Io(e) => e.kind().into(),
        }
    }
}

impl error::Error for StorageError {}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::NotFound(name) => write!(f, "File not found: '{}'", name),
            StorageError::AlreadyExists(name) => write!(f, "File already exists: '{}'", name),
            StorageError::InvalidName(name) => write!(f, "Illegal file name: '{}'", name),
            StorageError::Io(e) => write!(f, "Storage IO error: {}", e),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A named key to bytes store. Implementations must tolerate concurrent readers alongside the
/// single appender of each file.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Creates an empty file, failing with `AlreadyExists` rather than truncating.
    async fn create(&self, name: &str) -> StorageResult<()>;

    async fn append(&self, name: &str, data: &[u8]) -> StorageResult<()>;

    async fn read(&self, name: &str) -> StorageResult<Vec<u8>>;

    async fn remove(&self, name: &str) -> StorageResult<()>;
}

/// Keeps every file in memory. Contents are lost when the server stops.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    /// Seeds a file, replacing any previous content.
    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), data.into());
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.files.read().unwrap_or_else(PoisonError::into_inner).contains_key(name))
    }

    async fn create(&self, name: &str) -> StorageResult<()> {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        if files.contains_key(name) {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        files.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn append(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        match self.files.write().unwrap_or_else(PoisonError::into_inner).get_mut(name) {
            Some(content) => {
                content.extend_from_slice(data);
                Ok(())
            }
            None => Err(StorageError::NotFound(name.to_string())),
        }
    }

    async fn read(&self, name: &str) -> StorageResult<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn remove(&self, name: &str) -> StorageResult<()> {
        match self.files.write().unwrap_or_else(PoisonError::into_inner).remove(name) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(name.to_string())),
        }
    }
}

/// Serves files from a directory on disk.
#[derive(Debug)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> DirStorage {
        DirStorage { root: root.into() }
    }

    /// Maps a requested name below the root. Clients commonly send absolute paths, so a leading
    /// `/` is dropped; anything that could climb out of the root is refused.
    fn resolve(&self, name: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        let mut has_file = false;
        for component in relative.components() {
            match component {
                Component::Normal(_) => has_file = true,
                Component::CurDir => {}
                _ => return Err(StorageError::InvalidName(name.to_string())),
            }
        }

        if !has_file {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn not_found_as(name: &str, e: io::Error) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound(name.to_string()),
        _ => StorageError::Io(e),
    }
}

#[async_trait]
impl Storage for DirStorage {
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        let path = self.resolve(name)?;
        Ok(fs::try_exists(path).await?)
    }

    async fn create(&self, name: &str) -> StorageResult<()> {
        let path = self.resolve(name)?;
        log::debug!("Creating {:#?}", path);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.resolve(name)?;
        let mut f = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| not_found_as(name, e))?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn read(&self, name: &str) -> StorageResult<Vec<u8>> {
        let path = self.resolve(name)?;
        fs::read(&path).await.map_err(|e| not_found_as(name, e))
    }

    async fn remove(&self, name: &str) -> StorageResult<()> {
        let path = self.resolve(name)?;
        fs::remove_file(&path).await.map_err(|e| not_found_as(name, e))
    }
}
