//! Durable storage for working memory
//!
//! [`JsonFileStore`] keeps the whole log as a pretty-printed JSON array and
//! replaces it atomically on every save.

use crate::entry::MemoryEntry;
use crate::error::MemoryError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Storage backend for memory entries
#[async_trait]
pub trait MemoryStore: Send + Sync + fmt::Debug {
    /// Load every stored entry in append order
    async fn load(&self) -> Result<Vec<MemoryEntry>, MemoryError>;

    /// Replace the stored log with `entries`
    async fn save(&self, entries: &[MemoryEntry]) -> Result<(), MemoryError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Open the store, creating parent directories and an empty log if needed
    ///
    /// # Errors
    /// Returns `MemoryError::Io` if the directory or file cannot be created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MemoryError::io(parent, e))?;
        }
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| MemoryError::io(&path, e))?
        {
            tokio::fs::write(&path, b"[]")
                .await
                .map_err(|e| MemoryError::io(&path, e))?;
            tracing::debug!(path = %path.display(), "created empty memory file");
        }
        Ok(Self { path })
    }

    /// Backing file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), MemoryError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| MemoryError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| MemoryError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| MemoryError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| MemoryError::io(path, e.error))?;
    Ok(())
}

#[async_trait]
impl MemoryStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<MemoryEntry>, MemoryError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::io(&self.path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "memory file unreadable; starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, entries: &[MemoryEntry]) -> Result<(), MemoryError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| MemoryError::Task(e.to_string()))?
    }
}

/// Volatile store for tests and memory-less runs
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<Vec<MemoryEntry>>,
    saves: Mutex<usize>,
}

impl InMemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `entries`
    #[must_use]
    pub fn with_entries(entries: Vec<MemoryEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            saves: Mutex::new(0),
        }
    }

    /// Number of completed saves
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn load(&self) -> Result<Vec<MemoryEntry>, MemoryError> {
        Ok(self.entries.lock().clone())
    }

    async fn save(&self, entries: &[MemoryEntry]) -> Result<(), MemoryError> {
        *self.entries.lock() = entries.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}
