//! Name → endpoint lookup used to find the authority.
//!
//! The real location service is external; these two implementations cover
//! a single process and several processes on one host.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no endpoint published under {0:?}")]
    NotFound(String),
    #[error("directory I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed directory file: {0}")]
    Format(#[from] serde_json::Error),
}

/// Implementations may block on I/O. Async callers go through
/// `spawn_blocking` or only touch the directory at startup.
pub trait Directory: Send + Sync {
    fn publish(&self, name: &str, endpoint: &str) -> Result<(), DirectoryError>;
    fn resolve(&self, name: &str) -> Result<String, DirectoryError>;
}

/// Process-local directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for InMemoryDirectory {
    fn publish(&self, name: &str, endpoint: &str) -> Result<(), DirectoryError> {
        self.entries.write().insert(name.to_string(), endpoint.to_string());
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<String, DirectoryError> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }
}

/// Directory stored as a JSON object (`{"name": "ws://host:port"}`) on disk.
pub struct FileDirectory {
    path: PathBuf,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, DirectoryError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Directory for FileDirectory {
    fn publish(&self, name: &str, endpoint: &str) -> Result<(), DirectoryError> {
        let mut entries = self.load()?;
        entries.insert(name.to_string(), endpoint.to_string());

        // Replace via rename; readers never see a partial file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        log::debug!("Published {name} -> {endpoint} in {}", self.path.display());
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<String, DirectoryError> {
        self.load()?
            .remove(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }
}
