//! Local cache of the last known snapshot document.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Storage for the snapshot document on this device, so a game has data
/// before the first cloud fetch completes.
pub trait LocalCache {
    /// Read the document stored under `key`, if any.
    fn read(&self, key: &str) -> SyncResult<Option<String>>;
    fn write(&mut self, key: &str, document: &str) -> SyncResult<()>;
    /// Remove the document stored under `key`. Removing a missing key succeeds.
    fn clear(&mut self, key: &str) -> SyncResult<()>;
}

/// Cache backed by one file per key in a directory.
///
/// Documents are written base64 encoded. Reads accept either base64 or a
/// plain JSON document.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.sav", key))
    }
}

impl LocalCache for FileCache {
    fn read(&self, key: &str) -> SyncResult<Option<String>> {
        let contents = match fs::read_to_string(self.path(key)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.starts_with('{') {
            return Ok(Some(trimmed.to_string()));
        }

        let bytes = STANDARD
            .decode(trimmed)
            .map_err(|e| SyncError::Io(format!("cache file for '{}' is not base64: {}", key, e)))?;
        let document = String::from_utf8(bytes)
            .map_err(|e| SyncError::Io(format!("cache file for '{}' is not UTF-8: {}", key, e)))?;
        Ok(Some(document))
    }

    fn write(&mut self, key: &str, document: &str) -> SyncResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path(key), STANDARD.encode(document.as_bytes()))?;
        debug!(key, bytes = document.len(), "Wrote local cache");
        Ok(())
    }

    fn clear(&mut self, key: &str) -> SyncResult<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
