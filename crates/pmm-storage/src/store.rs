//! Atomic store with revision rotation.
//!
//! A put serializes into `<key>.tmp` in the key's directory, rotates
//! the existing revision chain (`<key>` becomes `<key>.0`, `<key>.0`
//! becomes `<key>.1`, ...), then renames the temp file over `<key>`.
//! A crash at any point leaves the previous chain intact. Loading
//! falls back through the chain until something decodes.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Pretty-printed JSON, for states an operator may want to read.
    Json,
    /// Compact binary encoding.
    Binary,
}

impl Format {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(match self {
            Format::Json => serde_json::to_vec_pretty(value)?,
            Format::Binary => bincode::serialize(value)?,
        })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(match self {
            Format::Json => serde_json::from_slice(bytes)?,
            Format::Binary => bincode::deserialize(bytes)?,
        })
    }
}

enum Backend {
    File { path: PathBuf, revisions: usize },
    Memory(Arc<Mutex<Option<Vec<u8>>>>),
}

/// Store for one key.
pub struct Storage {
    format: Format,
    backend: Backend,
}

impl Storage {
    /// Backtests and tests commit here instead of to disk.
    pub fn memory(format: Format) -> Self {
        Self {
            format,
            backend: Backend::Memory(Arc::new(Mutex::new(None))),
        }
    }

    /// Replace the stored value atomically.
    pub fn put<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = self.format.encode(value)?;
        match &self.backend {
            Backend::Memory(cell) => {
                *cell.lock() = Some(bytes);
                Ok(())
            }
            Backend::File { path, revisions } => {
                let mut tmp_name = path.as_os_str().to_os_string();
                tmp_name.push(".tmp");
                let tmp = PathBuf::from(tmp_name);
                fs::write(&tmp, &bytes)?;
                rotate(path, *revisions)?;
                fs::rename(&tmp, path)?;
                debug!(path = %path.display(), bytes = bytes.len(), "stored");
                Ok(())
            }
        }
    }

    /// Load the newest readable revision, or `None` when the key has
    /// never been written (or every revision is unreadable).
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        match &self.backend {
            Backend::Memory(cell) => {
                let bytes = cell.lock().clone()?;
                self.format.decode(&bytes).ok()
            }
            Backend::File { path, revisions } => {
                for candidate in chain(path, *revisions) {
                    let bytes = match fs::read(&candidate) {
                        Ok(b) => b,
                        Err(_) => continue,
                    };
                    match self.format.decode(&bytes) {
                        Ok(value) => return Some(value),
                        Err(e) => {
                            warn!(path = %candidate.display(), error = %e, "unreadable revision, trying older");
                        }
                    }
                }
                None
            }
        }
    }

    /// Raw bytes of the current revision, if any. Used by tests and
    /// by the report server for cheap pass-through.
    pub fn load_raw(&self) -> Option<Vec<u8>> {
        match &self.backend {
            Backend::Memory(cell) => cell.lock().clone(),
            Backend::File { path, .. } => fs::read(path).ok(),
        }
    }
}

/// Newest-first list of revision files for a key.
fn chain(path: &Path, revisions: usize) -> Vec<PathBuf> {
    let mut out = vec![path.to_path_buf()];
    for i in 0..revisions.saturating_sub(1) {
        out.push(revision_path(path, i));
    }
    out
}

fn revision_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Shift the revision chain down by one, dropping the oldest.
fn rotate(path: &Path, revisions: usize) -> Result<()> {
    if revisions <= 1 {
        return Ok(());
    }
    let old = revisions - 1; // old copies kept besides the current file
    let _ = fs::remove_file(revision_path(path, old - 1));
    for i in (1..old).rev() {
        let from = revision_path(path, i - 1);
        if from.exists() {
            fs::rename(&from, revision_path(path, i))?;
        }
    }
    if path.exists() {
        fs::rename(path, revision_path(path, 0))?;
    }
    Ok(())
}

/// Creates per-key stores under one directory.
pub struct StorageFactory {
    dir: PathBuf,
    revisions: usize,
    format: Format,
}

impl StorageFactory {
    pub fn new(dir: impl Into<PathBuf>, revisions: usize, format: Format) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            revisions: revisions.max(1),
            format,
        })
    }

    pub fn create(&self, key: &str) -> Storage {
        Storage {
            format: self.format,
            backend: Backend::File {
                path: self.dir.join(key),
                revisions: self.revisions,
            },
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        n: u32,
        s: String,
    }

    fn doc(n: u32) -> Doc {
        Doc {
            n,
            s: format!("doc-{n}"),
        }
    }

    #[test]
    fn test_put_then_load_json() {
        let dir = TempDir::new().unwrap();
        let factory = StorageFactory::new(dir.path(), 5, Format::Json).unwrap();
        let st = factory.create("journal");
        assert!(st.load::<Doc>().is_none());
        st.put(&doc(1)).unwrap();
        assert_eq!(st.load::<Doc>().unwrap(), doc(1));
    }

    #[test]
    fn test_put_then_load_binary() {
        let dir = TempDir::new().unwrap();
        let factory = StorageFactory::new(dir.path(), 5, Format::Binary).unwrap();
        let st = factory.create("journal");
        st.put(&doc(7)).unwrap();
        assert_eq!(st.load::<Doc>().unwrap(), doc(7));
    }

    #[test]
    fn test_revisions_rotate_and_cap() {
        let dir = TempDir::new().unwrap();
        let factory = StorageFactory::new(dir.path(), 3, Format::Json).unwrap();
        let st = factory.create("k");
        for n in 0..6 {
            st.put(&doc(n)).unwrap();
        }
        assert_eq!(st.load::<Doc>().unwrap(), doc(5));
        assert!(dir.path().join("k.0").exists());
        assert!(dir.path().join("k.1").exists());
        assert!(!dir.path().join("k.2").exists());
    }

    #[test]
    fn test_corrupt_current_falls_back_to_revision() {
        let dir = TempDir::new().unwrap();
        let factory = StorageFactory::new(dir.path(), 3, Format::Json).unwrap();
        let st = factory.create("k");
        st.put(&doc(1)).unwrap();
        st.put(&doc(2)).unwrap();
        std::fs::write(dir.path().join("k"), b"{garbage").unwrap();
        assert_eq!(st.load::<Doc>().unwrap(), doc(1));
    }

    #[test]
    fn test_memory_storage_roundtrip() {
        let st = Storage::memory(Format::Binary);
        assert!(st.load::<Doc>().is_none());
        st.put(&doc(3)).unwrap();
        assert_eq!(st.load::<Doc>().unwrap(), doc(3));
    }
}
