//! Durable resume points.
//!
//! A checkpoint records the index of the first message that still has to be
//! migrated. It is written to a temporary sibling file and renamed over the
//! target, so a crash mid-write leaves the previous checkpoint intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{MigrateError, Result};
use crate::store::write_atomic;

/// Where a migration keeps its resume point.
pub trait CheckpointStore {
    /// The stored resume point, or `None` if nothing was saved yet.
    fn load(&mut self) -> Result<Option<u64>>;

    /// Replace the stored resume point.
    fn save(&mut self, last_completed_index: u64) -> Result<()>;
}

/// On-disk checkpoint document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Every span with a lower index has been handled.
    #[serde(alias = "last_count")]
    pub last_completed_index: u64,
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A JSON checkpoint file, with an optional fallback location used when the
/// primary one cannot be written (read-only source directory).
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
    fallback: Option<PathBuf>,
    source: Option<PathBuf>,
}

impl FileCheckpoint {
    /// Checkpoint at an explicit path, without fallback.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback: None,
            source: None,
        }
    }

    /// Default checkpoint for an MBOX: next to it, else in `cache_dir`.
    pub fn for_mbox(mbox_path: &Path, cache_dir: &Path) -> Self {
        Self {
            path: checkpoint_path_for(mbox_path),
            fallback: Some(cache_checkpoint_path_for(mbox_path, cache_dir)),
            source: Some(mbox_path.to_path_buf()),
        }
    }

    /// Record the source MBOX path in the checkpoint document.
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The location currently in use.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full record (for diagnostics).
    pub fn read_record(&self) -> Result<Option<CheckpointRecord>> {
        Ok(self.locate()?.map(|(_, record)| record))
    }

    /// Find the stored record, looking at the primary location first.
    ///
    /// An unreadable primary location (as opposed to a corrupt file) falls
    /// through to the fallback.
    fn locate(&self) -> Result<Option<(PathBuf, CheckpointRecord)>> {
        match (read_record_at(&self.path), &self.fallback) {
            (Ok(Some(record)), _) => Ok(Some((self.path.clone(), record))),
            (Ok(None), None) => Ok(None),
            (Err(MigrateError::Io { .. }) | Ok(None), Some(fallback)) => {
                Ok(read_record_at(fallback)?.map(|record| (fallback.clone(), record)))
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Remove any stored checkpoint (both locations).
    pub fn clear(&self) -> Result<()> {
        for path in std::iter::once(&self.path).chain(self.fallback.as_ref()) {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed checkpoint"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(MigrateError::io(path, e)),
            }
        }
        Ok(())
    }
}

impl CheckpointStore for FileCheckpoint {
    fn load(&mut self) -> Result<Option<u64>> {
        let Some((path, record)) = self.locate()? else {
            return Ok(None);
        };
        if path != self.path {
            debug!(path = %path.display(), "Using checkpoint from cache");
            self.path = path;
            self.fallback = None;
        }
        Ok(Some(record.last_completed_index))
    }

    fn save(&mut self, last_completed_index: u64) -> Result<()> {
        let record = CheckpointRecord {
            last_completed_index,
            source: self.source.clone(),
            updated_at: Some(Utc::now()),
        };

        match write_record_atomic(&self.path, &record) {
            Ok(()) => Ok(()),
            Err(e) => {
                let Some(fallback) = self.fallback.take() else {
                    return Err(e);
                };
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Cannot write checkpoint next to the MBOX, using cache directory"
                );
                write_record_atomic(&fallback, &record)?;
                info!(path = %fallback.display(), "Checkpoint written to cache");
                self.path = fallback;
                Ok(())
            }
        }
    }
}

/// In-memory checkpoint that remembers every save.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    pub value: Option<u64>,
    pub history: Vec<u64>,
}

impl MemoryCheckpoint {
    pub fn starting_at(index: u64) -> Self {
        Self {
            value: Some(index),
            history: Vec::new(),
        }
    }

    /// Start from another store's current value. Saves stay in memory, so
    /// the other store is never written.
    pub fn seeded_from(store: &mut impl CheckpointStore) -> Result<Self> {
        Ok(Self {
            value: store.load()?,
            history: Vec::new(),
        })
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn load(&mut self) -> Result<Option<u64>> {
        Ok(self.value)
    }

    fn save(&mut self, last_completed_index: u64) -> Result<()> {
        self.value = Some(last_completed_index);
        self.history.push(last_completed_index);
        Ok(())
    }
}

fn read_record_at(path: &Path) -> Result<Option<CheckpointRecord>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MigrateError::io(path, e)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| MigrateError::Checkpoint {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn write_record_atomic(path: &Path, record: &CheckpointRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| MigrateError::io(parent, e))?;
    }

    let data = serde_json::to_vec_pretty(record).map_err(|e| MigrateError::Checkpoint {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    write_atomic(path, &data).map_err(|e| MigrateError::io(path, e))?;
    debug!(path = %path.display(), last_completed_index = record.last_completed_index, "Checkpoint saved");
    Ok(())
}

/// Primary checkpoint path: hidden file next to the MBOX.
///
/// Example: `/data/mail.mbox` → `/data/.mail.mbox.mboxmigrate.json`
pub fn checkpoint_path_for(mbox_path: &Path) -> PathBuf {
    let filename = mbox_path.file_name().unwrap_or_default().to_string_lossy();
    mbox_path.with_file_name(format!(".{filename}.mboxmigrate.json"))
}

/// Fallback checkpoint path inside the cache directory.
///
/// Example: `~/.cache/mboxmigrate/<sha256_of_path>.json`
pub fn cache_checkpoint_path_for(mbox_path: &Path, cache_dir: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(mbox_path.to_string_lossy().as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    cache_dir.join(format!("{hash}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_paths() {
        let p = checkpoint_path_for(Path::new("/data/mail.mbox"));
        assert_eq!(p, PathBuf::from("/data/.mail.mbox.mboxmigrate.json"));

        let a = cache_checkpoint_path_for(Path::new("/data/a.mbox"), Path::new("/c"));
        let b = cache_checkpoint_path_for(Path::new("/data/b.mbox"), Path::new("/c"));
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/c")));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("json"));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let mut cp = FileCheckpoint::new(&path).with_source("/data/mail.mbox");
        assert_eq!(cp.load().unwrap(), None);

        cp.save(100).unwrap();
        cp.save(200).unwrap();
        assert_eq!(cp.load().unwrap(), Some(200));
        assert!(!tmp.path().join("state.json.tmp").exists());

        let record = cp.read_record().unwrap().unwrap();
        assert_eq!(record.source, Some(PathBuf::from("/data/mail.mbox")));
        assert!(record.updated_at.is_some());
    }

    #[test]
    fn test_legacy_state_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, r#"{"last_count": 4200}"#).unwrap();
        assert_eq!(FileCheckpoint::new(&path).load().unwrap(), Some(4200));
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileCheckpoint::new(&path).load(),
            Err(MigrateError::Checkpoint { .. })
        ));
    }

    #[test]
    fn test_falls_back_to_cache_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mbox = tmp.path().join("missing-dir").join("mail.mbox");
        // A regular file where the MBOX's parent directory should be makes
        // the primary location unwritable
        fs::write(tmp.path().join("missing-dir"), b"").unwrap();
        let cache = tmp.path().join("cache");

        let mut cp = FileCheckpoint::for_mbox(&mbox, &cache);
        cp.save(7).unwrap();
        assert!(cp.path().starts_with(&cache));

        let mut reopened = FileCheckpoint::for_mbox(&mbox, &cache);
        assert_eq!(reopened.load().unwrap(), Some(7));
    }

    #[test]
    fn test_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let mut cp = FileCheckpoint::new(&path);
        cp.save(3).unwrap();
        cp.clear().unwrap();
        assert_eq!(cp.load().unwrap(), None);
    }

    #[test]
    fn test_seeded_memory_checkpoint_leaves_file_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let mut file = FileCheckpoint::new(&path);
        file.save(12).unwrap();
        let before = fs::read(&path).unwrap();

        let mut memory = MemoryCheckpoint::seeded_from(&mut file).unwrap();
        assert_eq!(memory.load().unwrap(), Some(12));
        memory.save(40).unwrap();

        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(file.load().unwrap(), Some(12));
    }

    #[test]
    fn test_memory_checkpoint() {
        let mut cp = MemoryCheckpoint::starting_at(5);
        assert_eq!(cp.load().unwrap(), Some(5));
        cp.save(9).unwrap();
        assert_eq!(cp.history, vec![9]);
    }
}
