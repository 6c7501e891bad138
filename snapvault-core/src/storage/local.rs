/*!
Local snapshot directory.
*/

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::SnapshotStore;
use crate::record::{is_snapshot_file, Location, SnapshotRecord};
use crate::{Result, SnapvaultError};

/// Snapshot store backed by a single flat directory
///
/// Store keys are full paths. A directory that does not exist yet lists as
/// empty and is created on the first write.
///
/// # Example
/// ```rust
/// use snapvault_core::storage::{LocalSnapshotStore, SnapshotStore};
///
/// let dir = tempfile::tempdir()?;
/// let store = LocalSnapshotStore::new(dir.path().join("snapshots"));
/// assert!(store.list()?.is_empty());
/// # Ok::<(), snapvault_core::SnapvaultError>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    dir: PathBuf,
}

impl LocalSnapshotStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Snapshot directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of the artifact called `name`
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Path addressed by a store key: a full path inside the directory as
    /// produced by [`SnapshotStore::key_for`], or a bare name
    fn path_for_key(&self, key: &str) -> PathBuf {
        let path = Path::new(key);
        if path.starts_with(&self.dir) {
            path.to_path_buf()
        } else {
            self.dir.join(key)
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            SnapvaultError::storage(format!(
                "Failed to create snapshot directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    fn record_for(&self, name: String, metadata: &fs::Metadata) -> SnapshotRecord {
        let path = self.path_for(&name);
        let record = SnapshotRecord::new(name, Location::Local)
            .with_size(metadata.len())
            .with_store_key(path.to_string_lossy().into_owned());

        match metadata.modified() {
            Ok(at) => record.modified(DateTime::<Utc>::from(at)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Modification time unavailable");
                record
            }
        }
    }
}

impl SnapshotStore for LocalSnapshotStore {
    fn location(&self) -> Location {
        Location::Local
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn list(&self) -> Result<Vec<SnapshotRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "Snapshot directory does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(SnapvaultError::storage(format!(
                    "Failed to read snapshot directory {}: {}",
                    self.dir.display(),
                    e
                )))
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_snapshot_file(&name) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            records.push(self.record_for(name, &metadata));
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(dir = %self.dir.display(), count = records.len(), "Listed local snapshots");
        Ok(records)
    }

    fn key_for(&self, name: &str) -> String {
        self.path_for(name).to_string_lossy().into_owned()
    }

    fn exists(&self, name: &str) -> Result<bool> {
        match fs::metadata(self.path_for(name)) {
            Ok(metadata) => Ok(metadata.is_file() && metadata.len() > 0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, source: &Path, name: &str) -> Result<SnapshotRecord> {
        self.ensure_dir()?;
        let dest = self.path_for(name);

        if dest != source {
            let mut staged = NamedTempFile::new_in(&self.dir)?;
            let mut reader = fs::File::open(source).map_err(|e| {
                SnapvaultError::storage(format!("Failed to open {}: {}", source.display(), e))
            })?;
            io::copy(&mut reader, staged.as_file_mut())?;
            staged.persist(&dest).map_err(|e| {
                SnapvaultError::storage(format!(
                    "Failed to write snapshot to {}: {}",
                    dest.display(),
                    e.error
                ))
            })?;
        }

        let metadata = fs::metadata(&dest)?;
        info!(path = %dest.display(), size = metadata.len(), "Stored local snapshot");
        Ok(self.record_for(name.to_string(), &metadata))
    }

    fn fetch(&self, name: &str, dest: &Path) -> Result<u64> {
        let source = self.path_for(name);
        let parent = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let mut reader = fs::File::open(&source).map_err(|e| {
            SnapvaultError::storage(format!("Failed to open {}: {}", source.display(), e))
        })?;
        let mut staged = NamedTempFile::new_in(&parent)?;
        let written = io::copy(&mut reader, staged.as_file_mut())?;
        staged.persist(dest).map_err(|e| {
            SnapvaultError::storage(format!("Failed to write {}: {}", dest.display(), e.error))
        })?;

        debug!(from = %source.display(), to = %dest.display(), bytes = written, "Fetched local snapshot");
        Ok(written)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for_key(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Deleted local snapshot");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SnapvaultError::storage(format!(
                "Failed to delete snapshot {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
