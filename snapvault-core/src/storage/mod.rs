/*!
Snapshot stores.

A [`SnapshotStore`] is one tier that holds snapshot artifacts: the local
snapshot directory or a remote object store. The engine only talks to stores
through this trait, so retention, reconciliation and gap filling never depend
on where bytes actually live.
*/

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use std::path::Path;

use crate::record::{Location, SnapshotRecord};
use crate::Result;

pub use local::LocalSnapshotStore;
#[cfg(feature = "s3")]
pub use s3::S3SnapshotStore;

/// One tier of snapshot storage
///
/// Names are bare filenames (`snapshot-20240101-000000.db.zst`). Keys are
/// whatever the store needs to address an artifact and are taken from
/// [`SnapshotRecord::store_key`] or [`SnapshotStore::key_for`].
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotStore: Send + Sync {
    /// Tier this store represents
    fn location(&self) -> Location;

    /// Human readable address, e.g. a directory or `s3://bucket/prefix`
    fn describe(&self) -> String;

    /// Every snapshot artifact currently in the store
    ///
    /// Files that do not look like snapshots are skipped.
    fn list(&self) -> Result<Vec<SnapshotRecord>>;

    /// Store key for a bare snapshot name
    fn key_for(&self, name: &str) -> String;

    /// True if a non-empty artifact called `name` exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Store the file at `source` under `name`
    fn put(&self, source: &Path, name: &str) -> Result<SnapshotRecord>;

    /// Copy the artifact called `name` to `dest`, returning the bytes written
    ///
    /// A failed fetch leaves nothing at `dest`.
    fn fetch(&self, name: &str, dest: &Path) -> Result<u64>;

    /// Remove the artifact at `key`; removing an absent key succeeds
    fn delete(&self, key: &str) -> Result<()>;

    /// Remove several artifacts, returning how many were deleted
    fn delete_many(&self, keys: &[String]) -> Result<usize> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for Box<S> {
    fn location(&self) -> Location {
        (**self).location()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn list(&self) -> Result<Vec<SnapshotRecord>> {
        (**self).list()
    }

    fn key_for(&self, name: &str) -> String {
        (**self).key_for(name)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        (**self).exists(name)
    }

    fn put(&self, source: &Path, name: &str) -> Result<SnapshotRecord> {
        (**self).put(source, name)
    }

    fn fetch(&self, name: &str, dest: &Path) -> Result<u64> {
        (**self).fetch(name, dest)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn delete_many(&self, keys: &[String]) -> Result<usize> {
        (**self).delete_many(keys)
    }
}
