/*!
Snapshot observations as reported by a single store.
*/

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::compression::is_compressed;

/// Suffix of an uncompressed snapshot artifact
pub const RAW_SUFFIX: &str = ".db";

/// Token that marks a file as a snapshot regardless of its extension
pub const SNAPSHOT_MARKER: &str = "snapshot";

/// Which tier a record was observed in
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// Local snapshot directory
    Local,
    /// Remote object store
    Remote,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local => f.write_str("local"),
            Location::Remote => f.write_str("remote"),
        }
    }
}

/// One artifact observation in one store
///
/// `name` is the identity used across stores: two records with the same name
/// denote the same logical snapshot even if their size or timestamp differ.
/// `store_key` is what the owning store needs to act on the artifact (a path
/// for local disk, a full object key for S3).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Filename including any compression suffix
    pub name: String,

    /// Size in bytes, informational only
    pub size: u64,

    /// Last write time; `None` when the store could not report one
    pub modified_at: Option<DateTime<Utc>>,

    /// Store the record was listed from
    pub location: Location,

    /// Store-specific key or path
    pub store_key: String,
}

impl SnapshotRecord {
    /// Create a record whose store key equals its name
    pub fn new<S: Into<String>>(name: S, location: Location) -> Self {
        let name = name.into();
        Self {
            store_key: name.clone(),
            name,
            size: 0,
            modified_at: None,
            location,
        }
    }

    /// Local record modified at `at`
    pub fn local<S: Into<String>>(name: S, at: DateTime<Utc>) -> Self {
        Self::new(name, Location::Local).modified(at)
    }

    /// Remote record modified at `at`
    pub fn remote<S: Into<String>>(name: S, at: DateTime<Utc>) -> Self {
        Self::new(name, Location::Remote).modified(at)
    }

    pub fn modified(mut self, at: DateTime<Utc>) -> Self {
        self.modified_at = Some(at);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_store_key<S: Into<String>>(mut self, key: S) -> Self {
        self.store_key = key.into();
        self
    }

    /// Age relative to `now`, or `None` if the timestamp is unknown
    ///
    /// Records stamped in the future have a negative age.
    pub fn age_at(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.modified_at.map(|at| now - at)
    }
}

/// True if `name` looks like a snapshot artifact
///
/// Matches the raw suffix, any compressed suffix, or the snapshot marker token
/// anywhere in the name.
pub fn is_snapshot_file(name: &str) -> bool {
    name.ends_with(RAW_SUFFIX) || is_compressed(name) || name.contains(SNAPSHOT_MARKER)
}

/// Generated name for a snapshot taken at `at`
pub fn default_snapshot_name(at: DateTime<Utc>) -> String {
    format!("snapshot-{}{RAW_SUFFIX}", at.format("%Y%m%d-%H%M%S"))
}

/// Ensure a user supplied name carries the raw suffix
pub fn normalize_raw_name(name: &str) -> String {
    if name.ends_with(RAW_SUFFIX) {
        name.to_string()
    } else {
        format!("{name}{RAW_SUFFIX}")
    }
}
