/*!
Snapshot engine: the workflows built on top of the pure core.

[`SnapshotEngine`] owns a local store and an optional remote store and turns
listings, retention verdicts and gap scans into actions: listing status,
deleting expired snapshots, uploading missing ones, ingesting a new raw
snapshot and restoring one.

An engine without a remote store behaves as if the remote were unreachable:
remote work is skipped with a warning rather than treated as an error.
*/

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::compression::{compress_file, decompress_file, CompressionAlgorithm};
use crate::config::StorageUri;
use crate::gaps::{find_gaps, remote_name_set, GapScan};
use crate::naming::{NameResolver, Resolution};
use crate::observability::{record_gap_uploads, record_retention};
use crate::reconcile::{plan_reconciliation, reconcile, validate_listing, StorePlan};
use crate::record::{default_snapshot_name, normalize_raw_name, Location, SnapshotRecord};
use crate::retention::{evaluate, newest_first, RetentionPolicy, RetentionVerdict};
use crate::storage::SnapshotStore;
use crate::{Result, SnapvaultError};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Which stores an operation touches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Both,
    Local,
    Remote,
}

impl Scope {
    pub fn includes(self, location: Location) -> bool {
        match self {
            Scope::Both => true,
            Scope::Local => location == Location::Local,
            Scope::Remote => location == Location::Remote,
        }
    }
}

/// How retention verdicts are computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One verdict over the merged listings of both stores
    #[default]
    Unified,
    /// Each store evaluated on its own listing
    Separate,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Unified => f.write_str("unified"),
            Mode::Separate => f.write_str("separate"),
        }
    }
}

/// One line of `status` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub name: String,
    pub location: Location,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub keep: bool,
}

/// What cleanup did to one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreCleanup {
    pub location: Location,
    pub kept: Vec<String>,
    /// Deleted, or scheduled for deletion on a dry run
    pub deleted: Vec<String>,
    /// Scheduled for deletion but still present
    pub failed: Vec<String>,
    /// Deletion error, if the store refused
    pub error: Option<String>,
}

/// Outcome of a cleanup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub mode: Mode,
    pub dry_run: bool,
    pub local: Option<StoreCleanup>,
    pub remote: Option<StoreCleanup>,
}

impl CleanupReport {
    pub fn deleted_count(&self) -> usize {
        self.stores().map(|store| store.deleted.len()).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.stores().any(|store| store.error.is_some())
    }

    pub fn stores(&self) -> impl Iterator<Item = &StoreCleanup> {
        self.local.iter().chain(self.remote.iter())
    }
}

/// Outcome of a gap upload run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub scan: GapScan,
    pub uploaded: Vec<String>,
    /// Names whose upload failed, with the error
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            scan: GapScan::Skipped,
            uploaded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.scan.is_skipped()
    }
}

/// Options for [`SnapshotEngine::ingest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    /// Snapshot name; `.db` is appended when missing. Defaults to a
    /// timestamped name.
    pub name: Option<String>,
    /// Overrides the engine's compression algorithm
    pub compression: Option<CompressionAlgorithm>,
    /// Upload to the remote store and fill gaps
    pub upload: bool,
    /// Remove the local copy after a successful upload
    pub remove_local: bool,
    /// Run unified cleanup afterwards
    pub apply_retention: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            name: None,
            compression: None,
            upload: true,
            remove_local: false,
            apply_retention: true,
        }
    }
}

/// Outcome of an ingest run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Artifact name including the compression suffix
    pub name: String,
    /// Local record, `None` once removed
    pub local: Option<SnapshotRecord>,
    pub uploaded: bool,
    pub upload_error: Option<String>,
    pub sync: Option<SyncReport>,
    pub cleanup: Option<CleanupReport>,
}

/// Coordinates a local and an optional remote snapshot store
pub struct SnapshotEngine<L, R> {
    local: L,
    remote: Option<R>,
    policy: RetentionPolicy,
    compression: CompressionAlgorithm,
    resolver: NameResolver,
    clock: Box<dyn Clock>,
}

impl<L: SnapshotStore> SnapshotEngine<L, L> {
    /// Engine without a remote store
    pub fn local_only(local: L, policy: RetentionPolicy) -> Self {
        Self::new(local, None, policy)
    }
}

impl<L: SnapshotStore, R: SnapshotStore> SnapshotEngine<L, R> {
    pub fn new(local: L, remote: Option<R>, policy: RetentionPolicy) -> Self {
        let compression = CompressionAlgorithm::default();
        Self {
            local,
            remote,
            policy,
            compression,
            resolver: NameResolver::new(compression),
            clock: Box::new(SystemClock),
        }
    }

    /// Compression for ingested snapshots, also preferred when resolving names
    pub fn with_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = compression;
        self.resolver = NameResolver::new(compression);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn remote(&self) -> Option<&R> {
        self.remote.as_ref()
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Keep/delete status for every snapshot in `scope`
    ///
    /// Read-only: a store that cannot be listed is logged and shown empty.
    /// Unified mode still lists both stores so the verdict matches what
    /// cleanup would do.
    pub fn status(&self, scope: Scope, mode: Mode) -> Result<Vec<StatusRow>> {
        let needs_local = mode == Mode::Unified || scope.includes(Location::Local);
        let needs_remote = mode == Mode::Unified || scope.includes(Location::Remote);

        let local = if needs_local {
            list_or_empty(&self.local)
        } else {
            Vec::new()
        };
        let remote = match (&self.remote, needs_remote) {
            (Some(remote), true) => list_or_empty(remote),
            (None, true) if scope.includes(Location::Remote) => {
                warn!("No remote store configured; showing local snapshots only");
                Vec::new()
            }
            _ => Vec::new(),
        };

        let now = self.now();
        let (local_verdict, remote_verdict) = match mode {
            Mode::Unified => {
                let verdict = reconcile(&local, &remote, &self.policy, now)?;
                (verdict.clone(), verdict)
            }
            Mode::Separate => (
                self.evaluate_listing(&local, "local", now)?,
                self.evaluate_listing(&remote, "remote", now)?,
            ),
        };

        let mut rows = Vec::new();
        if scope.includes(Location::Local) {
            rows.extend(status_rows(&local, &local_verdict));
        }
        if scope.includes(Location::Remote) {
            rows.extend(status_rows(&remote, &remote_verdict));
        }
        Ok(rows)
    }

    /// Delete snapshots retention no longer keeps
    ///
    /// Every store the run depends on is listed before anything is deleted;
    /// a listing failure aborts the whole run. In unified mode that means
    /// both stores, even when only one is cleaned.
    pub fn cleanup(&self, scope: Scope, mode: Mode, dry_run: bool) -> Result<CleanupReport> {
        let remote_store = match (&self.remote, scope) {
            (Some(remote), _) => Some(remote),
            (None, Scope::Remote) => {
                return Err(SnapvaultError::validation(
                    "Remote cleanup requested but no remote store is configured",
                ))
            }
            (None, _) => {
                warn!("No remote store configured; cleaning local snapshots only");
                None
            }
        };

        let now = self.now();
        let (local_plan, remote_plan) = match mode {
            Mode::Unified => {
                let local = self.local.list()?;
                let remote = match remote_store {
                    Some(store) => store.list()?,
                    None => Vec::new(),
                };
                let plan = plan_reconciliation(&local, &remote, &self.policy, now)?;
                record_verdict(&plan.verdict);
                (
                    scope.includes(Location::Local).then_some(plan.local),
                    remote_store
                        .filter(|_| scope.includes(Location::Remote))
                        .map(|_| plan.remote),
                )
            }
            Mode::Separate => {
                let local_plan = if scope.includes(Location::Local) {
                    let listing = self.local.list()?;
                    let verdict = self.evaluate_listing(&listing, "local", now)?;
                    record_verdict(&verdict);
                    Some(StorePlan::from_verdict(&listing, &verdict))
                } else {
                    None
                };
                let remote_plan = match remote_store.filter(|_| scope.includes(Location::Remote)) {
                    Some(store) => {
                        let listing = store.list()?;
                        let verdict = self.evaluate_listing(&listing, "remote", now)?;
                        record_verdict(&verdict);
                        Some(StorePlan::from_verdict(&listing, &verdict))
                    }
                    None => None,
                };
                (local_plan, remote_plan)
            }
        };

        let report = CleanupReport {
            mode,
            dry_run,
            local: local_plan.map(|plan| apply_plan(&self.local, plan, dry_run)),
            remote: match (remote_store, remote_plan) {
                (Some(store), Some(plan)) => Some(apply_plan(store, plan, dry_run)),
                _ => None,
            },
        };

        info!(
            mode = %mode,
            dry_run,
            deleted = report.deleted_count(),
            failed = report.has_failures(),
            "Cleanup finished"
        );
        Ok(report)
    }

    /// Upload kept local snapshots that are missing remotely
    ///
    /// Returns a skipped report when there is no remote store or it cannot
    /// be listed. A failed upload is recorded and the rest continue.
    pub fn sync_missing(&self) -> Result<SyncReport> {
        let Some(remote) = &self.remote else {
            warn!("No remote store configured; skipping gap detection");
            return Ok(SyncReport::skipped());
        };

        let local = self.local.list()?;
        let remote_listing = match remote.list() {
            Ok(listing) => listing,
            Err(e) => {
                warn!(store = %remote.describe(), error = %e, "Remote listing unavailable; skipping gap detection");
                return Ok(SyncReport::skipped());
            }
        };

        let verdict = reconcile(&local, &remote_listing, &self.policy, self.now())?;
        let remote_names = remote_name_set(&remote_listing);
        let scan = find_gaps(&local, Some(&remote_names), &verdict);

        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        for record in scan.gaps().unwrap_or_default() {
            match remote.put(Path::new(&record.store_key), &record.name) {
                Ok(_) => uploaded.push(record.name.clone()),
                Err(e) => {
                    error!(name = %record.name, error = %e, "Failed to upload missing snapshot");
                    failed.push((record.name.clone(), e.to_string()));
                }
            }
        }

        record_gap_uploads(uploaded.len());
        info!(
            gaps = scan.len(),
            uploaded = uploaded.len(),
            failed = failed.len(),
            "Gap sync finished"
        );
        Ok(SyncReport {
            scan,
            uploaded,
            failed,
        })
    }

    /// Compress a raw snapshot into the local store and replicate it
    ///
    /// The artifact is stored as `<name>.db<suffix>`. Upload failures are
    /// reported, not returned; the snapshot then stays local and a later gap
    /// sync picks it up. The local copy is only removed after a successful
    /// upload.
    pub fn ingest(&self, raw_path: &Path, options: IngestOptions) -> Result<IngestReport> {
        let metadata = std::fs::metadata(raw_path).map_err(|e| {
            SnapvaultError::validation(format!("Cannot read snapshot {}: {}", raw_path.display(), e))
        })?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(SnapvaultError::validation(format!(
                "Snapshot {} is empty or not a regular file",
                raw_path.display()
            )));
        }

        let compression = options.compression.unwrap_or(self.compression);
        let raw_name = match &options.name {
            Some(name) => normalize_raw_name(name),
            None => default_snapshot_name(self.now()),
        };
        let name = format!("{raw_name}{}", compression.suffix());

        let staging = tempfile::tempdir()?;
        let staged = staging.path().join(&name);
        compress_file(raw_path, &staged, compression)?;
        let mut local = Some(self.local.put(&staged, &name)?);
        info!(name = %name, algorithm = %compression, "Ingested snapshot");

        let mut uploaded = false;
        let mut upload_error = None;
        let mut sync = None;
        match (&self.remote, options.upload) {
            (Some(remote), true) => {
                match remote.put(&staged, &name) {
                    Ok(_) => uploaded = true,
                    Err(e) => {
                        error!(name = %name, error = %e, "Upload failed; snapshot kept locally");
                        upload_error = Some(e.to_string());
                    }
                }
                sync = Some(self.sync_missing()?);
            }
            (None, true) => warn!(name = %name, "No remote store configured; snapshot kept locally only"),
            (_, false) => debug!(name = %name, "Upload disabled"),
        }

        if options.remove_local {
            if uploaded {
                if let Some(record) = local.take() {
                    self.local.delete(&record.store_key)?;
                    info!(name = %name, "Removed local copy after upload");
                }
            } else {
                warn!(name = %name, "Keeping local copy because it was not uploaded");
            }
        }

        let cleanup = if options.apply_retention {
            Some(self.cleanup(Scope::Both, Mode::Unified, false)?)
        } else {
            None
        };

        Ok(IngestReport {
            name,
            local,
            uploaded,
            upload_error,
            sync,
            cleanup,
        })
    }

    /// Restore a snapshot into `dest_dir` and return the raw file's path
    ///
    /// `source` may be a path to an artifact, a bare snapshot name, or an
    /// `s3://bucket/key` URI. Names are resolved across compression variants:
    /// in the path's own directory, then the local store, then the remote.
    /// For URIs only the remote store is consulted, and it is expected to
    /// address the URI's bucket and prefix.
    pub fn restore(&self, source: &str, dest_dir: &Path) -> Result<PathBuf> {
        let uri = StorageUri::parse(source)?;
        let name = uri
            .file_name()
            .ok_or_else(|| SnapvaultError::validation(format!("No snapshot name in '{source}'")))?
            .to_string();

        std::fs::create_dir_all(dest_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".snapvault-restore")
            .tempdir_in(dest_dir)?;

        let artifact = match &uri {
            StorageUri::Local(path) => match self.resolve_in_parent(path, &name)? {
                Resolution::Found(found) => {
                    debug!(path = %found, "Restoring from explicit path");
                    PathBuf::from(found)
                }
                Resolution::NotFound { .. } if path.is_file() => path.clone(),
                Resolution::NotFound { tried, .. } => {
                    self.fetch_resolved(&name, staging.path(), true, tried)?
                }
            },
            StorageUri::Remote { .. } => {
                self.fetch_resolved(&name, staging.path(), false, Vec::new())?
            }
        };

        let size = std::fs::metadata(&artifact)?.len();
        if size == 0 {
            return Err(SnapvaultError::validation(format!(
                "Snapshot {} is empty",
                artifact.display()
            )));
        }

        let artifact_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(name);
        let algorithm = CompressionAlgorithm::from_filename(&artifact_name);
        let output = dest_dir.join(algorithm.strip_suffix(&artifact_name));
        decompress_file(&artifact, &output)?;

        info!(source = %source, output = %output.display(), algorithm = %algorithm, "Restored snapshot");
        Ok(output)
    }

    /// Probe the compression variants of a path the caller spelled out
    ///
    /// Bare names have no directory of their own and are left to the stores.
    fn resolve_in_parent(&self, path: &Path, name: &str) -> Result<Resolution> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => {
                return Ok(Resolution::NotFound {
                    requested: name.to_string(),
                    tried: Vec::new(),
                })
            }
        };

        let resolution = self.resolver.resolve(name, |candidate| {
            Ok(std::fs::metadata(dir.join(candidate))
                .map(|metadata| metadata.is_file() && metadata.len() > 0)
                .unwrap_or(false))
        })?;
        Ok(match resolution {
            Resolution::Found(found) => {
                Resolution::Found(dir.join(found).to_string_lossy().into_owned())
            }
            Resolution::NotFound { requested, tried } => Resolution::NotFound {
                requested,
                tried: tried
                    .iter()
                    .map(|candidate| dir.join(candidate).to_string_lossy().into_owned())
                    .collect(),
            },
        })
    }

    fn fetch_resolved(
        &self,
        name: &str,
        staging: &Path,
        try_local: bool,
        mut tried: Vec<String>,
    ) -> Result<PathBuf> {

        if try_local {
            match self.resolver.resolve(name, |candidate| self.local.exists(candidate))? {
                Resolution::Found(resolved) => {
                    let dest = staging.join(&resolved);
                    self.local.fetch(&resolved, &dest)?;
                    return Ok(dest);
                }
                Resolution::NotFound { tried: candidates, .. } => {
                    tried.extend(candidates.iter().map(|c| self.local.key_for(c)));
                }
            }
        }

        match &self.remote {
            Some(remote) => match self.resolver.resolve(name, |candidate| remote.exists(candidate))? {
                Resolution::Found(resolved) => {
                    let dest = staging.join(&resolved);
                    remote.fetch(&resolved, &dest)?;
                    return Ok(dest);
                }
                Resolution::NotFound { tried: candidates, .. } => {
                    tried.extend(candidates.iter().map(|c| remote.key_for(c)));
                }
            },
            None if !try_local => {
                return Err(SnapvaultError::validation(
                    "Remote restore requested but no remote store is configured",
                ))
            }
            None => {}
        }

        Err(SnapvaultError::SnapshotNotFound {
            requested: name.to_string(),
            tried,
        })
    }

    fn evaluate_listing(
        &self,
        listing: &[SnapshotRecord],
        store: &str,
        now: DateTime<Utc>,
    ) -> Result<RetentionVerdict> {
        validate_listing(listing, store)?;
        Ok(evaluate(listing, &self.policy, now))
    }
}

fn list_or_empty<S: SnapshotStore + ?Sized>(store: &S) -> Vec<SnapshotRecord> {
    store.list().unwrap_or_else(|e| {
        error!(store = %store.describe(), error = %e, "Failed to list snapshots");
        Vec::new()
    })
}

fn status_rows(listing: &[SnapshotRecord], verdict: &RetentionVerdict) -> Vec<StatusRow> {
    newest_first(listing)
        .into_iter()
        .map(|record| StatusRow {
            name: record.name.clone(),
            location: record.location,
            size: record.size,
            modified_at: record.modified_at,
            keep: verdict.keeps(&record.name),
        })
        .collect()
}

fn record_verdict(verdict: &RetentionVerdict) {
    record_retention(verdict.kept().count(), verdict.deleted().count());
}

fn apply_plan<S: SnapshotStore + ?Sized>(store: &S, plan: StorePlan, dry_run: bool) -> StoreCleanup {
    let location = store.location();
    let kept = plan.keep.iter().map(|record| record.name.clone()).collect();

    if dry_run || plan.is_noop() {
        let deleted: Vec<String> = plan.delete.iter().map(|record| record.name.clone()).collect();
        for name in &deleted {
            info!(store = %location, name = %name, "Would delete snapshot");
        }
        return StoreCleanup {
            location,
            kept,
            deleted,
            failed: Vec::new(),
            error: None,
        };
    }

    match store.delete_many(&plan.delete_keys()) {
        Ok(count) => {
            info!(store = %location, deleted = count, "Deleted expired snapshots");
            StoreCleanup {
                location,
                kept,
                deleted: plan.delete.into_iter().map(|record| record.name).collect(),
                failed: Vec::new(),
                error: None,
            }
        }
        Err(e) => {
            // A failed batch may have removed some keys already; deleting an
            // absent key succeeds, so retrying one by one sorts them out.
            warn!(store = %location, error = %e, "Batch delete failed; deleting one at a time");
            let mut deleted = Vec::new();
            let mut failed = Vec::new();
            let mut last_error = e.to_string();
            for record in plan.delete {
                match store.delete(&record.store_key) {
                    Ok(()) => deleted.push(record.name),
                    Err(e) => {
                        error!(store = %location, name = %record.name, error = %e, "Failed to delete snapshot");
                        last_error = e.to_string();
                        failed.push(record.name);
                    }
                }
            }
            let error = (!failed.is_empty())
                .then(|| format!("Failed to delete {}: {}", failed.join(", "), last_error));
            StoreCleanup {
                location,
                kept,
                deleted,
                failed,
                error,
            }
        }
    }
}
