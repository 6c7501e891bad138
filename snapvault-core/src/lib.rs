/*!
# Snapvault Core

Retention evaluation and cross-store reconciliation for snapshot backups kept
in two tiers: a local snapshot directory and a remote object store.

The crate is split into a pure core and the adapters around it:

- [`naming`]: resolve a raw snapshot name to whichever compressed variant exists
- [`retention`]: classify snapshots as keep or delete under a count-and-window policy
- [`reconcile`]: merge both tiers' listings so each snapshot gets one verdict
- [`gaps`]: find kept snapshots the remote tier is missing
- [`storage`]: the local directory and S3 stores
- [`engine`]: status, cleanup, gap sync, ingest and restore workflows

The pure modules never touch a store and take the current time as an
argument, so they are deterministic and safe to run in parallel.

## Usage

```rust
use chrono::{TimeDelta, Utc};
use snapvault_core::{reconcile, RetentionPolicy, SnapshotRecord};

let now = Utc::now();
let local = vec![SnapshotRecord::local("a.db.zst", now - TimeDelta::days(10))];
let remote = vec![SnapshotRecord::remote("a.db.zst", now - TimeDelta::hours(2))];

let verdict = reconcile(&local, &remote, &RetentionPolicy::keep_last(1), now)?;
assert!(verdict.keeps("a.db.zst"));
# Ok::<(), snapvault_core::SnapvaultError>(())
```
*/

pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod gaps;
pub mod naming;
pub mod observability;
pub mod reconcile;
pub mod record;
pub mod retention;
pub mod storage;

#[cfg(test)]
mod error_tests;
#[cfg(test)]
mod retention_tests;

pub use compression::{CompressionAdapter, CompressionAlgorithm};
pub use config::{AppConfig, LocalConfig, S3Config, StorageUri};
pub use engine::{
    CleanupReport, Clock, FixedClock, IngestOptions, IngestReport, Mode, Scope, SnapshotEngine,
    StatusRow, SyncReport, SystemClock,
};
pub use error::{Result, SnapvaultError};
pub use gaps::{find_gaps, GapScan};
pub use naming::{NameResolver, Resolution};
pub use reconcile::{merge_listings, reconcile, ReconciliationPlan, StorePlan};
pub use record::{is_snapshot_file, Location, SnapshotRecord};
pub use retention::{evaluate, RetentionPolicy, RetentionVerdict, TimeUnit};
pub use storage::{LocalSnapshotStore, SnapshotStore};
#[cfg(feature = "s3")]
pub use storage::S3SnapshotStore;
