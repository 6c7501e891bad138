/*!
Cross-store reconciliation.

The local directory and the remote bucket are listed independently and can
disagree: a snapshot may exist in only one of them, or in both with different
timestamps. Reconciliation merges both listings by name, keeping the freshest
observation of each name, evaluates retention once over the merged view, and
then applies that single verdict to each store's own listing. A snapshot's
fate therefore never depends on which store was asked.
*/

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::record::SnapshotRecord;
use crate::retention::{evaluate, RetentionPolicy, RetentionVerdict};
use crate::{Result, SnapvaultError};

/// Reject listings the reconciler cannot reason about
///
/// Names must be non-empty and unique within one store.
pub fn validate_listing(records: &[SnapshotRecord], store: &str) -> Result<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if record.name.is_empty() {
            return Err(SnapvaultError::invalid_listing(format!(
                "{store} listing contains a record with an empty name (key '{}')",
                record.store_key
            )));
        }
        if !seen.insert(record.name.as_str()) {
            return Err(SnapvaultError::invalid_listing(format!(
                "{store} listing contains '{}' more than once",
                record.name
            )));
        }
    }
    Ok(())
}

/// Merge two listings into one record per name
///
/// `primary` seeds the result. A record from `secondary` replaces the
/// existing record of the same name only when its timestamp is strictly
/// newer, so on equal timestamps the `primary` record stays. The result lists
/// names in first-seen order.
pub fn merge_listings(primary: &[SnapshotRecord], secondary: &[SnapshotRecord]) -> Vec<SnapshotRecord> {
    let mut merged: Vec<SnapshotRecord> = Vec::with_capacity(primary.len() + secondary.len());
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(primary.len() + secondary.len());

    for record in primary.iter().chain(secondary) {
        match index.get(record.name.as_str()) {
            Some(&slot) => {
                if record.modified_at > merged[slot].modified_at {
                    merged[slot] = record.clone();
                }
            }
            None => {
                index.insert(record.name.as_str(), merged.len());
                merged.push(record.clone());
            }
        }
    }

    merged
}

/// One verdict for both stores
///
/// Both listings are validated first; a malformed listing yields an error and
/// no verdict, so nothing can be deleted from either store.
pub fn reconcile(
    local: &[SnapshotRecord],
    remote: &[SnapshotRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<RetentionVerdict> {
    validate_listing(local, "local")?;
    validate_listing(remote, "remote")?;

    let merged = merge_listings(local, remote);
    debug!(
        local = local.len(),
        remote = remote.len(),
        merged = merged.len(),
        "Merged store listings"
    );
    Ok(evaluate(&merged, policy, now))
}

/// A verdict applied to one store's listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorePlan {
    pub keep: Vec<SnapshotRecord>,
    pub delete: Vec<SnapshotRecord>,
}

impl StorePlan {
    /// Split `records` by `verdict`, preserving listing order
    ///
    /// Names the verdict has never seen are deleted.
    pub fn from_verdict(records: &[SnapshotRecord], verdict: &RetentionVerdict) -> Self {
        let (keep, delete): (Vec<_>, Vec<_>) = records
            .iter()
            .cloned()
            .partition(|record| verdict.keeps(&record.name));
        Self { keep, delete }
    }

    /// Store keys scheduled for deletion
    pub fn delete_keys(&self) -> Vec<String> {
        self.delete.iter().map(|record| record.store_key.clone()).collect()
    }

    pub fn is_noop(&self) -> bool {
        self.delete.is_empty()
    }
}

/// Reconciled verdict plus the per-store deletion plans derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub verdict: RetentionVerdict,
    pub local: StorePlan,
    pub remote: StorePlan,
}

/// Reconcile both listings and apply the verdict to each original listing
///
/// A stale copy is judged by the freshest copy of its name: if the merged
/// view keeps a name, neither store deletes it.
pub fn plan_reconciliation(
    local: &[SnapshotRecord],
    remote: &[SnapshotRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<ReconciliationPlan> {
    let verdict = reconcile(local, remote, policy, now)?;
    Ok(ReconciliationPlan {
        local: StorePlan::from_verdict(local, &verdict),
        remote: StorePlan::from_verdict(remote, &verdict),
        verdict,
    })
}
