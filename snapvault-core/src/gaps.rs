/*!
Replication gap detection.

After a remote outage the bucket can be missing snapshots that are still
present locally and that retention says to keep. [`find_gaps`] lists them so
they can be queued for upload.
*/

use std::collections::HashSet;

use crate::record::SnapshotRecord;
use crate::retention::RetentionVerdict;

/// Result of a gap scan
///
/// `Skipped` means the remote listing was unavailable and nothing can be said
/// about gaps; it is not the same as `Found` with an empty list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapScan {
    Skipped,
    Found(Vec<SnapshotRecord>),
}

impl GapScan {
    pub fn is_skipped(&self) -> bool {
        matches!(self, GapScan::Skipped)
    }

    /// Missing records, or `None` if the scan was skipped
    pub fn gaps(&self) -> Option<&[SnapshotRecord]> {
        match self {
            GapScan::Skipped => None,
            GapScan::Found(gaps) => Some(gaps),
        }
    }

    /// Number of gaps; zero for a skipped scan
    pub fn len(&self) -> usize {
        self.gaps().map_or(0, <[SnapshotRecord]>::len)
    }

    /// True only when the scan ran and found nothing
    pub fn is_empty(&self) -> bool {
        matches!(self, GapScan::Found(gaps) if gaps.is_empty())
    }
}

/// Names present in a remote listing
pub fn remote_name_set(remote: &[SnapshotRecord]) -> HashSet<String> {
    remote.iter().map(|record| record.name.clone()).collect()
}

/// Local records the verdict keeps but the remote store lacks
///
/// `remote_names` is `None` when the remote store could not be listed, in
/// which case the scan is skipped. Output follows local listing order.
pub fn find_gaps(
    local: &[SnapshotRecord],
    remote_names: Option<&HashSet<String>>,
    verdict: &RetentionVerdict,
) -> GapScan {
    let Some(remote_names) = remote_names else {
        return GapScan::Skipped;
    };

    GapScan::Found(
        local
            .iter()
            .filter(|record| verdict.keeps(&record.name) && !remote_names.contains(&record.name))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    fn record(name: &str) -> SnapshotRecord {
        SnapshotRecord::local(name, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
    }

    fn verdict(entries: &[(&str, bool)]) -> RetentionVerdict {
        entries
            .iter()
            .map(|(name, keep)| (name.to_string(), *keep))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    #[test]
    fn test_only_kept_missing_records_are_gaps() {
        let local = vec![record("a.db.zst"), record("b.db.zst")];
        let remote = HashSet::new();
        let verdict = verdict(&[("a.db.zst", true), ("b.db.zst", false)]);

        let scan = find_gaps(&local, Some(&remote), &verdict);

        assert_eq!(scan.gaps().unwrap(), &[record("a.db.zst")]);
    }

    #[test]
    fn test_records_already_remote_are_not_gaps() {
        let local = vec![record("a.db.zst"), record("c.db.zst")];
        let remote = remote_name_set(&[SnapshotRecord::remote(
            "a.db.zst",
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
        )]);
        let verdict = verdict(&[("a.db.zst", true), ("c.db.zst", true)]);

        let scan = find_gaps(&local, Some(&remote), &verdict);

        assert_eq!(scan.len(), 1);
        assert_eq!(scan.gaps().unwrap()[0].name, "c.db.zst");
    }

    #[test]
    fn test_names_absent_from_verdict_are_not_uploaded() {
        let local = vec![record("stray.db")];
        let scan = find_gaps(&local, Some(&HashSet::new()), &RetentionVerdict::new());
        assert!(scan.is_empty());
        assert!(!scan.is_skipped());
    }

    #[test]
    fn test_unavailable_remote_skips_instead_of_reporting_zero() {
        let local = vec![record("a.db.zst")];
        let verdict = verdict(&[("a.db.zst", true)]);

        let scan = find_gaps(&local, None, &verdict);

        assert!(scan.is_skipped());
        assert!(!scan.is_empty());
        assert_eq!(scan.gaps(), None);
        assert_eq!(scan.len(), 0);
    }

    #[test]
    fn test_compression_variants_are_distinct_names() {
        let local = vec![record("a.db.zst")];
        let remote: HashSet<String> = ["a.db.gz".to_string()].into_iter().collect();
        let verdict = verdict(&[("a.db.zst", true)]);

        assert_eq!(find_gaps(&local, Some(&remote), &verdict).len(), 1);
    }
}
