/*!
Retention policy evaluation.

[`evaluate`] classifies every record of one listing as keep or delete. A
record is kept if it is among the newest `keep_last` records **or** falls
inside any enabled time window; there is no precedence between rules. A
policy with every rule disabled keeps nothing.

Evaluation is a pure function of the records, the policy and the supplied
`now`. It never touches a store and never fails.
*/

use std::collections::btree_map::{self, BTreeMap};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::SnapshotRecord;

/// Unit of a time-window retention rule
///
/// Months and years are fixed approximations (30 and 365 days).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    pub const ALL: [TimeUnit; 5] = [
        TimeUnit::Hour,
        TimeUnit::Day,
        TimeUnit::Week,
        TimeUnit::Month,
        TimeUnit::Year,
    ];

    /// Length of one unit in hours
    pub const fn hours(self) -> i64 {
        match self {
            TimeUnit::Hour => 1,
            TimeUnit::Day => 24,
            TimeUnit::Week => 7 * 24,
            TimeUnit::Month => 30 * 24,
            TimeUnit::Year => 365 * 24,
        }
    }

    /// Window length for `count` units
    ///
    /// `None` when the window is too large to represent, which callers treat
    /// as unbounded.
    pub fn window(self, count: u32) -> Option<TimeDelta> {
        i64::from(count)
            .checked_mul(self.hours())
            .and_then(TimeDelta::try_hours)
    }
}

/// Retention thresholds; zero disables a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep the newest N records
    pub keep_last: usize,
    /// Keep records younger than N hours
    pub keep_hours: u32,
    /// Keep records younger than N days
    pub keep_days: u32,
    /// Keep records younger than N weeks
    pub keep_weeks: u32,
    /// Keep records younger than N 30-day months
    pub keep_months: u32,
    /// Keep records younger than N 365-day years
    pub keep_years: u32,
}

impl RetentionPolicy {
    /// Policy with every rule disabled; evaluates to "delete everything"
    pub const fn disabled() -> Self {
        Self {
            keep_last: 0,
            keep_hours: 0,
            keep_days: 0,
            keep_weeks: 0,
            keep_months: 0,
            keep_years: 0,
        }
    }

    /// Policy that only keeps the newest `count` records
    pub const fn keep_last(count: usize) -> Self {
        Self {
            keep_last: count,
            ..Self::disabled()
        }
    }

    pub fn with_keep_last(mut self, count: usize) -> Self {
        self.keep_last = count;
        self
    }

    /// Set the window threshold for `unit`
    pub fn with_window(mut self, unit: TimeUnit, count: u32) -> Self {
        *self.window_mut(unit) = count;
        self
    }

    /// Window threshold for `unit`
    pub fn keep_within(&self, unit: TimeUnit) -> u32 {
        match unit {
            TimeUnit::Hour => self.keep_hours,
            TimeUnit::Day => self.keep_days,
            TimeUnit::Week => self.keep_weeks,
            TimeUnit::Month => self.keep_months,
            TimeUnit::Year => self.keep_years,
        }
    }

    fn window_mut(&mut self, unit: TimeUnit) -> &mut u32 {
        match unit {
            TimeUnit::Hour => &mut self.keep_hours,
            TimeUnit::Day => &mut self.keep_days,
            TimeUnit::Week => &mut self.keep_weeks,
            TimeUnit::Month => &mut self.keep_months,
            TimeUnit::Year => &mut self.keep_years,
        }
    }

    /// Enabled windows; `None` marks an unbounded window
    pub fn enabled_windows(&self) -> Vec<(TimeUnit, Option<TimeDelta>)> {
        TimeUnit::ALL
            .into_iter()
            .filter_map(|unit| match self.keep_within(unit) {
                0 => None,
                count => Some((unit, unit.window(count))),
            })
            .collect()
    }

    /// True when no rule is enabled
    pub fn is_disabled(&self) -> bool {
        self.keep_last == 0 && TimeUnit::ALL.into_iter().all(|unit| self.keep_within(unit) == 0)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last: 5,
            keep_hours: 24,
            keep_days: 7,
            keep_weeks: 4,
            keep_months: 3,
            keep_years: 1,
        }
    }
}

/// Keep/delete decision per snapshot name
///
/// Names that were never evaluated read as "delete" through [`keeps`](Self::keeps).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionVerdict {
    decisions: BTreeMap<String, bool>,
}

impl RetentionVerdict {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `name` was evaluated and marked keep
    pub fn keeps(&self, name: &str) -> bool {
        self.decisions.get(name).copied().unwrap_or(false)
    }

    /// Decision for `name`, if it was evaluated
    pub fn get(&self, name: &str) -> Option<bool> {
        self.decisions.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decisions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.decisions.iter().map(|(name, keep)| (name.as_str(), *keep))
    }

    pub fn kept(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, keep)| *keep).map(|(name, _)| name)
    }

    pub fn deleted(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, keep)| !*keep).map(|(name, _)| name)
    }

    pub fn as_map(&self) -> &BTreeMap<String, bool> {
        &self.decisions
    }

    pub fn into_map(self) -> BTreeMap<String, bool> {
        self.decisions
    }

    fn mark_seen(&mut self, name: &str) {
        if !self.decisions.contains_key(name) {
            self.decisions.insert(name.to_string(), false);
        }
    }

    fn mark_keep(&mut self, name: &str) {
        if let Some(keep) = self.decisions.get_mut(name) {
            *keep = true;
        } else {
            self.decisions.insert(name.to_string(), true);
        }
    }
}

impl From<BTreeMap<String, bool>> for RetentionVerdict {
    fn from(decisions: BTreeMap<String, bool>) -> Self {
        Self { decisions }
    }
}

impl IntoIterator for RetentionVerdict {
    type Item = (String, bool);
    type IntoIter = btree_map::IntoIter<String, bool>;

    fn into_iter(self) -> Self::IntoIter {
        self.decisions.into_iter()
    }
}

/// Order records newest first
///
/// The sort is stable: records with equal timestamps keep their input order.
/// Records with an unknown timestamp count as the oldest and sort last.
pub fn newest_first(records: &[SnapshotRecord]) -> Vec<&SnapshotRecord> {
    let mut ordered: Vec<&SnapshotRecord> = records.iter().collect();
    ordered.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    ordered
}

/// Classify every record under `policy` as of `now`
///
/// When a name occurs more than once the name is kept if any occurrence is.
pub fn evaluate(records: &[SnapshotRecord], policy: &RetentionPolicy, now: DateTime<Utc>) -> RetentionVerdict {
    let ordered = newest_first(records);
    let mut verdict = RetentionVerdict::new();

    for record in &ordered {
        verdict.mark_seen(&record.name);
    }

    if policy.keep_last > 0 {
        for record in ordered.iter().take(policy.keep_last) {
            verdict.mark_keep(&record.name);
        }
    }

    let windows = policy.enabled_windows();
    if !windows.is_empty() {
        for record in &ordered {
            let Some(age) = record.age_at(now) else {
                continue;
            };
            let inside = windows.iter().any(|(_, limit)| match limit {
                Some(limit) => age <= *limit,
                None => true,
            });
            if inside {
                verdict.mark_keep(&record.name);
            }
        }
    }

    debug!(
        records = records.len(),
        kept = verdict.kept().count(),
        deleted = verdict.deleted().count(),
        "Evaluated retention policy"
    );
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Location;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn aged(name: &str, age: TimeDelta) -> SnapshotRecord {
        SnapshotRecord::local(name, now() - age)
    }

    #[test]
    fn test_unit_lengths() {
        assert_eq!(TimeUnit::Week.window(1), Some(TimeDelta::days(7)));
        assert_eq!(TimeUnit::Month.window(2), Some(TimeDelta::days(60)));
        assert_eq!(TimeUnit::Year.window(1), Some(TimeDelta::days(365)));
        assert_eq!(TimeUnit::Year.window(u32::MAX), None);
    }

    #[test]
    fn test_default_policy_matches_documented_thresholds() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.keep_last, 5);
        assert_eq!(policy.keep_within(TimeUnit::Hour), 24);
        assert_eq!(policy.keep_within(TimeUnit::Year), 1);
        assert!(!policy.is_disabled());
        assert!(RetentionPolicy::disabled().is_disabled());
    }

    #[test]
    fn test_policy_deserializes_with_missing_fields_as_defaults() {
        let policy: RetentionPolicy = serde_json::from_str(r#"{"keep_last": 2}"#).unwrap();
        assert_eq!(policy.keep_last, 2);
        assert_eq!(policy.keep_days, 7);
    }

    #[test]
    fn test_keep_last_and_day_window_scenario() {
        let records = vec![
            aged("n1.db", TimeDelta::zero()),
            aged("n2.db", TimeDelta::days(1)),
            aged("n3.db", TimeDelta::days(10)),
            aged("n4.db", TimeDelta::days(20)),
        ];
        let policy = RetentionPolicy::keep_last(2);

        let verdict = evaluate(&records, &policy, now());

        assert_eq!(verdict.get("n1.db"), Some(true));
        assert_eq!(verdict.get("n2.db"), Some(true));
        assert_eq!(verdict.get("n3.db"), Some(false));
        assert_eq!(verdict.get("n4.db"), Some(false));
    }

    #[test]
    fn test_keep_last_uses_recency_not_input_order() {
        let records = vec![
            aged("old.db", TimeDelta::days(9)),
            aged("new.db", TimeDelta::hours(1)),
            aged("mid.db", TimeDelta::days(2)),
        ];

        let verdict = evaluate(&records, &RetentionPolicy::keep_last(1), now());

        assert_eq!(verdict.kept().collect::<Vec<_>>(), vec!["new.db"]);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let records = vec![
            aged("edge.db", TimeDelta::hours(24)),
            aged("past.db", TimeDelta::hours(24) + TimeDelta::seconds(1)),
        ];
        let policy = RetentionPolicy::disabled().with_window(TimeUnit::Day, 1);

        let verdict = evaluate(&records, &policy, now());

        assert!(verdict.keeps("edge.db"));
        assert!(!verdict.keeps("past.db"));
    }

    #[test]
    fn test_future_timestamps_fall_inside_windows() {
        let records = vec![aged("skewed.db", -TimeDelta::minutes(10))];
        let policy = RetentionPolicy::disabled().with_window(TimeUnit::Hour, 1);

        assert!(evaluate(&records, &policy, now()).keeps("skewed.db"));
    }

    #[test]
    fn test_unknown_timestamp_is_oldest() {
        let records = vec![
            SnapshotRecord::new("unknown.db", Location::Local),
            aged("fresh.db", TimeDelta::hours(1)),
        ];

        let windowed = RetentionPolicy::disabled().with_window(TimeUnit::Year, 100);
        let verdict = evaluate(&records, &windowed, now());
        assert!(!verdict.keeps("unknown.db"));
        assert!(verdict.keeps("fresh.db"));

        let verdict = evaluate(&records, &RetentionPolicy::keep_last(1), now());
        assert!(!verdict.keeps("unknown.db"));
    }

    #[test]
    fn test_unbounded_window_keeps_everything_dated() {
        let records = vec![aged("ancient.db", TimeDelta::days(365 * 200))];
        let policy = RetentionPolicy::disabled().with_window(TimeUnit::Year, u32::MAX);

        assert!(evaluate(&records, &policy, now()).keeps("ancient.db"));
    }

    #[test]
    fn test_empty_listing_yields_empty_verdict() {
        let verdict = evaluate(&[], &RetentionPolicy::default(), now());
        assert!(verdict.is_empty());
        assert!(!verdict.keeps("anything.db"));
    }
}
