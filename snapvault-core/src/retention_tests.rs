/*!
Randomized property checks for retention evaluation, reconciliation and gap
detection.
*/

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::gaps::{find_gaps, remote_name_set};
    use crate::reconcile::{merge_listings, reconcile};
    use crate::record::{Location, SnapshotRecord};
    use crate::retention::{evaluate, RetentionPolicy, TimeUnit};

    const SEEDS: [u64; 8] = [1, 7, 42, 99, 1234, 2024, 31337, 65535];

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// Listing with unique names and pairwise distinct timestamps
    fn listing(rng: &mut StdRng, location: Location, len: usize) -> Vec<SnapshotRecord> {
        (0..len)
            .map(|i| {
                let age = TimeDelta::seconds(rng.gen_range(0..400 * 86_400)) + TimeDelta::milliseconds(i as i64);
                SnapshotRecord::new(format!("snap-{i:03}.db.zst"), location).modified(now() - age)
            })
            .collect()
    }

    fn random_policy(rng: &mut StdRng) -> RetentionPolicy {
        let mut policy = RetentionPolicy::keep_last(rng.gen_range(0..6));
        for unit in TimeUnit::ALL {
            if rng.gen_bool(0.4) {
                policy = policy.with_window(unit, rng.gen_range(1..5));
            }
        }
        policy
    }

    #[test]
    fn test_disabled_policy_deletes_everything() {
        for seed in SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let records = listing(&mut rng, Location::Local, 40);

            let verdict = evaluate(&records, &RetentionPolicy::disabled(), now());

            assert_eq!(verdict.len(), records.len());
            assert_eq!(verdict.kept().count(), 0, "seed {seed}");
        }
    }

    #[test]
    fn test_every_name_gets_a_decision() {
        for seed in SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let records = listing(&mut rng, Location::Local, 25);
            let policy = random_policy(&mut rng);

            let verdict = evaluate(&records, &policy, now());

            for record in &records {
                assert!(verdict.contains(&record.name), "seed {seed}: {} missing", record.name);
            }
        }
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        for seed in SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let records = listing(&mut rng, Location::Local, 30);
            let policy = random_policy(&mut rng);

            assert_eq!(evaluate(&records, &policy, now()), evaluate(&records, &policy, now()));
        }
    }

    #[test]
    fn test_keep_last_alone_keeps_exactly_the_newest() {
        for seed in SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let len = rng.gen_range(0..20);
            let records = listing(&mut rng, Location::Local, len);
            let count = rng.gen_range(0..25);

            let verdict = evaluate(&records, &RetentionPolicy::keep_last(count), now());

            let mut by_age = records.clone();
            by_age.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
            let expected: HashSet<_> = by_age.iter().take(count).map(|r| r.name.as_str()).collect();
            let kept: HashSet<_> = verdict.kept().collect();
            assert_eq!(kept, expected, "seed {seed}");
            assert_eq!(kept.len(), count.min(len));
        }
    }

    #[test]
    fn test_raising_keep_last_never_drops_a_snapshot() {
        for seed in SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let records = listing(&mut rng, Location::Local, 30);
            let base = random_policy(&mut rng);

            for count in 0..10 {
                let smaller = evaluate(&records, &base.with_keep_last(count), now());
                let larger = evaluate(&records, &base.with_keep_last(count + 1), now());
                for name in smaller.kept() {
                    assert!(larger.keeps(name), "seed {seed}: {name} dropped at {}", count + 1);
                }
            }
        }
    }

    #[test]
    fn test_one_hour_old_snapshot_is_inside_every_window() {
        let records = vec![SnapshotRecord::local("recent.db", now() - TimeDelta::hours(1))];

        for unit in TimeUnit::ALL {
            let policy = RetentionPolicy::disabled().with_window(unit, 1);
            assert!(evaluate(&records, &policy, now()).keeps("recent.db"), "{unit:?}");
        }
    }

    #[test]
    fn test_reconcile_is_symmetric_for_distinct_timestamps() {
        for seed in SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let local = listing(&mut rng, Location::Local, 20);
            // Same names, different instants: every shared name has a clear winner.
            let remote: Vec<_> = listing(&mut rng, Location::Remote, 30)
                .into_iter()
                .map(|record| {
                    let at = record.modified_at.map(|at| at + TimeDelta::microseconds(1));
                    SnapshotRecord { modified_at: at, ..record }
                })
                .collect();
            let policy = random_policy(&mut rng);

            let forward = reconcile(&local, &remote, &policy, now()).unwrap();
            let backward = reconcile(&remote, &local, &policy, now()).unwrap();

            assert_eq!(forward, backward, "seed {seed}");
        }
    }

    #[test]
    fn test_merge_keeps_freshest_copy_of_each_name() {
        for seed in SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let local = listing(&mut rng, Location::Local, 15);
            let remote = listing(&mut rng, Location::Remote, 15);

            let merged = merge_listings(&local, &remote);

            assert_eq!(merged.len(), 15);
            for (i, record) in merged.iter().enumerate() {
                let newest = local[i].modified_at.max(remote[i].modified_at);
                assert_eq!(record.modified_at, newest, "seed {seed}");
            }
        }
    }

    #[test]
    fn test_equal_timestamps_keep_input_order_and_local_copy() {
        let at = now() - TimeDelta::days(1);
        let records = vec![
            SnapshotRecord::local("first.db", at),
            SnapshotRecord::local("second.db", at),
            SnapshotRecord::local("third.db", at),
        ];

        let verdict = evaluate(&records, &RetentionPolicy::keep_last(2), now());
        assert_eq!(verdict.kept().collect::<Vec<_>>(), vec!["first.db", "second.db"]);

        let merged = merge_listings(
            &[SnapshotRecord::local("a.db", at)],
            &[SnapshotRecord::remote("a.db", at)],
        );
        assert_eq!(merged[0].location, Location::Local);
    }

    #[test]
    fn test_gaps_are_kept_local_records_absent_remotely() {
        for seed in SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let local = listing(&mut rng, Location::Local, 30);
            let remote: Vec<_> = local
                .iter()
                .filter(|_| rng.gen_bool(0.5))
                .map(|record| SnapshotRecord {
                    location: Location::Remote,
                    ..record.clone()
                })
                .collect();
            let policy = random_policy(&mut rng);

            let verdict = reconcile(&local, &remote, &policy, now()).unwrap();
            let remote_names = remote_name_set(&remote);
            let scan = find_gaps(&local, Some(&remote_names), &verdict);
            let gaps = scan.gaps().unwrap();

            for gap in gaps {
                assert!(verdict.keeps(&gap.name));
                assert!(!remote_names.contains(&gap.name));
            }
            let expected = local
                .iter()
                .filter(|r| verdict.keeps(&r.name) && !remote_names.contains(&r.name))
                .count();
            assert_eq!(gaps.len(), expected, "seed {seed}");
        }
    }
}
