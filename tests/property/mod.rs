//! Property-based testing for tierback
//!
//! Uses proptest to check the retention classifier's invariants over
//! randomly generated backup histories and capacities.

use ::tierback::retention::{CalendarKeys, PeriodKeys, Verdict};
use ::tierback::*;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2022, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
}

/// Unique backup ids within roughly two years, at minute resolution
fn history_strategy(max: usize) -> impl Strategy<Value = Vec<BackupId>> {
    prop::collection::btree_set(0i64..(2 * 366 * 24 * 60), 0..max).prop_map(|minutes| {
        minutes
            .into_iter()
            .map(|m| BackupId::from_datetime(epoch() + Duration::minutes(m)))
            .collect()
    })
}

/// Backups on distinct days
fn distinct_days_strategy(max: usize) -> impl Strategy<Value = Vec<BackupId>> {
    prop::collection::btree_set(0i64..730, 0..max).prop_map(|days| {
        days.into_iter()
            .map(|d| BackupId::from_datetime(epoch() + Duration::days(d) + Duration::hours(3)))
            .collect()
    })
}

fn policy_strategy() -> impl Strategy<Value = RetentionPolicy> {
    (0usize..10, 0usize..6, 0usize..5).prop_map(|(d, w, m)| RetentionPolicy::new(d, w, m))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_every_backup_gets_one_verdict(ids in history_strategy(80), policy in policy_strategy()) {
        let result = RetentionClassifier::new(policy).classify(&ids);

        prop_assert_eq!(result.decisions.len(), ids.len());
        let seen: HashSet<BackupId> = result.decisions.iter().map(|(id, _)| *id).collect();
        prop_assert_eq!(seen.len(), ids.len());
        prop_assert_eq!(result.kept().len() + result.to_delete().len(), ids.len());
    }

    #[test]
    fn prop_tiers_respect_capacity_and_keys(ids in history_strategy(80), policy in policy_strategy()) {
        let result = RetentionClassifier::new(policy).classify(&ids);

        for tier in Tier::ALL {
            let kept_here: Vec<BackupId> = result
                .kept()
                .into_iter()
                .filter(|(_, t)| *t == tier)
                .map(|(id, _)| id)
                .collect();
            prop_assert!(kept_here.len() <= policy.capacity(tier));
            prop_assert_eq!(kept_here.len(), result.tier(tier).occupied());

            let keys: HashSet<String> = kept_here
                .iter()
                .map(|id| CalendarKeys.key(tier, id.timestamp()))
                .collect();
            prop_assert_eq!(keys.len(), kept_here.len(), "duplicate {} key", tier);
        }
    }

    #[test]
    fn prop_newest_is_kept_when_daily_has_room(ids in history_strategy(40), policy in policy_strategy()) {
        prop_assume!(!ids.is_empty() && policy.daily > 0);
        let result = RetentionClassifier::new(policy).classify(&ids);
        let newest = *ids.iter().max().unwrap();
        prop_assert_eq!(result.verdict(newest), Some(Verdict::Keep(Tier::Daily)));
    }

    #[test]
    fn prop_small_sets_stay_daily(ids in distinct_days_strategy(12), extra in 0usize..5) {
        let policy = RetentionPolicy::new(ids.len() + extra, 4, 3);
        let result = RetentionClassifier::new(policy).classify(&ids);

        prop_assert!(result.to_delete().is_empty());
        prop_assert!(result.kept().iter().all(|(_, tier)| *tier == Tier::Daily));
        prop_assert_eq!(result.tier(Tier::Weekly).occupied(), 0);
        prop_assert_eq!(result.tier(Tier::Monthly).occupied(), 0);
    }

    #[test]
    fn prop_input_order_is_irrelevant(ids in history_strategy(60), policy in policy_strategy(), seed in any::<u64>()) {
        let mut shuffled = ids.clone();
        // Deterministic rotation-based shuffle
        if !shuffled.is_empty() {
            let pivot = (seed as usize) % shuffled.len();
            shuffled.rotate_left(pivot);
            shuffled.reverse();
        }

        let a = RetentionClassifier::new(policy).classify(&ids);
        let b = RetentionClassifier::new(policy).classify(&shuffled);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_daily_tier_holds_the_newest_days(ids in distinct_days_strategy(60), daily in 1usize..10) {
        let result = RetentionClassifier::new(RetentionPolicy::new(daily, 0, 0)).classify(&ids);

        let expected: BTreeSet<BackupId> = ids.iter().rev().take(daily).copied().collect();
        let kept: BTreeSet<BackupId> = result.kept().into_iter().map(|(id, _)| id).collect();
        prop_assert_eq!(kept, expected);
    }
}
