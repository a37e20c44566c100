//! Tiered retention classification
//!
//! Decides which backups survive rotation under daily, weekly and monthly
//! quotas.
//!
//! ## Algorithm
//!
//! Backups are visited newest to oldest. For each one the classifier
//! computes its day, ISO-week and month keys and tries the tiers in fixed
//! order daily, weekly, monthly. A tier claims the backup when
//!
//! - the tier still has capacity, and
//! - the backup's key for that tier has not been claimed in that tier yet.
//!
//! The first tier that claims it keeps the backup and records the claim in
//! that tier only. A backup no tier claims is deleted.
//!
//! Consequences worth knowing:
//!
//! - Recency wins: the newest backup of a day takes that day's daily slot.
//!   An older backup from the same day falls through to weekly, then
//!   monthly, and is deleted only if those cannot take it either.
//! - Tiers are independent: a full daily tier leaves weekly and monthly
//!   capacity untouched, and a daily claim does not claim the week or month.
//!
//! ## Period keys
//!
//! Keys come from a [`PeriodKeys`] implementation. [`CalendarKeys`] uses
//! `%Y-%m-%d`, ISO `%G-W%V` and `%Y-%m`; tests can plug in any
//! `Fn(Tier, NaiveDateTime) -> String`.
//!
//! ```rust
//! use tierback::retention::{RetentionClassifier, RetentionPolicy};
//! use tierback::types::BackupId;
//!
//! let ids: Vec<BackupId> = ["2023-11-05-0100", "2023-11-04-0100", "2023-11-03-0100"]
//!     .iter()
//!     .map(|s| BackupId::parse(s).unwrap())
//!     .collect();
//!
//! let classifier = RetentionClassifier::new(RetentionPolicy::new(2, 0, 0));
//! let result = classifier.classify(&ids);
//! assert_eq!(result.to_delete(), vec![ids[2]]);
//! ```

use crate::types::{BackupId, BackupRecord, Tier};
use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Maps a timestamp to the period it belongs to for a tier
pub trait PeriodKeys {
    /// Canonical key of the period containing `at`
    fn key(&self, tier: Tier, at: NaiveDateTime) -> String;
}

impl<F> PeriodKeys for F
where
    F: Fn(Tier, NaiveDateTime) -> String,
{
    fn key(&self, tier: Tier, at: NaiveDateTime) -> String {
        self(tier, at)
    }
}

/// Calendar day, ISO week and calendar month keys
#[derive(Debug, Clone, Copy, Default)]
pub struct CalendarKeys;

impl PeriodKeys for CalendarKeys {
    fn key(&self, tier: Tier, at: NaiveDateTime) -> String {
        match tier {
            Tier::Daily => at.format("%Y-%m-%d").to_string(),
            Tier::Weekly => {
                let week = at.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Tier::Monthly => at.format("%Y-%m").to_string(),
        }
    }
}

/// Capacity of each tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Daily slots
    pub daily: usize,
    /// Weekly slots
    pub weekly: usize,
    /// Monthly slots
    pub monthly: usize,
}

impl RetentionPolicy {
    /// Policy with the given capacities
    pub fn new(daily: usize, weekly: usize, monthly: usize) -> Self {
        Self { daily, weekly, monthly }
    }

    /// Capacity of one tier
    pub fn capacity(&self, tier: Tier) -> usize {
        match tier {
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
            Tier::Monthly => self.monthly,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(7, 4, 3)
    }
}

/// Claims made in one tier during a classification pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionTier {
    /// Which tier
    pub tier: Tier,
    /// Maximum number of claims
    pub capacity: usize,
    /// Period key to the backup holding it
    pub claims: BTreeMap<String, BackupId>,
}

impl RetentionTier {
    fn new(tier: Tier, capacity: usize) -> Self {
        Self { tier, capacity, claims: BTreeMap::new() }
    }

    /// Number of backups this tier keeps
    pub fn occupied(&self) -> usize {
        self.claims.len()
    }

    /// Whether `key` can still be claimed here
    fn can_claim(&self, key: &str) -> bool {
        self.occupied() < self.capacity && !self.claims.contains_key(key)
    }
}

/// Fate of one backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Kept by the given tier
    Keep(Tier),
    /// Removed by rotation
    Delete,
}

/// Outcome of classifying a backup set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Every input id with its verdict, newest first
    pub decisions: Vec<(BackupId, Verdict)>,
    /// Final claim state of the daily, weekly and monthly tiers
    pub tiers: [RetentionTier; 3],
}

impl Classification {
    /// Ids to delete, newest first
    pub fn to_delete(&self) -> Vec<BackupId> {
        self.decisions
            .iter()
            .filter(|(_, v)| *v == Verdict::Delete)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Kept ids with the tier that claimed them, newest first
    pub fn kept(&self) -> Vec<(BackupId, Tier)> {
        self.decisions
            .iter()
            .filter_map(|(id, v)| match v {
                Verdict::Keep(tier) => Some((*id, *tier)),
                Verdict::Delete => None,
            })
            .collect()
    }

    /// Verdict for one id
    pub fn verdict(&self, id: BackupId) -> Option<Verdict> {
        self.decisions.iter().find(|(i, _)| *i == id).map(|(_, v)| *v)
    }

    /// Claim state of one tier
    pub fn tier(&self, tier: Tier) -> &RetentionTier {
        match tier {
            Tier::Daily => &self.tiers[0],
            Tier::Weekly => &self.tiers[1],
            Tier::Monthly => &self.tiers[2],
        }
    }
}

/// Greedy newest-first tier classifier
#[derive(Debug, Clone)]
pub struct RetentionClassifier<K = CalendarKeys> {
    policy: RetentionPolicy,
    keys: K,
}

impl RetentionClassifier<CalendarKeys> {
    /// Classifier using calendar period keys
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy, keys: CalendarKeys }
    }
}

impl<K: PeriodKeys> RetentionClassifier<K> {
    /// Classifier with custom period keys
    pub fn with_keys(policy: RetentionPolicy, keys: K) -> Self {
        Self { policy, keys }
    }

    /// Policy in use
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Classify backup ids
    ///
    /// The input order does not matter; ids are processed newest first.
    pub fn classify(&self, ids: &[BackupId]) -> Classification {
        let mut ordered = ids.to_vec();
        ordered.sort_unstable_by(|a, b| b.cmp(a));

        let mut tiers = Tier::ALL.map(|tier| RetentionTier::new(tier, self.policy.capacity(tier)));
        let mut decisions = Vec::with_capacity(ordered.len());

        for id in ordered {
            let at = id.timestamp();
            let mut verdict = Verdict::Delete;

            for state in tiers.iter_mut() {
                let key = self.keys.key(state.tier, at);
                if state.can_claim(&key) {
                    trace!(backup = %id, tier = %state.tier, key = %key, "Claimed");
                    state.claims.insert(key, id);
                    verdict = Verdict::Keep(state.tier);
                    break;
                }
            }

            decisions.push((id, verdict));
        }

        let classification = Classification { decisions, tiers };
        debug!(
            total = classification.decisions.len(),
            daily = classification.tiers[0].occupied(),
            weekly = classification.tiers[1].occupied(),
            monthly = classification.tiers[2].occupied(),
            delete = classification.to_delete().len(),
            "Classified backups"
        );
        classification
    }

    /// Classify catalog records and return those to delete, newest first
    pub fn select_for_deletion<'a>(&self, records: &'a [BackupRecord]) -> (Classification, Vec<&'a BackupRecord>) {
        let ids: Vec<BackupId> = records.iter().map(|r| r.id).collect();
        let classification = self.classify(&ids);
        let doomed = classification
            .to_delete()
            .into_iter()
            .filter_map(|id| records.iter().find(|r| r.id == id))
            .collect();
        (classification, doomed)
    }
}
