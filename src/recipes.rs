//! Per-change-number summaries ("recipes") used to answer incremental
//! `splitChanges` polls without scanning the full mirror.
//!
//! Each recipe records which split names were updated or removed at one
//! change number. Answering `since=N` is then a union of the recipes newer
//! than `N`, which is O(|delta|) instead of O(|flags|).

use std::collections::{BTreeMap, HashSet};

use crate::dtos::{SplitChanges, SplitStatus};

/// Retention window: number of change numbers kept before the oldest
/// recipes are evicted.
pub const DEFAULT_RETAINED_RECIPES: usize = 1000;

/// Bound on summaries registered from fallback fetches for pre-window
/// change numbers.
pub const DEFAULT_RETAINED_OLDER: usize = 100;

/// Returned when the requested `since` predates the retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("summary for requested change number not cached")]
pub struct SummaryNotCached;

/// Net effect of all changes after a given change number.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSummary {
    pub updated: HashSet<String>,
    pub removed: HashSet<String>,
}

#[derive(Debug, Default, Clone)]
struct Recipe {
    updated: HashSet<String>,
    removed: HashSet<String>,
}

/// Ordered recipe cache with a bounded retention window.
///
/// `floor` is the change number below which history has been lost, either
/// to eviction or because the cache was hydrated from a snapshot that only
/// carries the latest state. Queries below the floor are not servable.
#[derive(Debug)]
pub struct ChangeSummaries {
    recipes: BTreeMap<i64, Recipe>,
    /// Summaries for pre-window change numbers, registered after fallback
    /// fetches. Keyed at `since + 1`, each covering `(since, its till]`.
    older: BTreeMap<i64, Recipe>,
    till: i64,
    floor: i64,
    max_recipes: usize,
    max_older: usize,
}

impl Default for ChangeSummaries {
    fn default() -> Self {
        ChangeSummaries::new(DEFAULT_RETAINED_RECIPES)
    }
}

impl ChangeSummaries {
    pub fn new(max_recipes: usize) -> Self {
        ChangeSummaries {
            recipes: BTreeMap::new(),
            older: BTreeMap::new(),
            till: -1,
            floor: -1,
            max_recipes: max_recipes.max(1),
            max_older: DEFAULT_RETAINED_OLDER,
        }
    }

    /// Highest change number observed.
    pub fn till(&self) -> i64 {
        self.till
    }

    /// Mark everything up to `change_number` as known-but-unsummarized.
    /// Called when the mirror is hydrated from a snapshot: the snapshot has
    /// the latest state but no per-change history.
    pub fn hydrate(&mut self, change_number: i64) {
        self.till = self.till.max(change_number);
        self.floor = self.floor.max(change_number);
    }

    /// Record the delta applied at `change_number`.
    pub fn add_changes(
        &mut self,
        change_number: i64,
        updated: impl IntoIterator<Item = String>,
        removed: impl IntoIterator<Item = String>,
    ) {
        let recipe = self.recipes.entry(change_number).or_default();
        for name in updated {
            recipe.removed.remove(&name);
            recipe.updated.insert(name);
        }
        for name in removed {
            recipe.updated.remove(&name);
            recipe.removed.insert(name);
        }
        self.till = self.till.max(change_number);
        self.evict_oldest();
    }

    /// Register the result of a direct upstream fetch done on behalf of a
    /// client whose `since` had already been evicted. The payload covers
    /// `(since, till]`, so it is keyed at `since + 1` and serves future
    /// polls with the same `since` from the cache.
    pub fn register_older_cn(&mut self, changes: &SplitChanges) {
        if changes.since < 0 {
            return;
        }
        let recipe = self.older.entry(changes.since + 1).or_default();
        for split in &changes.splits {
            match split.status {
                SplitStatus::Archived => {
                    recipe.updated.remove(&split.name);
                    recipe.removed.insert(split.name.clone());
                }
                SplitStatus::Active => {
                    recipe.removed.remove(&split.name);
                    recipe.updated.insert(split.name.clone());
                }
            }
        }
        self.till = self.till.max(changes.till);
        while self.older.len() > self.max_older {
            let oldest = match self.older.keys().next().copied() {
                Some(key) => key,
                None => break,
            };
            self.older.remove(&oldest);
        }
    }

    /// Net summary of everything that changed after `since`, plus the
    /// change number the summary brings the caller up to.
    pub fn fetch_since(&self, since: i64) -> Result<(ChangeSummary, i64), SummaryNotCached> {
        if since >= self.till {
            return Ok((ChangeSummary::default(), self.till.max(since)));
        }

        // Servable when no change after `since` has been lost, or when a
        // registered fetch keyed exactly at `since + 1` fills the gap.
        let mut summary = ChangeSummary::default();
        if since < self.floor {
            let registered = self.older.get(&(since + 1)).ok_or(SummaryNotCached)?;
            apply_recipe(&mut summary, registered);
        }
        for (_, recipe) in self.recipes.range(since + 1..) {
            apply_recipe(&mut summary, recipe);
        }
        Ok((summary, self.till))
    }

    fn evict_oldest(&mut self) {
        while self.recipes.len() > self.max_recipes {
            let oldest = match self.recipes.keys().next().copied() {
                Some(key) => key,
                None => return,
            };
            self.recipes.remove(&oldest);
            self.floor = self.floor.max(oldest);
        }
    }
}

fn apply_recipe(summary: &mut ChangeSummary, recipe: &Recipe) {
    for name in &recipe.updated {
        summary.removed.remove(name);
        summary.updated.insert(name.clone());
    }
    for name in &recipe.removed {
        summary.updated.remove(name);
        summary.removed.insert(name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtos::Split;

    fn names(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn since_at_till_yields_empty_summary() {
        let mut summaries = ChangeSummaries::default();
        summaries.add_changes(10, vec!["a".into(), "b".into()], vec![]);

        let (summary, till) = summaries.fetch_since(10).unwrap();
        assert_eq!(till, 10);
        assert!(summary.updated.is_empty());
        assert!(summary.removed.is_empty());
    }

    #[test]
    fn updates_then_removal_nets_to_removed() {
        let mut summaries = ChangeSummaries::default();
        summaries.add_changes(10, vec!["a".into()], vec![]);
        summaries.add_changes(20, vec![], vec!["a".into()]);

        let (summary, till) = summaries.fetch_since(5).unwrap();
        assert_eq!(till, 20);
        assert!(summary.updated.is_empty());
        assert_eq!(summary.removed, names(&["a"]));
    }

    #[test]
    fn removal_then_readd_nets_to_updated() {
        let mut summaries = ChangeSummaries::default();
        summaries.add_changes(10, vec![], vec!["a".into()]);
        summaries.add_changes(20, vec!["a".into()], vec![]);

        let (summary, _) = summaries.fetch_since(5).unwrap();
        assert_eq!(summary.updated, names(&["a"]));
        assert!(summary.removed.is_empty());
    }

    #[test]
    fn evicted_since_is_not_cached() {
        let mut summaries = ChangeSummaries::new(2);
        summaries.add_changes(10, vec!["a".into()], vec![]);
        summaries.add_changes(20, vec!["b".into()], vec![]);
        summaries.add_changes(30, vec!["c".into()], vec![]);

        assert_eq!(summaries.fetch_since(5), Err(SummaryNotCached));
        let (summary, till) = summaries.fetch_since(19).unwrap();
        assert_eq!(till, 30);
        assert_eq!(summary.updated, names(&["b", "c"]));
    }

    #[test]
    fn hydrated_cache_rejects_older_since() {
        let mut summaries = ChangeSummaries::default();
        summaries.hydrate(100);

        assert_eq!(summaries.fetch_since(50), Err(SummaryNotCached));
        let (summary, till) = summaries.fetch_since(100).unwrap();
        assert_eq!(till, 100);
        assert!(summary.updated.is_empty());
    }

    #[test]
    fn registered_older_cn_serves_future_polls() {
        let mut summaries = ChangeSummaries::new(2);
        summaries.add_changes(10, vec!["a".into()], vec![]);
        summaries.add_changes(20, vec!["b".into()], vec![]);
        summaries.add_changes(30, vec!["c".into()], vec![]);
        assert_eq!(summaries.fetch_since(1), Err(SummaryNotCached));

        // What an upstream fetch with since=1 would have returned.
        let fetched = SplitChanges {
            splits: vec![
                Split::archived_tombstone("gone", 25),
                Split {
                    name: "b".to_string(),
                    traffic_type_name: "user".to_string(),
                    status: SplitStatus::Active,
                    killed: false,
                    default_treatment: "off".to_string(),
                    change_number: 20,
                    conditions: serde_json::Value::Null,
                },
            ],
            since: 1,
            till: 30,
        };
        summaries.register_older_cn(&fetched);

        let (summary, till) = summaries.fetch_since(1).unwrap();
        assert_eq!(till, 30);
        assert!(summary.updated.contains("b"));
        assert!(summary.removed.contains("gone"));
    }

    #[test]
    fn till_never_decreases() {
        let mut summaries = ChangeSummaries::default();
        summaries.add_changes(30, vec!["a".into()], vec![]);
        summaries.add_changes(10, vec!["b".into()], vec![]);
        assert_eq!(summaries.till(), 30);
    }
}
