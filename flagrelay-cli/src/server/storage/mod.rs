//! Authoritative in-memory mirror of upstream split and segment state.
//!
//! The split side combines three substructures: the mirror (latest active
//! splits), the recipe cache (per-change-number summaries for incremental
//! polls) and the optional persistent snapshot. A composite update touches
//! all three under one writer lock; readers take the finer locks and see
//! either the pre- or the post-update state, never a partial one.

pub mod disk;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use flagrelay_lib::{
    ChangeSummaries, SegmentChanges, Split, SplitChanges, SummaryNotCached,
};
use serde::{Deserialize, Serialize};

use self::disk::{PersistedSegment, SnapshotStore};

/// One membership change of one key within a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDelta {
    pub key: String,
    pub removed: bool,
    pub change_number: i64,
}

#[derive(Debug, Default)]
struct SplitMirror {
    splits: HashMap<String, Split>,
    change_number: i64,
}

/// Split storage facade: mirror + recipes + snapshot.
pub struct SplitStorage {
    mirror: RwLock<SplitMirror>,
    recipes: Mutex<ChangeSummaries>,
    disk: Option<Arc<SnapshotStore>>,
    update_lock: Mutex<()>,
}

impl SplitStorage {
    /// Build the storage, hydrating the mirror from the snapshot when one
    /// is available.
    pub fn new(disk: Option<Arc<SnapshotStore>>) -> Self {
        let mut mirror = SplitMirror {
            splits: HashMap::new(),
            change_number: -1,
        };
        let mut recipes = ChangeSummaries::default();

        if let Some(store) = &disk {
            match store.load_splits() {
                Ok((splits, change_number)) => {
                    for split in splits {
                        mirror.splits.insert(split.name.clone(), split);
                    }
                    mirror.change_number = change_number;
                    recipes.hydrate(change_number);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "could not hydrate splits from snapshot");
                }
            }
        }

        SplitStorage {
            mirror: RwLock::new(mirror),
            recipes: Mutex::new(recipes),
            disk,
            update_lock: Mutex::new(()),
        }
    }

    pub fn change_number(&self) -> i64 {
        self.mirror
            .read()
            .expect("split mirror lock poisoned")
            .change_number
    }

    pub fn split_count(&self) -> usize {
        self.mirror
            .read()
            .expect("split mirror lock poisoned")
            .splits
            .len()
    }

    /// Names of all segments referenced by any active split.
    pub fn referenced_segments(&self) -> HashSet<String> {
        let mirror = self.mirror.read().expect("split mirror lock poisoned");
        let mut names = HashSet::new();
        for split in mirror.splits.values() {
            names.extend(split.referenced_segments());
        }
        names
    }

    /// Apply one upstream diff atomically across mirror, recipes and
    /// snapshot. No-op when both lists are empty. Change numbers only move
    /// forward.
    pub fn update(&self, to_add: Vec<Split>, to_remove: Vec<Split>, change_number: i64) {
        if to_add.is_empty() && to_remove.is_empty() {
            return;
        }
        let _guard = self.update_lock.lock().expect("split update lock poisoned");

        let added_names: Vec<String> = to_add.iter().map(|split| split.name.clone()).collect();
        let removed_names: Vec<String> = to_remove.iter().map(|split| split.name.clone()).collect();

        {
            let mut mirror = self.mirror.write().expect("split mirror lock poisoned");
            if change_number < mirror.change_number {
                return;
            }
            for split in &to_add {
                mirror.splits.insert(split.name.clone(), split.clone());
            }
            for name in &removed_names {
                mirror.splits.remove(name);
            }
            mirror.change_number = mirror.change_number.max(change_number);
        }

        {
            let mut recipes = self.recipes.lock().expect("recipe lock poisoned");
            recipes.add_changes(change_number, added_names, removed_names.clone());
        }

        if let Some(store) = &self.disk {
            if let Err(err) = store.apply_split_changes(&to_add, &removed_names, change_number) {
                tracing::warn!(error = %err, "failed to persist split changes");
            }
        }
    }

    /// Mark a split as killed if the given change number is newer than the
    /// stored one.
    pub fn kill_locally(&self, name: &str, default_treatment: &str, change_number: i64) {
        let mut mirror = self.mirror.write().expect("split mirror lock poisoned");
        if let Some(split) = mirror.splits.get_mut(name) {
            if split.change_number < change_number {
                split.killed = true;
                split.default_treatment = default_treatment.to_string();
                split.change_number = change_number;
            }
        }
    }

    /// Build the `splitChanges` payload for `since`.
    pub fn changes_since(&self, since: i64) -> Result<SplitChanges, SummaryNotCached> {
        if since < 0 {
            let mirror = self.mirror.read().expect("split mirror lock poisoned");
            let mut splits: Vec<Split> = mirror.splits.values().cloned().collect();
            splits.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(SplitChanges {
                splits,
                since,
                till: mirror.change_number,
            });
        }

        let (summary, till) = {
            let recipes = self.recipes.lock().expect("recipe lock poisoned");
            recipes.fetch_since(since)?
        };

        let mirror = self.mirror.read().expect("split mirror lock poisoned");
        let mut splits = Vec::with_capacity(summary.updated.len() + summary.removed.len());
        for name in &summary.updated {
            if let Some(split) = mirror.splits.get(name) {
                splits.push(split.clone());
            }
        }
        for name in &summary.removed {
            // Current state wins: a name that was re-added after the
            // removal is served live, otherwise as an archived tombstone.
            match mirror.splits.get(name) {
                Some(split) => splits.push(split.clone()),
                None => splits.push(Split::archived_tombstone(name, till)),
            }
        }
        splits.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(SplitChanges { splits, since, till })
    }

    /// Make a fallback fetch's result servable from the cache.
    pub fn register_older_cn(&self, changes: &SplitChanges) {
        let mut recipes = self.recipes.lock().expect("recipe lock poisoned");
        recipes.register_older_cn(changes);
    }
}

#[derive(Debug, Default)]
struct SegmentState {
    change_number: i64,
    deltas: Vec<KeyDelta>,
    members: HashSet<String>,
}

impl SegmentState {
    fn from_persisted(persisted: PersistedSegment) -> Self {
        let mut members = HashSet::new();
        for delta in &persisted.deltas {
            if delta.removed {
                members.remove(&delta.key);
            } else {
                members.insert(delta.key.clone());
            }
        }
        SegmentState {
            change_number: persisted.change_number,
            deltas: persisted.deltas,
            members,
        }
    }
}

/// Segment storage: per-segment membership with an ordered delta log.
pub struct SegmentStorage {
    segments: RwLock<HashMap<String, SegmentState>>,
    disk: Option<Arc<SnapshotStore>>,
}

impl SegmentStorage {
    pub fn new(disk: Option<Arc<SnapshotStore>>) -> Self {
        let mut segments = HashMap::new();
        if let Some(store) = &disk {
            match store.load_segments() {
                Ok(persisted) => {
                    for (name, segment) in persisted {
                        segments.insert(name, SegmentState::from_persisted(segment));
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "could not hydrate segments from snapshot");
                }
            }
        }
        SegmentStorage {
            segments: RwLock::new(segments),
            disk,
        }
    }

    pub fn change_number(&self, name: &str) -> i64 {
        let segments = self.segments.read().expect("segment lock poisoned");
        segments.get(name).map(|s| s.change_number).unwrap_or(-1)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().expect("segment lock poisoned").len()
    }

    /// Apply one upstream segment diff. Deltas keep only the latest entry
    /// per key; change numbers only move forward.
    pub fn update(&self, name: &str, added: Vec<String>, removed: Vec<String>, till: i64) {
        let persisted = {
            let mut segments = self.segments.write().expect("segment lock poisoned");
            let state = segments.entry(name.to_string()).or_default();
            if till < state.change_number {
                return;
            }
            let affected: HashSet<&String> = added.iter().chain(removed.iter()).collect();
            state.deltas.retain(|delta| !affected.contains(&delta.key));
            for key in added {
                state.members.insert(key.clone());
                state.deltas.push(KeyDelta {
                    key,
                    removed: false,
                    change_number: till,
                });
            }
            for key in removed {
                state.members.remove(&key);
                state.deltas.push(KeyDelta {
                    key,
                    removed: true,
                    change_number: till,
                });
            }
            state.change_number = state.change_number.max(till);
            PersistedSegment {
                change_number: state.change_number,
                deltas: state.deltas.clone(),
            }
        };

        if let Some(store) = &self.disk {
            if let Err(err) = store.put_segment(name, &persisted) {
                tracing::warn!(segment = name, error = %err, "failed to persist segment");
            }
        }
    }

    /// Build the `segmentChanges` payload; `None` when the segment is
    /// unknown.
    pub fn changes_since(&self, name: &str, since: i64) -> Option<SegmentChanges> {
        let segments = self.segments.read().expect("segment lock poisoned");
        let state = segments.get(name)?;

        if since < 0 {
            let mut added: Vec<String> = Vec::new();
            let mut till = since;
            for delta in &state.deltas {
                if !delta.removed {
                    added.push(delta.key.clone());
                    till = till.max(delta.change_number);
                }
            }
            added.sort();
            return Some(SegmentChanges {
                name: name.to_string(),
                added,
                removed: Vec::new(),
                since,
                till,
            });
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut till = since;
        for delta in &state.deltas {
            till = till.max(delta.change_number);
            if delta.change_number <= since {
                continue;
            }
            if delta.removed {
                removed.push(delta.key.clone());
            } else {
                added.push(delta.key.clone());
            }
        }
        added.sort();
        removed.sort();
        Some(SegmentChanges {
            name: name.to_string(),
            added,
            removed,
            since,
            till,
        })
    }

    /// Names of all segments containing `key`.
    pub fn segments_for(&self, key: &str) -> Vec<String> {
        let segments = self.segments.read().expect("segment lock poisoned");
        let mut names: Vec<String> = segments
            .iter()
            .filter(|(_, state)| state.members.contains(key))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
