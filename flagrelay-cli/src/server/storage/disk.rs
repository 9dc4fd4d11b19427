//! Persistent snapshot of the mirror, backed by sled. Three logical
//! collections: `splits` (name -> serialized split), `segments` (name ->
//! serialized segment state), `meta` (change numbers).

use flagrelay_lib::Split;
use serde::{Deserialize, Serialize};

use super::KeyDelta;
use crate::server::error::StorageError;

const SPLITS_TREE: &str = "splits";
const SEGMENTS_TREE: &str = "segments";
const META_TREE: &str = "meta";
const SPLITS_CHANGE_NUMBER_KEY: &str = "splits.changeNumber";

/// On-disk form of one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSegment {
    pub change_number: i64,
    pub deltas: Vec<KeyDelta>,
}

pub struct SnapshotStore {
    splits: sled::Tree,
    segments: sled::Tree,
    meta: sled::Tree,
}

impl SnapshotStore {
    /// Open (or create) the snapshot database at the given directory.
    pub fn open(data_dir: &str) -> Result<Self, StorageError> {
        let db = sled::open(data_dir)?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(SnapshotStore {
            splits: db.open_tree(SPLITS_TREE)?,
            segments: db.open_tree(SEGMENTS_TREE)?,
            meta: db.open_tree(META_TREE)?,
        })
    }

    /// Persist one applied split update: upserts, removals and the new
    /// change number.
    pub fn apply_split_changes(
        &self,
        added: &[Split],
        removed: &[String],
        change_number: i64,
    ) -> Result<(), StorageError> {
        for split in added {
            let encoded = serde_json::to_vec(split)?;
            self.splits.insert(split.name.as_bytes(), encoded)?;
        }
        for name in removed {
            self.splits.remove(name.as_bytes())?;
        }
        self.meta
            .insert(SPLITS_CHANGE_NUMBER_KEY, change_number.to_be_bytes().to_vec())?;
        self.splits.flush()?;
        Ok(())
    }

    /// Load every persisted split plus the stored change number.
    pub fn load_splits(&self) -> Result<(Vec<Split>, i64), StorageError> {
        let mut splits = Vec::new();
        for entry in self.splits.iter() {
            let (_, value) = entry?;
            splits.push(serde_json::from_slice(&value)?);
        }
        let change_number = match self.meta.get(SPLITS_CHANGE_NUMBER_KEY)? {
            Some(bytes) => decode_i64(&bytes),
            None => -1,
        };
        Ok((splits, change_number))
    }

    pub fn put_segment(&self, name: &str, segment: &PersistedSegment) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(segment)?;
        self.segments.insert(name.as_bytes(), encoded)?;
        self.segments.flush()?;
        Ok(())
    }

    pub fn load_segments(&self) -> Result<Vec<(String, PersistedSegment)>, StorageError> {
        let mut segments = Vec::new();
        for entry in self.segments.iter() {
            let (key, value) = entry?;
            let name = String::from_utf8_lossy(&key).into_owned();
            segments.push((name, serde_json::from_slice(&value)?));
        }
        Ok(segments)
    }
}

fn decode_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    i64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagrelay_lib::SplitStatus;

    fn temp_store() -> SnapshotStore {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        SnapshotStore::from_db(&db).expect("snapshot trees")
    }

    fn split(name: &str, change_number: i64) -> Split {
        Split {
            name: name.to_string(),
            traffic_type_name: "user".to_string(),
            status: SplitStatus::Active,
            killed: false,
            default_treatment: "off".to_string(),
            change_number,
            conditions: serde_json::json!([{"matcherGroup": {"matchers": []}}]),
        }
    }

    #[test]
    fn splits_roundtrip_through_the_store() {
        let store = temp_store();
        store
            .apply_split_changes(&[split("a", 10), split("b", 10)], &[], 10)
            .unwrap();

        let (mut loaded, change_number) = store.load_splits().unwrap();
        loaded.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(change_number, 10);
        assert_eq!(loaded, vec![split("a", 10), split("b", 10)]);
    }

    #[test]
    fn removed_splits_disappear_from_the_store() {
        let store = temp_store();
        store
            .apply_split_changes(&[split("a", 10)], &[], 10)
            .unwrap();
        store
            .apply_split_changes(&[], &["a".to_string()], 20)
            .unwrap();

        let (loaded, change_number) = store.load_splits().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(change_number, 20);
    }

    #[test]
    fn segments_roundtrip_through_the_store() {
        let store = temp_store();
        let segment = PersistedSegment {
            change_number: 7,
            deltas: vec![
                KeyDelta {
                    key: "u1".to_string(),
                    removed: false,
                    change_number: 5,
                },
                KeyDelta {
                    key: "u2".to_string(),
                    removed: true,
                    change_number: 7,
                },
            ],
        };
        store.put_segment("beta-users", &segment).unwrap();

        let loaded = store.load_segments().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "beta-users");
        assert_eq!(loaded[0].1.change_number, 7);
        assert_eq!(loaded[0].1.deltas.len(), 2);
        assert_eq!(loaded[0].1.deltas[1].key, "u2");
        assert!(loaded[0].1.deltas[1].removed);
    }
}
