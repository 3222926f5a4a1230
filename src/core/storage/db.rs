// src/core/storage/db.rs

//! A single logical database: a concurrent map from key to MVCC-stamped value.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;

/// A stored value together with the MVCC timestamp of the write that produced
/// it. The stamp is what makes "last write wins by MVCC timestamp" decidable
/// when two leaders race on the same key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub data: Bytes,
    pub mvcc: u64,
}

/// One logical database. The server holds a `Vec<Arc<Db>>`, one per
/// configured database index; `SELECT` picks among them.
#[derive(Debug, Default)]
pub struct Db {
    map: DashMap<Bytes, StoredValue>,
}

impl Db {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<StoredValue> {
        self.map.get(key).map(|v| v.value().clone())
    }

    /// Unconditional write.
    pub fn set(&self, key: Bytes, data: Bytes, mvcc: u64) {
        self.map.insert(key, StoredValue { data, mvcc });
    }

    /// Writes only if the key is absent or holds an older MVCC stamp.
    /// Returns true if the write was applied. This is the merge primitive for
    /// active-replica snapshot loads.
    pub fn set_if_newer(&self, key: Bytes, data: Bytes, mvcc: u64) -> bool {
        let mut applied = true;
        self.map
            .entry(key)
            .and_modify(|existing| {
                if existing.mvcc <= mvcc {
                    *existing = StoredValue {
                        data: data.clone(),
                        mvcc,
                    };
                } else {
                    applied = false;
                }
            })
            .or_insert_with(|| StoredValue { data, mvcc });
        applied
    }

    /// Removes a key, returning true if it existed.
    pub fn del(&self, key: &[u8]) -> bool {
        self.map.remove(key).is_some()
    }

    /// Removes a key only if its stamp is not newer than `mvcc_max`.
    /// Used when purging keys the upstream deleted while we were away:
    /// a local write racing ahead of the resync must survive.
    pub fn del_if_not_newer(&self, key: &[u8], mvcc_max: u64) -> bool {
        if let Some(entry) = self.map.get(key) {
            if entry.value().mvcc > mvcc_max {
                return false;
            }
        } else {
            return false;
        }
        self.map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    /// Snapshot of all keys, used for the stale-key diff after an
    /// active-replica full resync.
    pub fn key_set(&self) -> HashSet<Bytes> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    /// Materializes all entries, used by the snapshot writer.
    pub fn entries(&self) -> Vec<(Bytes, StoredValue)> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
