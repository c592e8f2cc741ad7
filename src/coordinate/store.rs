//! Coordinate store abstraction
//!
//! The store is a transactional apply-log keyed by
//! `(datacenter, node, segment)`: a batch is applied atomically or not at all,
//! and every applied change advances a monotonically increasing index.

use crate::common::{Error, Result};
use crate::coordinate::model::{Coordinate, CoordinateEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio::sync::watch;

/// Durable value of a coordinate record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCoordinate {
    pub coord: Coordinate,
    /// Store index of the write that produced this value
    pub modify_index: u64,
}

/// A record read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateRecord {
    pub node: String,
    pub segment: String,
    pub coord: Coordinate,
    pub modify_index: u64,
}

impl From<CoordinateRecord> for CoordinateEntry {
    fn from(r: CoordinateRecord) -> Self {
        CoordinateEntry {
            node: r.node,
            segment: r.segment,
            coord: r.coord,
        }
    }
}

/// Records read at a single store index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub index: u64,
    pub records: Vec<CoordinateRecord>,
}

/// Trait for coordinate storage backends
pub trait CoordinateStore: Send + Sync {
    /// Atomically write `batch` into `datacenter`, returning the new index.
    fn apply(&self, datacenter: &str, batch: &[CoordinateEntry]) -> Result<u64>;

    /// All records of a datacenter
    fn list(&self, datacenter: &str) -> Result<Snapshot>;

    /// All records of one node in a datacenter
    fn node(&self, datacenter: &str, node: &str) -> Result<Snapshot>;

    /// Remove every segment of `node`; returns the index after the delete.
    fn delete_node(&self, datacenter: &str, node: &str) -> Result<u64>;

    /// Current change index
    fn index(&self) -> u64;

    /// Receiver that observes every index change
    fn subscribe(&self) -> watch::Receiver<u64>;
}

type MemKey = (String, String, String);

#[derive(Default)]
struct MemState {
    index: u64,
    data: BTreeMap<MemKey, StoredCoordinate>,
}

/// In-memory store
pub struct MemoryStore {
    state: RwLock<MemState>,
    index_tx: watch::Sender<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (index_tx, _rx) = watch::channel(0);
        Self {
            state: RwLock::new(MemState::default()),
            index_tx,
        }
    }

    fn snapshot_range(&self, datacenter: &str, node: Option<&str>) -> Result<Snapshot> {
        let state = self
            .state
            .read()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))?;
        let records = state
            .data
            .iter()
            .filter(|((dc, n, _), _)| dc == datacenter && node.map_or(true, |want| want == n))
            .map(|((_, node, segment), stored)| CoordinateRecord {
                node: node.clone(),
                segment: segment.clone(),
                coord: stored.coord.clone(),
                modify_index: stored.modify_index,
            })
            .collect();
        Ok(Snapshot {
            index: state.index,
            records,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinateStore for MemoryStore {
    fn apply(&self, datacenter: &str, batch: &[CoordinateEntry]) -> Result<u64> {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))?;
        let index = state.index + 1;
        for entry in batch {
            state.data.insert(
                (datacenter.to_string(), entry.node.clone(), entry.segment.clone()),
                StoredCoordinate {
                    coord: entry.coord.clone(),
                    modify_index: index,
                },
            );
        }
        state.index = index;
        self.index_tx.send_replace(index);
        Ok(index)
    }

    fn list(&self, datacenter: &str) -> Result<Snapshot> {
        self.snapshot_range(datacenter, None)
    }

    fn node(&self, datacenter: &str, node: &str) -> Result<Snapshot> {
        self.snapshot_range(datacenter, Some(node))
    }

    fn delete_node(&self, datacenter: &str, node: &str) -> Result<u64> {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))?;
        let before = state.data.len();
        state
            .data
            .retain(|(dc, n, _), _| !(dc == datacenter && n == node));
        if state.data.len() != before {
            state.index += 1;
            self.index_tx.send_replace(state.index);
        }
        Ok(state.index)
    }

    fn index(&self) -> u64 {
        *self.index_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.index_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node: &str, segment: &str, height: f64) -> CoordinateEntry {
        let mut coord = Coordinate::new(2);
        coord.height = height;
        CoordinateEntry {
            node: node.into(),
            segment: segment.into(),
            coord,
        }
    }

    #[test]
    fn test_apply_and_list() {
        let store = MemoryStore::new();
        assert_eq!(store.index(), 0);

        let index = store
            .apply("dc1", &[entry("foo", "", 1.0), entry("foo", "alpha", 2.0)])
            .unwrap();
        assert_eq!(index, 1);
        store.apply("dc2", &[entry("bar", "", 3.0)]).unwrap();

        let snap = store.list("dc1").unwrap();
        assert_eq!(snap.index, 2);
        assert_eq!(snap.records.len(), 2);
        assert!(snap.records.iter().all(|r| r.modify_index == 1));

        let snap = store.node("dc2", "bar").unwrap();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.records[0].coord.height, 3.0);
    }

    #[test]
    fn test_overwrite_keeps_one_record() {
        let store = MemoryStore::new();
        store.apply("dc1", &[entry("foo", "", 1.0)]).unwrap();
        store.apply("dc1", &[entry("foo", "", 9.0)]).unwrap();

        let snap = store.node("dc1", "foo").unwrap();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.records[0].coord.height, 9.0);
        assert_eq!(snap.records[0].modify_index, 2);
    }

    #[test]
    fn test_delete_node() {
        let store = MemoryStore::new();
        store
            .apply("dc1", &[entry("foo", "", 1.0), entry("foo", "alpha", 1.0), entry("bar", "", 1.0)])
            .unwrap();

        let index = store.delete_node("dc1", "foo").unwrap();
        assert_eq!(index, 2);
        let snap = store.list("dc1").unwrap();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.records[0].node, "bar");

        // Nothing removed, index unchanged
        assert_eq!(store.delete_node("dc1", "ghost").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_observes_index() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.apply("dc1", &[entry("foo", "", 1.0)]).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
