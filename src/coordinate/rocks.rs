//! Durable coordinate store using RocksDB
//!
//! Layout:
//! - `coordinates` CF: `<dc>/coordinates/<node>/<segment>` → bincode
//!   [`StoredCoordinate`]; every component is percent-encoded so `/` only
//!   ever appears as a separator.
//! - `meta` CF: `index` → big-endian u64, written in the same batch as the
//!   records it covers.

use crate::common::{decode_key, encode_key, Error, Result};
use crate::coordinate::model::CoordinateEntry;
use crate::coordinate::store::{CoordinateRecord, CoordinateStore, Snapshot, StoredCoordinate};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::watch;

const CF_COORDINATES: &str = "coordinates";
const CF_META: &str = "meta";
const INDEX_KEY: &[u8] = b"index";

fn dc_prefix(datacenter: &str) -> String {
    format!("{}/coordinates/", encode_key(datacenter))
}

fn node_prefix(datacenter: &str, node: &str) -> String {
    format!("{}{}/", dc_prefix(datacenter), encode_key(node))
}

fn record_key(datacenter: &str, node: &str, segment: &str) -> String {
    format!("{}{}", node_prefix(datacenter, node), encode_key(segment))
}

/// Split `<dc>/coordinates/<node>/<segment>` back into (node, segment)
fn parse_record_key(key: &[u8]) -> Result<(String, String)> {
    let key = std::str::from_utf8(key)
        .map_err(|_| Error::Corrupted("Invalid UTF-8 in coordinate key".into()))?;
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [_, "coordinates", node, segment] => Ok((decode_key(node)?, decode_key(segment)?)),
        _ => Err(Error::Corrupted(format!("malformed coordinate key: {}", key))),
    }
}

/// RocksDB-backed coordinate store
pub struct RocksStore {
    db: DB,
    /// Serializes writers; holds the last persisted index
    write_lock: Mutex<u64>,
    index_tx: watch::Sender<u64>,
}

impl RocksStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_COORDINATES, CF_META])?;

        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| Error::Internal("missing meta column family".into()))?;
        let index = match db.get_cf(meta, INDEX_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Corrupted("store index is not 8 bytes".into()))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };

        tracing::info!(index, "Opened coordinate store");

        let (index_tx, _rx) = watch::channel(index);
        Ok(Self {
            db,
            write_lock: Mutex::new(index),
            index_tx,
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    fn scan(&self, prefix: &str) -> Result<Snapshot> {
        let cf = self.cf(CF_COORDINATES)?;
        let meta = self.cf(CF_META)?;
        let snapshot = self.db.snapshot();

        let index = match snapshot.get_cf(meta, INDEX_KEY)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map(u64::from_be_bytes)
                .map_err(|_| Error::Corrupted("store index is not 8 bytes".into()))?,
            None => 0,
        };

        let mut records = Vec::new();
        let iter = snapshot.iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let (node, segment) = parse_record_key(&key)?;
            let stored: StoredCoordinate = bincode::deserialize(&value)?;
            records.push(CoordinateRecord {
                node,
                segment,
                coord: stored.coord,
                modify_index: stored.modify_index,
            });
        }

        Ok(Snapshot { index, records })
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush_cf(self.cf(CF_COORDINATES)?)?;
        self.db.flush_cf(self.cf(CF_META)?)?;
        Ok(())
    }
}

impl CoordinateStore for RocksStore {
    fn apply(&self, datacenter: &str, batch: &[CoordinateEntry]) -> Result<u64> {
        let cf = self.cf(CF_COORDINATES)?;
        let meta = self.cf(CF_META)?;
        let mut current = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("store write lock poisoned".into()))?;

        let index = *current + 1;
        let mut wb = WriteBatch::default();
        for entry in batch {
            let value = bincode::serialize(&StoredCoordinate {
                coord: entry.coord.clone(),
                modify_index: index,
            })?;
            wb.put_cf(cf, record_key(datacenter, &entry.node, &entry.segment), value);
        }
        wb.put_cf(meta, INDEX_KEY, index.to_be_bytes());
        self.db.write(wb)?;

        *current = index;
        self.index_tx.send_replace(index);
        Ok(index)
    }

    fn list(&self, datacenter: &str) -> Result<Snapshot> {
        self.scan(&dc_prefix(datacenter))
    }

    fn node(&self, datacenter: &str, node: &str) -> Result<Snapshot> {
        self.scan(&node_prefix(datacenter, node))
    }

    fn delete_node(&self, datacenter: &str, node: &str) -> Result<u64> {
        let cf = self.cf(CF_COORDINATES)?;
        let meta = self.cf(CF_META)?;
        let mut current = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("store write lock poisoned".into()))?;

        let prefix = node_prefix(datacenter, node);
        let mut wb = WriteBatch::default();
        let mut removed = 0usize;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            wb.delete_cf(cf, key);
            removed += 1;
        }
        if removed == 0 {
            return Ok(*current);
        }

        let index = *current + 1;
        wb.put_cf(meta, INDEX_KEY, index.to_be_bytes());
        self.db.write(wb)?;

        *current = index;
        self.index_tx.send_replace(index);
        tracing::debug!(datacenter, node, removed, index, "Deleted node coordinates");
        Ok(index)
    }

    fn index(&self) -> u64 {
        *self.index_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.index_tx.subscribe()
    }
}
