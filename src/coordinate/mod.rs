//! Network coordinate engine
//!
//! - `model`: coordinates, update requests, query result shapes
//! - `store`: the store trait and the in-memory backend
//! - `rocks`: the RocksDB backend
//! - `coalescer`: batching of high-frequency updates into periodic writes
//! - `query`: ordering and segment filtering of snapshots
//! - `remote` / `aggregator`: other datacenters and the summary fan-out
//! - `service`: ingestion endpoint and read views

pub mod aggregator;
pub mod coalescer;
pub mod model;
pub mod query;
pub mod remote;
pub mod rocks;
pub mod service;
pub mod store;

pub use aggregator::DatacenterAggregator;
pub use coalescer::{CoalescerConfig, FlushEpoch, UpdateCoalescer};
pub use model::{
    Coordinate, CoordinateEntry, CoordinateKey, CoordinateUpdateRequest, DatacenterMap,
    IndexedCoordinates, QueryOptions, SegmentFilter,
};
pub use remote::{DatacenterClient, HttpDatacenterClient, Membership, StaticMembership};
pub use rocks::RocksStore;
pub use service::CoordinateService;
pub use store::{CoordinateStore, MemoryStore};
