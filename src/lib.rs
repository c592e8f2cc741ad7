//! # netcoord
//!
//! Network coordinate ingestion and query engine:
//! - Agents submit Vivaldi coordinates at high frequency
//! - A coalescer collapses them into one atomic store write per interval
//! - Queries return sorted, segment-filtered views per node and datacenter
//! - A fan-out summarizes every reachable datacenter, tolerating failures
//!
//! ## Architecture
//!
//! ```text
//!  agents ──PUT /coordinate/update──▶ ┌──────────────────┐
//!                                     │ CoordinateService│──forward──▶ remote DC
//!                                     └───────┬──────────┘
//!                                             │ submit (in-memory)
//!                                     ┌───────▼──────────┐
//!                                     │  UpdateCoalescer │  last write wins
//!                                     └───────┬──────────┘  per (node, segment)
//!                                             │ flush every update_period_ms
//!                                     ┌───────▼──────────┐
//!  GET /coordinate/nodes|node ───────▶│  CoordinateStore │  memory or RocksDB
//!                                     └──────────────────┘
//!  GET /coordinate/datacenters ──▶ local sample + DatacenterAggregator fan-out
//! ```
//!
//! ## Usage
//!
//! ### Start a server
//! ```bash
//! netcoord-server serve \
//!   --node server-1 \
//!   --dc dc1 \
//!   --bind 0.0.0.0:8500 \
//!   --db ./coord-data \
//!   --remote dc2=http://10.1.0.5:8500
//! ```
//!
//! ### Use the CLI
//! ```bash
//! netcoord nodes --segment alpha
//! netcoord node web-1
//! netcoord datacenters
//! netcoord rtt web-1 db-1
//! ```

pub mod agent;
pub mod common;
pub mod coordinate;

// Re-export commonly used types
pub use agent::Server;
pub use common::{Config, Error, Result};
pub use coordinate::{CoordinateService, UpdateCoalescer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
