//! Agent-facing HTTP surface and server lifecycle
//!
//! The server owns one coalescer for the local datacenter: it is started with
//! the service and stopped (after a final flush) when the HTTP server shuts
//! down.

pub mod http;
pub mod server;

pub use http::{create_router, CoordState};
pub use server::{build_service, open_store, Server};
