//! Common utilities and types shared across netcoord

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, CoordinateConfig, RemoteDatacenter, ServerConfig};
pub use error::{Error, Result};
pub use metrics::CoordinateMetrics;
pub use utils::{decode_key, encode_key, parse_duration, retry_with_backoff, validate_node_name};
