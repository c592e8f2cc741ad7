//! Coordinate data model
//!
//! Field names serialize in PascalCase so agents that already speak the
//! `{"Node": .., "Segment": .., "Coord": {"Vec": [..], ..}}` wire shape can
//! talk to the HTTP API unchanged.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Initial error estimate of a fresh coordinate
pub const DEFAULT_ERROR: f64 = 1.5;

/// Minimum height of a fresh coordinate (seconds)
pub const DEFAULT_HEIGHT: f64 = 1.0e-5;

/// A point in the latency-estimation space.
///
/// Units are seconds. Values are replaced wholesale on update, never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    pub adjustment: f64,
    pub height: f64,
}

impl Coordinate {
    /// Coordinate at the origin with default error and height
    pub fn new(dimensionality: usize) -> Self {
        Self {
            vec: vec![0.0; dimensionality],
            error: DEFAULT_ERROR,
            adjustment: 0.0,
            height: DEFAULT_HEIGHT,
        }
    }

    /// All components are finite (no NaN or infinity)
    pub fn is_valid(&self) -> bool {
        self.vec.iter().all(|c| c.is_finite())
            && self.error.is_finite()
            && self.adjustment.is_finite()
            && self.height.is_finite()
    }

    pub fn is_compatible_with(&self, dimensionality: usize) -> bool {
        self.vec.len() == dimensionality
    }

    /// Estimated round-trip time to `other`.
    ///
    /// Euclidean distance plus both heights; the adjustment terms are added
    /// only when the adjusted estimate stays positive.
    pub fn distance_to(&self, other: &Coordinate) -> Result<Duration> {
        if self.vec.len() != other.vec.len() {
            return Err(Error::InvalidRequest(format!(
                "dimensionality mismatch: {} vs {}",
                self.vec.len(),
                other.vec.len()
            )));
        }
        if !self.is_valid() || !other.is_valid() {
            return Err(Error::InvalidRequest("coordinate has non-finite components".into()));
        }

        let magnitude = self
            .vec
            .iter()
            .zip(&other.vec)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        let mut dist = magnitude + self.height + other.height;
        let adjusted = dist + self.adjustment + other.adjustment;
        if adjusted > 0.0 {
            dist = adjusted;
        }

        Duration::try_from_secs_f64(dist.max(0.0)).map_err(|_| {
            Error::InvalidRequest(format!("estimated distance out of range: {}s", dist))
        })
    }
}

/// Key of a coordinate inside one datacenter.
///
/// Ordering is node name first, then segment, both byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordinateKey {
    pub node: String,
    pub segment: String,
}

impl CoordinateKey {
    pub fn new(node: impl Into<String>, segment: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            segment: segment.into(),
        }
    }
}

/// A node's coordinate in one network segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CoordinateEntry {
    pub node: String,
    #[serde(default)]
    pub segment: String,
    pub coord: Coordinate,
}

impl CoordinateEntry {
    pub fn key(&self) -> CoordinateKey {
        CoordinateKey::new(self.node.clone(), self.segment.clone())
    }
}

/// A query result together with the store index it was read at.
///
/// `coordinates` is always present; an empty result is an empty vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexedCoordinates {
    pub index: u64,
    pub coordinates: Vec<CoordinateEntry>,
}

impl IndexedCoordinates {
    pub fn new(index: u64, coordinates: Vec<CoordinateEntry>) -> Self {
        Self { index, coordinates }
    }
}

/// Representative coordinates of one datacenter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatacenterMap {
    pub datacenter: String,
    #[serde(default)]
    pub coordinates: Vec<CoordinateEntry>,
}

/// Inbound coordinate update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CoordinateUpdateRequest {
    /// Target datacenter; empty means the local one
    #[serde(default)]
    pub datacenter: String,
    pub node: String,
    #[serde(default)]
    pub segment: String,
    pub coord: Coordinate,
}

impl CoordinateUpdateRequest {
    pub fn key(&self) -> CoordinateKey {
        CoordinateKey::new(self.node.clone(), self.segment.clone())
    }

    /// Reject empty node names, non-finite components and vectors of the
    /// wrong dimensionality.
    pub fn validate(&self, dimensionality: usize) -> Result<()> {
        crate::common::validate_node_name(&self.node)?;
        if !self.coord.is_valid() {
            return Err(Error::InvalidRequest(format!(
                "rejected coordinate for node {}: non-finite component",
                self.node
            )));
        }
        if !self.coord.is_compatible_with(dimensionality) {
            return Err(Error::InvalidRequest(format!(
                "rejected coordinate for node {}: expected {} dimensions, got {}",
                self.node,
                dimensionality,
                self.coord.vec.len()
            )));
        }
        Ok(())
    }
}

/// Segment restriction for a query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SegmentFilter {
    /// Every segment
    #[default]
    Any,
    /// Only the default (empty-named) segment
    Default,
    /// Exactly this segment
    Named(String),
}

impl SegmentFilter {
    /// Map a query parameter: absent is `Any`, empty is `Default`.
    pub fn from_param(param: Option<&str>) -> Self {
        match param {
            None => SegmentFilter::Any,
            Some("") => SegmentFilter::Default,
            Some(name) => SegmentFilter::Named(name.to_string()),
        }
    }

    /// The inverse of [`SegmentFilter::from_param`]
    pub fn as_param(&self) -> Option<&str> {
        match self {
            SegmentFilter::Any => None,
            SegmentFilter::Default => Some(""),
            SegmentFilter::Named(name) => Some(name),
        }
    }

    pub fn matches(&self, segment: &str) -> bool {
        match self {
            SegmentFilter::Any => true,
            SegmentFilter::Default => segment.is_empty(),
            SegmentFilter::Named(name) => name == segment,
        }
    }
}

/// Blocking-query options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Wait until the store index is greater than this (0 = don't wait)
    pub min_index: u64,
    /// Upper bound on the wait (zero = server default)
    pub wait: Duration,
}

impl QueryOptions {
    pub fn blocking(min_index: u64, wait: Duration) -> Self {
        Self { min_index, wait }
    }
}
