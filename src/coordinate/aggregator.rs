//! Cross-datacenter aggregation
//!
//! Scatters a node-list query to every known remote datacenter and keeps one
//! representative coordinate per answer. A datacenter that errors or misses
//! its timeout is left out; the summary is advisory, so a partial result is
//! still a successful one.

use crate::common::CoordinateMetrics;
use crate::coordinate::model::{DatacenterMap, QueryOptions, SegmentFilter};
use crate::coordinate::query::{representative, sorted_entries};
use crate::coordinate::remote::{DatacenterClient, Membership};
use crate::coordinate::store::CoordinateRecord;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;

pub struct DatacenterAggregator {
    membership: Arc<dyn Membership>,
    client: Arc<dyn DatacenterClient>,
    datacenter_timeout: Duration,
    overall_timeout: Duration,
    metrics: Arc<CoordinateMetrics>,
}

impl DatacenterAggregator {
    pub fn new(
        membership: Arc<dyn Membership>,
        client: Arc<dyn DatacenterClient>,
        datacenter_timeout: Duration,
        overall_timeout: Duration,
        metrics: Arc<CoordinateMetrics>,
    ) -> Self {
        Self {
            membership,
            client,
            datacenter_timeout,
            overall_timeout,
            metrics,
        }
    }

    /// Combine the local map with whatever remote datacenters answer in time.
    ///
    /// The result is sorted by datacenter name.
    pub async fn summarize(&self, local: DatacenterMap) -> Vec<DatacenterMap> {
        let remotes: Vec<String> = self
            .membership
            .remote_datacenters()
            .into_iter()
            .filter(|dc| *dc != local.datacenter)
            .collect();
        let expected = remotes.len();

        let mut queries: FuturesUnordered<_> = remotes
            .into_iter()
            .map(|dc| {
                let client = self.client.clone();
                let timeout = self.datacenter_timeout;
                async move {
                    let result = tokio::time::timeout(
                        timeout,
                        client.list_nodes(&dc, &SegmentFilter::Any, QueryOptions::default()),
                    )
                    .await;
                    (dc, result)
                }
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.overall_timeout;
        let mut maps = vec![local];
        let mut answered = 0usize;

        loop {
            match tokio::time::timeout_at(deadline, queries.next()).await {
                Ok(Some((dc, Ok(Ok(indexed))))) => {
                    answered += 1;
                    maps.push(DatacenterMap {
                        coordinates: representative(&indexed.coordinates),
                        datacenter: dc,
                    });
                }
                Ok(Some((dc, Ok(Err(e))))) => {
                    tracing::warn!(datacenter = %dc, error = %e, "Datacenter omitted from coordinate summary");
                }
                Ok(Some((dc, Err(_)))) => {
                    tracing::warn!(
                        datacenter = %dc,
                        timeout_ms = self.datacenter_timeout.as_millis() as u64,
                        "Datacenter timed out, omitted from coordinate summary"
                    );
                }
                Ok(None) => break,
                Err(_) => {
                    // Dropping `queries` cancels whatever is still running
                    tracing::warn!(
                        outstanding = queries.len(),
                        timeout_ms = self.overall_timeout.as_millis() as u64,
                        "Coordinate summary deadline reached"
                    );
                    break;
                }
            }
        }

        if answered < expected {
            self.metrics.partial_aggregations.inc();
            tracing::warn!(
                answered,
                expected,
                "Returning partial datacenter coordinate summary"
            );
        }

        maps.sort_by(|a, b| a.datacenter.cmp(&b.datacenter));
        maps
    }
}

/// Local datacenter map from a store listing
pub fn local_map(datacenter: &str, records: Vec<CoordinateRecord>) -> DatacenterMap {
    let entries = sorted_entries(records, &SegmentFilter::Any);
    DatacenterMap {
        datacenter: datacenter.to_string(),
        coordinates: representative(&entries),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Error, Result};
    use crate::coordinate::model::{
        Coordinate, CoordinateEntry, CoordinateUpdateRequest, IndexedCoordinates,
    };
    use crate::coordinate::remote::StaticMembership;
    use crate::common::RemoteDatacenter;
    use async_trait::async_trait;

    /// "slow" never answers in time, "broken" errors, others answer with two nodes
    struct ScriptedClient;

    #[async_trait]
    impl DatacenterClient for ScriptedClient {
        async fn list_nodes(
            &self,
            datacenter: &str,
            _filter: &SegmentFilter,
            _opts: QueryOptions,
        ) -> Result<IndexedCoordinates> {
            match datacenter {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(IndexedCoordinates::default())
                }
                "broken" => Err(Error::Unavailable("no leader".into())),
                _ => Ok(IndexedCoordinates::new(
                    4,
                    vec![
                        CoordinateEntry {
                            node: format!("{}-b", datacenter),
                            segment: String::new(),
                            coord: Coordinate::new(2),
                        },
                        CoordinateEntry {
                            node: format!("{}-a", datacenter),
                            segment: String::new(),
                            coord: Coordinate::new(2),
                        },
                    ],
                )),
            }
        }

        async fn node(
            &self,
            _datacenter: &str,
            _node: &str,
            _filter: &SegmentFilter,
            _opts: QueryOptions,
        ) -> Result<IndexedCoordinates> {
            Ok(IndexedCoordinates::default())
        }

        async fn update(&self, _request: &CoordinateUpdateRequest) -> Result<()> {
            Ok(())
        }
    }

    fn membership(names: &[&str]) -> Arc<dyn Membership> {
        let dcs: Vec<RemoteDatacenter> = names
            .iter()
            .map(|n| RemoteDatacenter {
                name: n.to_string(),
                address: format!("http://{}.invalid", n),
            })
            .collect();
        Arc::new(StaticMembership::new(&dcs))
    }

    #[tokio::test]
    async fn test_partial_results_are_returned() {
        let metrics = Arc::new(CoordinateMetrics::new());
        let aggregator = DatacenterAggregator::new(
            membership(&["west", "slow", "broken", "east"]),
            Arc::new(ScriptedClient),
            Duration::from_millis(50),
            Duration::from_secs(5),
            metrics.clone(),
        );

        let maps = aggregator.summarize(local_map("dc1", Vec::new())).await;
        let names: Vec<&str> = maps.iter().map(|m| m.datacenter.as_str()).collect();
        assert_eq!(names, vec!["dc1", "east", "west"]);

        // local datacenter without coordinates still has a non-null list
        assert!(maps[0].coordinates.is_empty());
        assert_eq!(maps[1].coordinates.len(), 1);
        assert_eq!(maps[1].coordinates[0].node, "east-a");
        assert_eq!(metrics.partial_aggregations.get(), 1);
    }

    #[tokio::test]
    async fn test_overall_deadline_cancels_outstanding() {
        let aggregator = DatacenterAggregator::new(
            membership(&["slow", "west"]),
            Arc::new(ScriptedClient),
            Duration::from_secs(60),
            Duration::from_millis(100),
            Arc::new(CoordinateMetrics::new()),
        );

        let start = std::time::Instant::now();
        let maps = aggregator.summarize(local_map("dc1", Vec::new())).await;
        assert!(start.elapsed() < Duration::from_secs(10));
        let names: Vec<&str> = maps.iter().map(|m| m.datacenter.as_str()).collect();
        assert_eq!(names, vec!["dc1", "west"]);
    }

    #[tokio::test]
    async fn test_no_remotes() {
        let aggregator = DatacenterAggregator::new(
            membership(&[]),
            Arc::new(ScriptedClient),
            Duration::from_millis(50),
            Duration::from_millis(50),
            Arc::new(CoordinateMetrics::new()),
        );
        let record = CoordinateRecord {
            node: "self".into(),
            segment: String::new(),
            coord: Coordinate::new(2),
            modify_index: 1,
        };
        let maps = aggregator.summarize(local_map("dc1", vec![record])).await;
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].coordinates[0].node, "self");
    }
}
