//! Coordinate service: update ingestion and the three read views
//!
//! Reads always come from the store (the latest flushed snapshot), never from
//! the coalescer's pending buffer. Requests addressed to another known
//! datacenter are forwarded to it.

use crate::common::{CoordinateConfig, CoordinateMetrics, Error, Result};
use crate::coordinate::aggregator::{local_map, DatacenterAggregator};
use crate::coordinate::coalescer::UpdateCoalescer;
use crate::coordinate::model::{
    CoordinateUpdateRequest, DatacenterMap, IndexedCoordinates, QueryOptions, SegmentFilter,
};
use crate::coordinate::query::sorted_entries;
use crate::coordinate::remote::{DatacenterClient, Membership};
use crate::coordinate::store::{CoordinateStore, Snapshot};
use std::sync::Arc;

/// Where a request should be answered
enum Route {
    Local,
    Remote(String),
}

pub struct CoordinateService {
    datacenter: String,
    config: CoordinateConfig,
    store: Arc<dyn CoordinateStore>,
    coalescer: UpdateCoalescer,
    membership: Arc<dyn Membership>,
    remote: Arc<dyn DatacenterClient>,
    aggregator: DatacenterAggregator,
}

impl CoordinateService {
    pub fn new(
        config: CoordinateConfig,
        store: Arc<dyn CoordinateStore>,
        coalescer: UpdateCoalescer,
        membership: Arc<dyn Membership>,
        remote: Arc<dyn DatacenterClient>,
    ) -> Self {
        let aggregator = DatacenterAggregator::new(
            membership.clone(),
            remote.clone(),
            config.datacenter_timeout(),
            config.aggregate_timeout(),
            coalescer.metrics().clone(),
        );
        Self {
            datacenter: coalescer.datacenter().to_string(),
            config,
            store,
            coalescer,
            membership,
            remote,
            aggregator,
        }
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn coalescer(&self) -> &UpdateCoalescer {
        &self.coalescer
    }

    pub fn metrics(&self) -> &Arc<CoordinateMetrics> {
        self.coalescer.metrics()
    }

    /// Current store index
    pub fn index(&self) -> u64 {
        self.store.index()
    }

    fn route(&self, datacenter: &str) -> Result<Route> {
        if datacenter.is_empty() || datacenter == self.datacenter {
            Ok(Route::Local)
        } else if self.membership.is_known(datacenter) {
            Ok(Route::Remote(datacenter.to_string()))
        } else {
            Err(Error::UnknownDatacenter(datacenter.to_string()))
        }
    }

    /// Run a store read on the blocking pool, like coalescer writes.
    async fn read<F>(&self, read: F) -> Result<Snapshot>
    where
        F: FnOnce(&dyn CoordinateStore, &str) -> Result<Snapshot> + Send + 'static,
    {
        let store = self.store.clone();
        let datacenter = self.datacenter.clone();
        tokio::task::spawn_blocking(move || read(store.as_ref(), &datacenter))
            .await
            .map_err(|e| Error::Internal(format!("store read task failed: {}", e)))?
    }

    /// Accept one coordinate update.
    ///
    /// Returns once the update is buffered; it becomes visible to queries
    /// after the next successful flush.
    pub async fn update(&self, mut request: CoordinateUpdateRequest) -> Result<()> {
        if let Err(e) = request.validate(self.config.dimensionality) {
            self.metrics().updates_rejected.inc();
            return Err(e);
        }

        match self.route(&request.datacenter)? {
            Route::Local => {
                request.datacenter = self.datacenter.clone();
                match self.coalescer.submit(request) {
                    Ok(()) => {
                        self.metrics().updates_accepted.inc();
                        Ok(())
                    }
                    Err(e) => {
                        self.metrics().updates_rejected.inc();
                        Err(e)
                    }
                }
            }
            Route::Remote(dc) => {
                tracing::debug!(datacenter = %dc, node = %request.node, "Forwarding coordinate update");
                self.remote.update(&request).await
            }
        }
    }

    /// All coordinates in a datacenter, sorted by node name.
    pub async fn list_nodes(
        &self,
        datacenter: &str,
        filter: &SegmentFilter,
        opts: QueryOptions,
    ) -> Result<IndexedCoordinates> {
        match self.route(datacenter)? {
            Route::Local => {
                self.wait_for_index(opts).await;
                let snapshot = self.read(|store, dc| store.list(dc)).await?;
                Ok(IndexedCoordinates::new(
                    snapshot.index,
                    sorted_entries(snapshot.records, filter),
                ))
            }
            Route::Remote(dc) => self.remote.list_nodes(&dc, filter, opts).await,
        }
    }

    /// Every segment coordinate of one node, sorted by segment.
    ///
    /// An unknown node yields an empty list.
    pub async fn node(
        &self,
        datacenter: &str,
        node: &str,
        filter: &SegmentFilter,
        opts: QueryOptions,
    ) -> Result<IndexedCoordinates> {
        crate::common::validate_node_name(node)?;
        match self.route(datacenter)? {
            Route::Local => {
                self.wait_for_index(opts).await;
                let owned = node.to_string();
                let snapshot = self.read(move |store, dc| store.node(dc, &owned)).await?;
                Ok(IndexedCoordinates::new(
                    snapshot.index,
                    sorted_entries(snapshot.records, filter),
                ))
            }
            Route::Remote(dc) => self.remote.node(&dc, node, filter, opts).await,
        }
    }

    /// One representative coordinate per reachable datacenter.
    pub async fn list_datacenters(&self) -> Result<Vec<DatacenterMap>> {
        let snapshot = self.read(|store, dc| store.list(dc)).await?;
        let local = local_map(&self.datacenter, snapshot.records);
        Ok(self.aggregator.summarize(local).await)
    }

    /// Remove a deregistered node's coordinates from the local datacenter.
    pub async fn purge_node(&self, node: &str) -> Result<u64> {
        crate::common::validate_node_name(node)?;
        self.coalescer.purge_node(node).await
    }

    /// Block until the store index passes `opts.min_index` or the wait ends.
    async fn wait_for_index(&self, opts: QueryOptions) {
        if opts.min_index == 0 {
            return;
        }
        let wait = self.config.query_wait(opts.wait);
        let mut rx = self.store.subscribe();
        let reached = tokio::time::timeout(wait, rx.wait_for(|index| *index > opts.min_index))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !reached {
            tracing::trace!(min_index = opts.min_index, "Blocking query wait elapsed");
        }
    }
}
