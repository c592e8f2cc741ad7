//! Coordinate server

use crate::agent::http::{create_router, CoordState};
use crate::common::{Config, CoordinateMetrics, Result};
use crate::coordinate::{
    CoalescerConfig, CoordinateService, CoordinateStore, HttpDatacenterClient, MemoryStore,
    Membership, RocksStore, StaticMembership, UpdateCoalescer,
};
use std::future::Future;
use std::sync::Arc;

/// Open the store named by the config (in-memory when no `db_path`)
pub fn open_store(config: &Config) -> Result<Arc<dyn CoordinateStore>> {
    match &config.server.db_path {
        Some(path) => Ok(Arc::new(RocksStore::open(path)?)),
        None => {
            tracing::warn!("No db_path configured, coordinates are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Wire the coalescer, remote client and service together.
///
/// Starts the coalescer's flush task, so this must run inside a tokio runtime.
pub fn build_service(config: &Config, store: Arc<dyn CoordinateStore>) -> CoordinateService {
    let metrics = Arc::new(CoordinateMetrics::new());
    let coalescer = UpdateCoalescer::start(
        CoalescerConfig {
            datacenter: config.datacenter.clone(),
            flush_interval: config.coordinate.update_period(),
            max_pending: config.coordinate.max_pending_updates,
        },
        store.clone(),
        metrics,
    );
    let membership: Arc<dyn Membership> = Arc::new(StaticMembership::new(&config.datacenters));
    let remote = Arc::new(HttpDatacenterClient::new(
        membership.clone(),
        config.coordinate.datacenter_timeout(),
    ));
    CoordinateService::new(config.coordinate.clone(), store, coalescer, membership, remote)
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Serve until ctrl-c
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then flush pending updates once more.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.config.validate()?;
        let config = &self.config;

        tracing::info!("Starting coordinate server: {}", config.node_name);
        tracing::info!("  Datacenter: {}", config.datacenter);
        tracing::info!("  HTTP API: {}", config.server.bind_addr);
        tracing::info!("  Flush interval: {:?}", config.coordinate.update_period());
        tracing::info!(
            "  Remote datacenters: {}",
            config
                .datacenters
                .iter()
                .map(|dc| dc.name.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );

        let store = open_store(config)?;
        let service = Arc::new(build_service(config, store));

        let router = create_router(CoordState {
            service: service.clone(),
            node_name: config.node_name.clone(),
        });

        let listener = tokio::net::TcpListener::bind(config.server.bind_addr).await?;
        tracing::info!("✓ Coordinate server ready");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;
        if let Err(e) = &served {
            tracing::error!("HTTP server error: {}", e);
        }

        match service.coalescer().shutdown().await {
            Ok(epoch) => tracing::info!(epoch = epoch.epoch, index = epoch.index, "Final coordinate flush complete"),
            Err(e) => tracing::warn!(error = %e, "Final coordinate flush failed, pending updates dropped"),
        }

        served?;
        Ok(())
    }
}
