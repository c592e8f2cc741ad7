//! HTTP API
//!
//! | Method | Path                     | Params                          |
//! |--------|--------------------------|---------------------------------|
//! | GET    | /coordinate/datacenters  |                                 |
//! | GET    | /coordinate/nodes        | dc, segment, index, wait        |
//! | GET    | /coordinate/node/:node   | dc, segment, index, wait        |
//! | PUT    | /coordinate/update       | JSON `CoordinateUpdateRequest`  |
//!
//! The same routes are also served under `/v1`. `segment` absent means every
//! segment, `segment=` the default segment only. List responses carry the
//! store index in `X-Netcoord-Index`.
//!
//! `PUT /coordinate/update` acknowledges before the update is durable; it is
//! written by the next coalescer flush.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{parse_duration, Error, Result};
use crate::coordinate::remote::INDEX_HEADER;
use crate::coordinate::{
    CoordinateService, CoordinateUpdateRequest, IndexedCoordinates, QueryOptions, SegmentFilter,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Largest accepted update body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct CoordState {
    pub service: Arc<CoordinateService>,
    pub node_name: String,
}

/// Query parameters shared by the list endpoints
#[derive(Debug, Default, Deserialize)]
pub struct CoordinateQuery {
    pub dc: Option<String>,
    pub segment: Option<String>,
    pub index: Option<String>,
    pub wait: Option<String>,
}

impl CoordinateQuery {
    fn datacenter(&self) -> &str {
        self.dc.as_deref().unwrap_or("")
    }

    fn filter(&self) -> SegmentFilter {
        SegmentFilter::from_param(self.segment.as_deref())
    }

    fn options(&self) -> Result<QueryOptions> {
        let wait = match self.wait.as_deref() {
            Some(w) => parse_duration(w)?,
            None => Duration::ZERO,
        };
        let min_index = match self.index.as_deref() {
            Some(i) => i
                .parse()
                .map_err(|_| Error::InvalidRequest(format!("invalid index: {}", i)))?,
            None => 0,
        };
        Ok(QueryOptions::blocking(min_index, wait))
    }
}

fn indexed_response(result: IndexedCoordinates) -> impl IntoResponse {
    (
        [(INDEX_HEADER, result.index.to_string())],
        Json(result.coordinates),
    )
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router(state: CoordState) -> Router {
    let api = Router::new()
        .route("/coordinate/datacenters", get(coordinate_datacenters))
        .route("/coordinate/nodes", get(coordinate_nodes))
        .route("/coordinate/node/:node", get(coordinate_node))
        .route("/coordinate/update", put(coordinate_update))
        .route("/health", get(health))
        .route("/metrics", get(metrics));

    Router::new()
        .nest("/v1", api.clone())
        .merge(api)
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

async fn coordinate_datacenters(State(state): State<CoordState>) -> Result<impl IntoResponse> {
    let maps = state.service.list_datacenters().await?;
    Ok(Json(maps))
}

async fn coordinate_nodes(
    State(state): State<CoordState>,
    Query(query): Query<CoordinateQuery>,
) -> Result<impl IntoResponse> {
    let result = state
        .service
        .list_nodes(query.datacenter(), &query.filter(), query.options()?)
        .await?;
    Ok(indexed_response(result))
}

async fn coordinate_node(
    State(state): State<CoordState>,
    Path(node): Path<String>,
    Query(query): Query<CoordinateQuery>,
) -> Result<impl IntoResponse> {
    let result = state
        .service
        .node(query.datacenter(), &node, &query.filter(), query.options()?)
        .await?;
    Ok(indexed_response(result))
}

async fn coordinate_update(
    State(state): State<CoordState>,
    body: std::result::Result<Json<CoordinateUpdateRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(request) = body.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    state.service.update(request).await?;
    Ok(Json(true))
}

/// Health check endpoint
async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "node": state.node_name,
            "datacenter": state.service.datacenter(),
            "index": state.service.index(),
            "pending_updates": state.service.coalescer().pending_len(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<CoordState>) -> impl IntoResponse {
    let mut out = state.service.metrics().to_prometheus();
    out.push_str("# HELP netcoord_store_index Current coordinate store index\n");
    out.push_str("# TYPE netcoord_store_index gauge\n");
    out.push_str(&format!("netcoord_store_index {}\n", state.service.index()));
    (StatusCode::OK, out)
}
