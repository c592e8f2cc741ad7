//! Remote datacenters: who they are and how to query them

use crate::common::{Error, RemoteDatacenter, Result};
use crate::coordinate::model::{
    CoordinateEntry, CoordinateUpdateRequest, IndexedCoordinates, QueryOptions, SegmentFilter,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Header carrying the store index of a query result
pub const INDEX_HEADER: &str = "X-Netcoord-Index";

/// Source of known remote datacenters (gossip, static config, ...)
pub trait Membership: Send + Sync {
    /// Names of remote datacenters, excluding the local one
    fn remote_datacenters(&self) -> Vec<String>;

    /// Address of a server in `datacenter`
    fn address(&self, datacenter: &str) -> Option<String>;

    fn is_known(&self, datacenter: &str) -> bool {
        self.address(datacenter).is_some()
    }
}

/// Membership from the `datacenters` config list
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    addresses: BTreeMap<String, String>,
}

impl StaticMembership {
    pub fn new(datacenters: &[RemoteDatacenter]) -> Self {
        Self {
            addresses: datacenters
                .iter()
                .map(|dc| (dc.name.clone(), dc.address.trim_end_matches('/').to_string()))
                .collect(),
        }
    }
}

impl Membership for StaticMembership {
    fn remote_datacenters(&self) -> Vec<String> {
        self.addresses.keys().cloned().collect()
    }

    fn address(&self, datacenter: &str) -> Option<String> {
        self.addresses.get(datacenter).cloned()
    }
}

/// Operations forwarded to another datacenter's coordinate service
#[async_trait]
pub trait DatacenterClient: Send + Sync {
    async fn list_nodes(
        &self,
        datacenter: &str,
        filter: &SegmentFilter,
        opts: QueryOptions,
    ) -> Result<IndexedCoordinates>;

    async fn node(
        &self,
        datacenter: &str,
        node: &str,
        filter: &SegmentFilter,
        opts: QueryOptions,
    ) -> Result<IndexedCoordinates>;

    async fn update(&self, request: &CoordinateUpdateRequest) -> Result<()>;
}

/// Client speaking the public HTTP API of remote servers
pub struct HttpDatacenterClient {
    client: reqwest::Client,
    membership: std::sync::Arc<dyn Membership>,
    timeout: Duration,
}

impl HttpDatacenterClient {
    pub fn new(membership: std::sync::Arc<dyn Membership>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            membership,
            timeout,
        }
    }

    fn base_url(&self, datacenter: &str) -> Result<String> {
        self.membership
            .address(datacenter)
            .ok_or_else(|| Error::UnknownDatacenter(datacenter.to_string()))
    }

    async fn get_coordinates(
        &self,
        datacenter: &str,
        path: &str,
        filter: &SegmentFilter,
        opts: QueryOptions,
    ) -> Result<IndexedCoordinates> {
        let url = format!("{}{}", self.base_url(datacenter)?, path);
        let mut query: Vec<(&str, String)> = vec![("dc", datacenter.to_string())];
        if let Some(segment) = filter.as_param() {
            query.push(("segment", segment.to_string()));
        }
        if opts.min_index > 0 {
            query.push(("index", opts.min_index.to_string()));
            query.push(("wait", format!("{}ms", opts.wait.as_millis())));
        }

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .timeout(self.timeout + opts.wait)
            .send()
            .await?;
        let resp = check_status(datacenter, resp).await?;

        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let coordinates: Vec<CoordinateEntry> = resp.json().await?;
        Ok(IndexedCoordinates::new(index, coordinates))
    }
}

/// Map a non-success response onto the error taxonomy
async fn check_status(datacenter: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    let message = format!("datacenter {}: {}", datacenter, message);

    Err(match status.as_u16() {
        400 => Error::InvalidRequest(message),
        404 => Error::UnknownDatacenter(message),
        503 => Error::Unavailable(message),
        504 => Error::Timeout(message),
        _ => Error::Http(message),
    })
}

#[async_trait]
impl DatacenterClient for HttpDatacenterClient {
    async fn list_nodes(
        &self,
        datacenter: &str,
        filter: &SegmentFilter,
        opts: QueryOptions,
    ) -> Result<IndexedCoordinates> {
        self.get_coordinates(datacenter, "/v1/coordinate/nodes", filter, opts)
            .await
    }

    async fn node(
        &self,
        datacenter: &str,
        node: &str,
        filter: &SegmentFilter,
        opts: QueryOptions,
    ) -> Result<IndexedCoordinates> {
        let path = format!("/v1/coordinate/node/{}", crate::common::encode_key(node));
        self.get_coordinates(datacenter, &path, filter, opts).await
    }

    async fn update(&self, request: &CoordinateUpdateRequest) -> Result<()> {
        let url = format!("{}/v1/coordinate/update", self.base_url(&request.datacenter)?);
        let resp = self
            .client
            .put(&url)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(&request.datacenter, resp).await?;
        Ok(())
    }
}
