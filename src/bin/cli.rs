//! CLI for coordinate queries and updates

use clap::{Parser, Subcommand};
use netcoord::common::retry_with_backoff;
use netcoord::coordinate::remote::INDEX_HEADER;
use netcoord::coordinate::{
    Coordinate, CoordinateEntry, CoordinateUpdateRequest, DatacenterMap,
};
use netcoord::{Error, Result};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "netcoord")]
#[command(about = "netcoord network coordinate CLI")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(long, default_value = "http://localhost:8500")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List coordinates of every node in a datacenter
    Nodes {
        /// Datacenter (local if omitted)
        #[arg(long)]
        dc: Option<String>,

        /// Segment filter (all segments if omitted, "" for the default)
        #[arg(long)]
        segment: Option<String>,
    },

    /// Show one node's coordinates
    Node {
        /// Node name
        name: String,

        #[arg(long)]
        dc: Option<String>,

        #[arg(long)]
        segment: Option<String>,
    },

    /// One representative coordinate per datacenter
    Datacenters,

    /// Submit a coordinate update
    Update {
        /// Node name
        node: String,

        /// Vector components (comma-separated, seconds)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        vec: Vec<f64>,

        #[arg(long, default_value = "0.00001")]
        height: f64,

        #[arg(long, default_value = "1.5")]
        error: f64,

        #[arg(long, default_value = "0.0")]
        adjustment: f64,

        #[arg(long, default_value = "")]
        segment: String,

        #[arg(long)]
        dc: Option<String>,
    },

    /// Estimate round-trip time between two nodes
    Rtt {
        a: String,
        b: String,

        #[arg(long)]
        dc: Option<String>,
    },
}

struct Client {
    http: reqwest::Client,
    addr: String,
}

impl Client {
    fn new(addr: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            addr: addr.trim_end_matches('/').to_string(),
        })
    }

    async fn get_entries(
        &self,
        path: &str,
        dc: Option<&str>,
        segment: Option<&str>,
    ) -> Result<(u64, Vec<CoordinateEntry>)> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(dc) = dc {
            params.push(("dc", dc));
        }
        if let Some(segment) = segment {
            params.push(("segment", segment));
        }
        let resp = self
            .http
            .get(format!("{}/v1{}", self.addr, path))
            .query(&params)
            .send()
            .await?;
        let resp = check(resp).await?;
        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok((index, resp.json().await?))
    }

    async fn node(&self, name: &str, dc: Option<&str>) -> Result<Vec<CoordinateEntry>> {
        let path = format!("/coordinate/node/{}", netcoord::common::encode_key(name));
        let (_, entries) = self.get_entries(&path, dc, None).await?;
        Ok(entries)
    }

    async fn datacenters(&self) -> Result<Vec<DatacenterMap>> {
        let resp = self
            .http
            .get(format!("{}/v1/coordinate/datacenters", self.addr))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn update(&self, request: &CoordinateUpdateRequest) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/v1/coordinate/update", self.addr))
            .json(request)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        400 => Error::InvalidRequest(body),
        404 => Error::NotFound(body),
        503 => Error::Unavailable(body),
        504 => Error::Timeout(body),
        _ => Error::Internal(format!("{}: {}", status, body)),
    })
}

fn print_entries(entries: &[CoordinateEntry]) {
    if entries.is_empty() {
        println!("(no coordinates)");
    }
    for e in entries {
        let segment = if e.segment.is_empty() { "<default>" } else { &e.segment };
        println!(
            "{:<24} {:<12} height={:.6} error={:.3} vec={:?}",
            e.node, segment, e.coord.height, e.coord.error, e.coord.vec
        );
    }
}

/// Coordinate pair from a segment both nodes report, preferring the default.
fn shared_segment<'a>(
    a: &'a [CoordinateEntry],
    b: &'a [CoordinateEntry],
) -> Option<(&'a str, &'a Coordinate, &'a Coordinate)> {
    let mut pairs: Vec<_> = a
        .iter()
        .filter_map(|ea| {
            b.iter()
                .find(|eb| eb.segment == ea.segment)
                .map(|eb| (ea.segment.as_str(), &ea.coord, &eb.coord))
        })
        .collect();
    pairs.sort_by(|x, y| x.0.cmp(y.0));
    pairs.into_iter().next()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.addr)?;

    match cli.command {
        Commands::Nodes { dc, segment } => {
            let (index, entries) = client
                .get_entries("/coordinate/nodes", dc.as_deref(), segment.as_deref())
                .await?;
            println!("Index: {}", index);
            print_entries(&entries);
        }

        Commands::Node { name, dc, segment } => {
            let path = format!("/coordinate/node/{}", netcoord::common::encode_key(&name));
            let (index, entries) = client
                .get_entries(&path, dc.as_deref(), segment.as_deref())
                .await?;
            println!("Index: {}", index);
            print_entries(&entries);
        }

        Commands::Datacenters => {
            for map in client.datacenters().await? {
                println!("{}:", map.datacenter);
                print_entries(&map.coordinates);
            }
        }

        Commands::Update {
            node,
            vec,
            height,
            error,
            adjustment,
            segment,
            dc,
        } => {
            let request = CoordinateUpdateRequest {
                datacenter: dc.unwrap_or_default(),
                node,
                segment,
                coord: Coordinate {
                    vec,
                    error,
                    adjustment,
                    height,
                },
            };
            retry_with_backoff(|| client.update(&request), 3, Duration::from_millis(200)).await?;
            println!("Update accepted for {}", request.node);
        }

        Commands::Rtt { a, b, dc } => {
            let from = client.node(&a, dc.as_deref()).await?;
            let to = client.node(&b, dc.as_deref()).await?;
            let Some((segment, ca, cb)) = shared_segment(&from, &to) else {
                anyhow::bail!("{} and {} share no network segment with coordinates", a, b);
            };
            let rtt = ca.distance_to(cb)?;
            let segment = if segment.is_empty() { "<default>" } else { segment };
            println!(
                "Estimated RTT from {} to {} ({}): {:.3} ms",
                a,
                b,
                segment,
                rtt.as_secs_f64() * 1000.0
            );
        }
    }

    Ok(())
}
