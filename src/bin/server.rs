//! Coordinate server binary

use clap::{Parser, Subcommand};
use netcoord::common::{Config, RemoteDatacenter};
use netcoord::Server;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "netcoord-server")]
#[command(about = "Network coordinate ingestion and query server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinate server
    Serve {
        /// Node name
        #[arg(long)]
        node: Option<String>,

        /// Local datacenter
        #[arg(long)]
        dc: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Database directory (in-memory if omitted)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Remote datacenters as name=address (comma-separated)
        #[arg(long, value_delimiter = ',')]
        remote: Vec<String>,

        /// Flush interval in milliseconds
        #[arg(long)]
        update_period_ms: Option<u64>,
    },
}

fn parse_remote(arg: &str) -> anyhow::Result<RemoteDatacenter> {
    let (name, address) = arg
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected name=address, got {}", arg))?;
    Ok(RemoteDatacenter {
        name: name.to_string(),
        address: address.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            node,
            dc,
            bind,
            db,
            remote,
            update_period_ms,
        } => {
            // File and environment first, CLI arguments take priority
            let mut config = Config::load()?;
            if let Some(node) = node {
                config.node_name = node;
            }
            if let Some(dc) = dc {
                config.datacenter = dc;
            }
            if let Some(bind) = bind {
                config.server.bind_addr = bind.parse()?;
            }
            if db.is_some() {
                config.server.db_path = db;
            }
            if !remote.is_empty() {
                config.datacenters = remote
                    .iter()
                    .map(|r| parse_remote(r))
                    .collect::<anyhow::Result<_>>()?;
            }
            if let Some(ms) = update_period_ms {
                config.coordinate.update_period_ms = ms;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            Server::new(config).serve().await?;
        }
    }

    Ok(())
}
