//! `coveyd` — the Covey daemon.
//!
//! Runs a bucket-distribution cluster inside one process: an in-memory
//! broker plus N distributor peers, each holding its share of the
//! configured bucket universe. Shares are logged as the cluster
//! converges, which makes the daemon a convenient way to observe
//! rebalancing behavior under different timing settings.
//!
//! # Usage
//!
//! ```text
//! coveyd run                     # two peers, eight buckets, defaults
//! coveyd run -c covey.toml       # run with a config file
//! coveyd run -n 4                # override the peer count
//! ```

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use covey_broker::{Connection, MemoryBroker};
use covey_cluster::Distributor;
use tracing::info;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "coveyd", version, about = "Covey bucket distribution daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local cluster until interrupted.
    Run {
        /// Override the number of peers.
        #[arg(short = 'n', long)]
        peers: Option<usize>,

        /// Override the bucket universe (comma-separated names).
        #[arg(short, long, value_delimiter = ',')]
        buckets: Option<Vec<String>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("loading config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Run { peers, buckets } => {
            if let Some(count) = peers {
                config.peers.count = count;
            }
            if let Some(buckets) = buckets {
                config.cluster.buckets = buckets;
            }
            run(config).await
        }
    }
}

async fn run(config: CliConfig) -> Result<()> {
    anyhow::ensure!(config.peers.count > 0, "peer count must be at least 1");
    anyhow::ensure!(
        !config.cluster.buckets.is_empty(),
        "bucket universe must not be empty"
    );

    let broker = MemoryBroker::new();
    let options = config.options();

    info!(
        cluster = %config.cluster.name,
        peers = config.peers.count,
        buckets = config.cluster.buckets.len(),
        "starting local cluster"
    );

    // One connection per peer: exclusive-queue semantics (the seeding
    // lock, private broadcast queues) are scoped to a connection.
    let mut peers = Vec::with_capacity(config.peers.count);
    for _ in 0..config.peers.count {
        let connection = broker.connect();
        let distributor = Distributor::start(
            Arc::clone(&connection),
            &config.cluster.name,
            config.cluster.buckets.clone(),
            options.clone(),
        )
        .await
        .context("starting distributor")?;
        peers.push((connection, distributor));
    }

    // Each round, every peer treats its current share as one batch of
    // completed work: acquire, log, release. Releasing keeps drains
    // unblocked, so share changes can restart consumers between rounds.
    let mut rounds = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = rounds.tick() => {
                for (_, distributor) in &peers {
                    let held = distributor.acquire_buckets();
                    let mut names: Vec<&String> = held.iter().collect();
                    names.sort();
                    info!(
                        peer = %distributor.peer_id(),
                        share = distributor.partition_size(),
                        buckets = ?names,
                        "worked"
                    );
                    distributor.release_buckets(&held).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping cluster");
                break;
            }
        }
    }

    for (connection, distributor) in peers {
        // Hand everything back so the graceful stop can drain.
        let held = distributor.acquire_buckets();
        distributor.release_buckets(&held).await;
        distributor.stop().await;
        connection.close().await;
    }

    info!("cluster stopped");
    Ok(())
}
