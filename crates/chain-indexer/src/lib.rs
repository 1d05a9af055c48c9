#![doc = include_str!("../README.md")]
#![allow(clippy::missing_errors_doc)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::unreachable)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::indexing_slicing)]
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::indexing_slicing))]

pub mod address;
pub mod backfill;
pub mod cli;
mod config;
pub mod connection;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod file;
#[cfg(test)]
mod integration_tests;
pub mod listener;
mod macros;
pub mod metrics;
pub mod paged;
pub mod primitives;
pub mod rpc;
pub mod stake;
pub mod storage_key;
pub mod sworker;

pub use config::Config;

use crate::{
    backfill::{
        Backfill,
        BackfillCompletion,
    },
    connection::Connection,
    decoder::ScaleDecoder,
    error::{
        IndexerError,
        IndexerResult,
    },
    listener::Listener,
    rpc::JsonRpcClient,
};

use anyhow::{
    Context,
    Result,
};
use stats_store::{
    StatsStore,
    Store,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    info,
    warn,
};

/// Run the indexer until `shutdown` is cancelled.
///
/// This is the main entry point for running the indexer as a library. Failing
/// to open the store or to reach the node is fatal; everything afterwards is
/// retried until shutdown.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    let store = Arc::new(match &config.db_path {
        Some(path) => {
            StatsStore::open(path).with_context(|| format!("failed to open database at {path}"))?
        }
        None => {
            warn!("No database path configured, indexing into memory");
            StatsStore::new_in_memory()
        }
    });

    let rpc = JsonRpcClient::connect(&config.rpc_url)
        .await
        .with_context(|| format!("failed to create rpc client for {}", config.rpc_url))?;
    let conn = Connection::connect(Arc::new(rpc), Arc::new(ScaleDecoder::new()), shutdown)
        .await
        .context("failed to connect to chain")?;

    let result = run_with(Arc::new(conn), store.clone(), config).await;
    store.flush().context("failed to flush database")?;
    result
}

/// Runs backfill, the listener and the optional snapshot scans over an
/// established connection.
pub async fn run_with(conn: Arc<Connection>, store: Arc<dyn Store>, config: Config) -> Result<()> {
    let config = Arc::new(config);
    let shutdown = conn.shutdown().clone();
    let completion = BackfillCompletion::new();

    let backfill = Backfill::new(
        conn.clone(),
        store.clone(),
        config.clone(),
        completion.clone(),
    );
    let listener = Listener::new(
        conn.clone(),
        store.clone(),
        config.clone(),
        completion.clone(),
    );

    let (backfill, listener, snapshots) = tokio::join!(
        async { settle(&shutdown, "backfill", backfill.run().await) },
        async { settle(&shutdown, "listener", listener.run().await) },
        async {
            match config.snapshot_interval {
                Some(interval) => {
                    let result = run_snapshots(&conn, store.as_ref(), &completion, config.network_id, interval).await;
                    settle(&shutdown, "snapshots", result)
                }
                None => Ok(()),
            }
        },
    );

    backfill.and(listener).and(snapshots)?;
    info!("Chain indexer stopped");
    Ok(())
}

/// Maps a task result. A failing task cancels its siblings.
fn settle(shutdown: &CancellationToken, task: &'static str, result: IndexerResult<()>) -> Result<()> {
    match result {
        Ok(()) | Err(IndexerError::Terminated) => Ok(()),
        Err(error) => {
            critical!(%error, task, "Indexer task failed, shutting down");
            shutdown.cancel();
            Err(anyhow::Error::new(error).context(format!("{task} failed")))
        }
    }
}

/// Periodically rescans work reports, groups and stakes once backfill is done.
async fn run_snapshots(
    conn: &Connection,
    store: &dyn Store,
    completion: &BackfillCompletion,
    network_id: u16,
    interval: Duration,
) -> IndexerResult<()> {
    tokio::select! {
        () = conn.shutdown().cancelled() => return Err(IndexerError::Terminated),
        () = completion.wait() => {}
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = conn.shutdown().cancelled() => return Err(IndexerError::Terminated),
            _ = ticker.tick() => {}
        }
        snapshot(conn, store, network_id).await;
    }
}

async fn snapshot(conn: &Connection, store: &dyn Store, network_id: u16) {
    match sworker::refresh_work_reports(conn, store).await {
        Ok(counts) => {
            metrics::record_work_reports(counts);
            match sworker::refresh_groups(conn, store, network_id).await {
                Ok(groups) => metrics::record_groups(groups),
                Err(error) => warn!(%error, "Group scan failed"),
            }
        }
        Err(error) => warn!(%error, "Work report scan failed"),
    }

    match stake::total_stakes(conn).await {
        Ok(stakes) => metrics::record_total_stakes(&stakes),
        Err(error) => warn!(%error, "Total stake scan failed"),
    }
    match stake::stake_by_era(conn).await {
        Ok(stake) => metrics::record_era_stake(stake),
        Err(error) => warn!(%error, "Era stake lookup failed"),
    }
    match stake::reward_by_era(conn).await {
        Ok(reward) => metrics::record_era_reward(reward),
        Err(error) => warn!(%error, "Era reward lookup failed"),
    }
    match stake::top_stake_limits(conn, network_id).await {
        Ok(limits) => metrics::record_stake_limits(&limits),
        Err(error) => warn!(%error, "Stake limit scan failed"),
    }
}
