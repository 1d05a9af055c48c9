//! Command-line configuration for the chain indexer.

use crate::config::Config;

use clap::Parser;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Node endpoint, `http(s)://` or `ws(s)://`.
    #[arg(long, env = "CHAIN_INDEXER_RPC_URL")]
    pub rpc_url: String,

    /// sled database directory. Runs in memory when omitted.
    #[arg(long, env = "CHAIN_INDEXER_DB_PATH")]
    pub db_path: Option<String>,

    /// Last block covered by backfill.
    #[arg(long, env = "CHAIN_INDEXER_START_BLOCK", default_value = "0")]
    pub start_block: u64,

    #[arg(long, env = "CHAIN_INDEXER_SEGMENT_SIZE", default_value = "20")]
    pub segment_size: u64,

    #[arg(long, env = "CHAIN_INDEXER_CONFIRMATIONS", default_value = "0")]
    pub confirmations: u64,

    #[arg(long, env = "CHAIN_INDEXER_CHECKPOINT_STRIDE", default_value = "10")]
    pub checkpoint_stride: u64,

    #[arg(
        long,
        env = "CHAIN_INDEXER_USE_MARKET_UPDATE",
        action = clap::ArgAction::Set,
        default_value_t = false
    )]
    pub use_market_update: bool,

    #[arg(long, env = "CHAIN_INDEXER_NETWORK_ID", default_value = "66")]
    pub network_id: u16,

    #[arg(long, env = "CHAIN_INDEXER_SEGMENT_STAGGER_MS", default_value = "1000")]
    pub segment_stagger_ms: u64,

    #[arg(long, env = "CHAIN_INDEXER_RPC_RETRY_MS", default_value = "5000")]
    pub rpc_retry_ms: u64,

    #[arg(long, env = "CHAIN_INDEXER_HASH_RETRY_MS", default_value = "1000")]
    pub hash_retry_ms: u64,

    #[arg(long, env = "CHAIN_INDEXER_PERSIST_RETRIES", default_value = "5")]
    pub persist_retries: u32,

    /// Pause between failed store writes.
    #[arg(long, env = "CHAIN_INDEXER_PERSIST_RETRY_MS", default_value = "1000")]
    pub persist_retry_ms: u64,

    /// Seconds between work report, group and stake scans. 0 disables them.
    #[arg(long, env = "CHAIN_INDEXER_SNAPSHOT_INTERVAL_SECS", default_value = "0")]
    pub snapshot_interval_secs: u64,

    #[arg(long, env = "CHAIN_INDEXER_LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            rpc_url: args.rpc_url,
            db_path: args.db_path,
            start_block: args.start_block,
            segment_size: args.segment_size,
            confirmations: args.confirmations,
            checkpoint_stride: args.checkpoint_stride,
            use_market_update: args.use_market_update,
            network_id: args.network_id,
            segment_stagger: Duration::from_millis(args.segment_stagger_ms),
            rpc_retry: Duration::from_millis(args.rpc_retry_ms),
            hash_retry: Duration::from_millis(args.hash_retry_ms),
            persist_retries: args.persist_retries,
            persist_retry: Duration::from_millis(args.persist_retry_ms),
            snapshot_interval: (args.snapshot_interval_secs > 0)
                .then(|| Duration::from_secs(args.snapshot_interval_secs)),
        }
    }
}
