//! Runtime configuration of the indexer.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub rpc_url: String,
    /// sled directory. `None` keeps everything in memory.
    pub db_path: Option<String>,
    /// Last height covered by backfill.
    pub start_block: u64,
    pub segment_size: u64,
    pub confirmations: u64,
    /// Segment checkpoints are flushed every `checkpoint_stride` blocks.
    pub checkpoint_stride: u64,
    /// Take replica updates from `market.update_replicas` instead of
    /// `swork.report_works`.
    pub use_market_update: bool,
    /// SS58 network id used for stored account addresses.
    pub network_id: u16,
    pub segment_stagger: Duration,
    pub rpc_retry: Duration,
    pub hash_retry: Duration,
    pub persist_retries: u32,
    pub persist_retry: Duration,
    /// Period of the work report, group and stake scans. `None` disables them.
    pub snapshot_interval: Option<Duration>,
}

impl Config {
    /// Small intervals so tests never wait on real-world timings.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:9933".to_string(),
            db_path: None,
            start_block: 0,
            segment_size: 20,
            confirmations: 0,
            checkpoint_stride: 10,
            use_market_update: false,
            network_id: 66,
            segment_stagger: Duration::ZERO,
            rpc_retry: Duration::from_millis(5),
            hash_retry: Duration::from_millis(5),
            persist_retries: 3,
            persist_retry: Duration::from_millis(1),
            snapshot_interval: None,
        }
    }
}
