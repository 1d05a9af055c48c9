//! Metrics recorded by the chain indexer.
//!
//! Only the `metrics` facade is used here. Installing an exporter is up to the
//! embedding process.
//!
//! ## Metrics recorded
//!
//! ### Counters
//! - `chain_indexer_blocks_processed_total{source}`: Blocks fully handled, `source` is `backfill` or `live`
//! - `chain_indexer_files_persisted_total`: File rows written
//! - `chain_indexer_dead_letters_total`: File operations moved to the error table
//! - `chain_indexer_rpc_retries_total`: Failed chain requests that were retried
//! - `chain_indexer_backfill_segments_done_total`: Backfill segments finished
//! - `chain_indexer_critical_total`: Conditions logged through `critical!`
//!
//! ### Gauges
//! - `chain_indexer_live_block`: Last block handled by the listener
//! - `chain_indexer_work_reports{state}`: Work reports seen by the last scan, `state` is `all` or `active`
//! - `chain_indexer_sworker_groups`: Groups seen by the last scan
//! - `chain_indexer_total_stake{era}`: Total stake per era, in CRU
//! - `chain_indexer_era_stake{era}`: Total stake of the current era, in CRU
//! - `chain_indexer_era_reward{era}`: Rewards paid for the previous era, in CRU
//! - `chain_indexer_top_stake_limit{account}`: Largest stake limits, in CRU

#![allow(clippy::cast_precision_loss)]

use crate::{
    stake::{
        Stake,
        StakeLimit,
    },
    sworker::ReportCounts,
};

use metrics::{
    counter,
    gauge,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Backfill,
    Live,
}

impl BlockSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::Live => "live",
        }
    }
}

pub fn record_block_processed(source: BlockSource, number: u64) {
    counter!("chain_indexer_blocks_processed_total", "source" => source.as_str()).increment(1);
    if source == BlockSource::Live {
        gauge!("chain_indexer_live_block").set(number as f64);
    }
}

pub fn record_file_persisted() {
    counter!("chain_indexer_files_persisted_total").increment(1);
}

pub fn record_dead_letter() {
    counter!("chain_indexer_dead_letters_total").increment(1);
}

pub fn record_rpc_retry() {
    counter!("chain_indexer_rpc_retries_total").increment(1);
}

pub fn record_segment_done() {
    counter!("chain_indexer_backfill_segments_done_total").increment(1);
}

pub fn record_work_reports(counts: ReportCounts) {
    gauge!("chain_indexer_work_reports", "state" => "all").set(counts.all as f64);
    gauge!("chain_indexer_work_reports", "state" => "active").set(counts.active as f64);
}

pub fn record_groups(count: usize) {
    gauge!("chain_indexer_sworker_groups").set(count as f64);
}

pub fn record_total_stakes(stakes: &[Stake]) {
    for stake in stakes {
        gauge!("chain_indexer_total_stake", "era" => stake.era.to_string()).set(stake.value);
    }
}

pub fn record_era_stake(stake: Stake) {
    gauge!("chain_indexer_era_stake", "era" => stake.era.to_string()).set(stake.value);
}

pub fn record_era_reward(reward: Stake) {
    gauge!("chain_indexer_era_reward", "era" => reward.era.to_string()).set(reward.value);
}

pub fn record_stake_limits(limits: &[StakeLimit]) {
    for limit in limits {
        gauge!("chain_indexer_top_stake_limit", "account" => limit.account.clone()).set(limit.value);
    }
}
