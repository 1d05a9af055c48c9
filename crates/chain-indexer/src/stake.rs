//! Staking scans. Values are reported in CRU.

#![allow(clippy::cast_precision_loss)]

use crate::{
    address,
    connection::Connection,
    decoder::decode_storage,
    error::SnapshotError,
    paged::{
        KeyPager,
        values_at,
    },
    primitives::BlockHash,
    storage_key::{
        self,
        CURRENT_ERA,
        ERAS_AUTHORING_PAYOUT,
        ERAS_STAKING_PAYOUT,
        ERAS_TOTAL_STAKE,
        STAKE_LIMIT,
    },
};

use tracing::warn;

/// Smallest units per CRU.
pub const CRU: f64 = 1e12;
const STAKE_PAGE: u32 = 1000;
const STAKE_LIMIT_PAGE: u32 = 800;
const TOP_STAKE_LIMITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stake {
    pub era: u32,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StakeLimit {
    pub account: String,
    pub value: f64,
}

fn to_cru(raw: u128) -> f64 {
    raw as f64 / CRU
}

/// Total stake per era, from the first page of `Staking.ErasTotalStakes`.
pub async fn total_stakes(conn: &Connection) -> Result<Vec<Stake>, SnapshotError> {
    let at = conn.best_hash().await?;
    let prefix = ERAS_TOTAL_STAKE.prefix();
    let keys = conn.keys_paged(&prefix, STAKE_PAGE, Some(&prefix), at).await?;

    let mut stakes = Vec::with_capacity(keys.len());
    for (key, value) in values_at(conn, &keys, at).await? {
        let Some(era) = storage_key::era_from_key(key.as_slice()) else {
            continue;
        };
        match decode_storage::<u128>("Staking.ErasTotalStakes", value.as_slice()) {
            Ok(raw) => {
                stakes.push(Stake {
                    era,
                    value: to_cru(raw),
                });
            }
            Err(error) => warn!(%error, era, "Skipping undecodable total stake"),
        }
    }
    stakes.sort_by_key(|stake| stake.era);
    Ok(stakes)
}

pub async fn current_era(conn: &Connection) -> Result<u32, SnapshotError> {
    let at = conn.best_hash().await?;
    current_era_at(conn, at).await
}

async fn current_era_at(conn: &Connection, at: BlockHash) -> Result<u32, SnapshotError> {
    let raw = conn
        .storage_at(&CURRENT_ERA.prefix(), at)
        .await?
        .ok_or(SnapshotError::Missing("Staking.CurrentEra"))?;
    Ok(decode_storage("Staking.CurrentEra", raw.as_slice())?)
}

/// Reads a `u128` era map entry. Unset entries count as zero.
async fn era_value(
    conn: &Connection,
    item: &storage_key::StorageItem,
    era: u32,
    at: BlockHash,
) -> Result<u128, SnapshotError> {
    match conn.storage_at(&storage_key::era_key(item, era), at).await? {
        Some(raw) => Ok(decode_storage(item.item, raw.as_slice())?),
        None => Ok(0),
    }
}

/// Total stake of the current era.
pub async fn stake_by_era(conn: &Connection) -> Result<Stake, SnapshotError> {
    let at = conn.best_hash().await?;
    let era = current_era_at(conn, at).await?;
    let raw = era_value(conn, &ERAS_TOTAL_STAKE, era, at).await?;
    Ok(Stake {
        era,
        value: to_cru(raw),
    })
}

/// Rewards of the previous era: the staking payout plus every authoring
/// payout recorded for that era.
pub async fn reward_by_era(conn: &Connection) -> Result<Stake, SnapshotError> {
    let at = conn.best_hash().await?;
    let era = current_era_at(conn, at).await?.saturating_sub(1);
    let mut total = to_cru(era_value(conn, &ERAS_STAKING_PAYOUT, era, at).await?);

    let prefix = storage_key::era_key(&ERAS_AUTHORING_PAYOUT, era);
    let mut pager = KeyPager::new(conn, prefix, STAKE_PAGE, at);
    while let Some(keys) = pager.next_page().await? {
        for (key, value) in values_at(conn, &keys, at).await? {
            match decode_storage::<u128>("Staking.ErasAuthoringPayout", value.as_slice()) {
                Ok(raw) => total += to_cru(raw),
                Err(error) => warn!(%error, %key, "Skipping undecodable authoring payout"),
            }
        }
    }

    Ok(Stake { era, value: total })
}

/// Largest non-zero entries of `Staking.StakeLimit`.
pub async fn top_stake_limits(
    conn: &Connection,
    network_id: u16,
) -> Result<Vec<StakeLimit>, SnapshotError> {
    let at = conn.best_hash().await?;
    let mut limits = Vec::new();
    let mut pager = KeyPager::new(conn, STAKE_LIMIT.prefix(), STAKE_LIMIT_PAGE, at);
    while let Some(keys) = pager.next_page().await? {
        for (key, value) in values_at(conn, &keys, at).await? {
            let Some(account) = storage_key::account_from_twox_key(key.as_slice()) else {
                continue;
            };
            let Ok(raw) = decode_storage::<u128>("Staking.StakeLimit", value.as_slice()) else {
                continue;
            };
            if raw > 0 {
                limits.push(StakeLimit {
                    account: address::encode(&account, network_id),
                    value: to_cru(raw),
                });
            }
        }
    }
    Ok(top(limits, TOP_STAKE_LIMITS))
}

fn top(mut limits: Vec<StakeLimit>, n: usize) -> Vec<StakeLimit> {
    limits.sort_by(|a, b| b.value.total_cmp(&a.value));
    limits.truncate(n);
    limits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(account: &str, value: f64) -> StakeLimit {
        StakeLimit {
            account: account.to_string(),
            value,
        }
    }

    #[test]
    fn top_is_sorted_and_bounded() {
        let limits = vec![limit("a", 1.0), limit("b", 3.0), limit("c", 2.0)];
        let top2 = top(limits.clone(), 2);
        assert_eq!(top2, vec![limit("b", 3.0), limit("c", 2.0)]);
        assert_eq!(top(limits, 10).len(), 3);
    }

    #[test]
    fn cru_conversion() {
        assert!((to_cru(1_500_000_000_000) - 1.5).abs() < f64::EPSILON);
        assert!(to_cru(0).abs() < f64::EPSILON);
    }
}
