//! Storage key derivation.
//!
//! A key is `twox128(pallet) || twox128(item) || hasher_1(arg_1) || ...`. The
//! first 32 bytes alone form the prefix used for paged key scans. Any deviation
//! from the chain's hashing silently yields empty results, so the known item
//! prefixes are pinned in the tests below.

use crate::primitives::StorageKey;

use blake2::{
    Blake2b,
    Digest,
    digest::consts::U16,
};
use parity_scale_codec::{
    Decode,
    Encode,
};
use xxhash_rust::xxh64::xxh64;

/// Length of `twox128(pallet) || twox128(item)`.
pub const PREFIX_LEN: usize = 32;

type Blake2b128 = Blake2b<U16>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hasher {
    Twox64Concat,
    Blake2_128Concat,
    Identity,
}

impl Hasher {
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Twox64Concat => [&twox_64(data)[..], data].concat(),
            Self::Blake2_128Concat => [&blake2_128(data)[..], data].concat(),
            Self::Identity => data.to_vec(),
        }
    }

    /// Width of the hash that precedes the raw argument.
    pub fn hash_len(self) -> usize {
        match self {
            Self::Twox64Concat => 8,
            Self::Blake2_128Concat => 16,
            Self::Identity => 0,
        }
    }
}

pub fn twox_64(data: &[u8]) -> [u8; 8] {
    xxh64(data, 0).to_le_bytes()
}

pub fn twox_128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&xxh64(data, 0).to_le_bytes());
    out[8..].copy_from_slice(&xxh64(data, 1).to_le_bytes());
    out
}

pub fn blake2_128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Blake2b128::digest(data));
    out
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StorageKeyError {
    #[error("{pallet}.{item} takes {expected} key arguments, got {got}")]
    ArgumentCount {
        pallet: &'static str,
        item: &'static str,
        expected: usize,
        got: usize,
    },
}

/// A storage map or value together with the hashers of its key arguments.
#[derive(Debug, Clone, Copy)]
pub struct StorageItem {
    pub pallet: &'static str,
    pub item: &'static str,
    pub hashers: &'static [Hasher],
}

impl StorageItem {
    pub const fn new(pallet: &'static str, item: &'static str, hashers: &'static [Hasher]) -> Self {
        Self {
            pallet,
            item,
            hashers,
        }
    }

    pub fn prefix(&self) -> StorageKey {
        storage_prefix(self.pallet, self.item).to_vec().into()
    }

    /// Derives the key for SCALE encoded `args`. Passing fewer arguments than
    /// the item has hashers yields a partial key usable as a scan prefix.
    pub fn key(&self, args: &[&[u8]]) -> Result<StorageKey, StorageKeyError> {
        if args.len() > self.hashers.len() {
            return Err(StorageKeyError::ArgumentCount {
                pallet: self.pallet,
                item: self.item,
                expected: self.hashers.len(),
                got: args.len(),
            });
        }
        Ok(self.derive(args))
    }

    fn derive(&self, args: &[&[u8]]) -> StorageKey {
        let mut key = storage_prefix(self.pallet, self.item).to_vec();
        for (hasher, arg) in self.hashers.iter().zip(args) {
            key.extend(hasher.hash(arg));
        }
        key.into()
    }

    /// Returns the raw first argument of a full key, skipping the prefix and
    /// the argument's hash.
    fn first_arg<'a>(&self, key: &'a [u8]) -> Option<&'a [u8]> {
        let hasher = self.hashers.first()?;
        key.get(PREFIX_LEN + hasher.hash_len()..)
    }
}

pub fn storage_prefix(pallet: &str, item: &str) -> [u8; PREFIX_LEN] {
    let mut out = [0u8; PREFIX_LEN];
    out[..16].copy_from_slice(&twox_128(pallet.as_bytes()));
    out[16..].copy_from_slice(&twox_128(item.as_bytes()));
    out
}

pub const SYSTEM_EVENTS: StorageItem = StorageItem::new("System", "Events", &[]);
pub const FILES_V2: StorageItem = StorageItem::new("Market", "FilesV2", &[Hasher::Twox64Concat]);
pub const WORK_REPORTS: StorageItem =
    StorageItem::new("Swork", "WorkReports", &[Hasher::Twox64Concat]);
pub const GROUPS: StorageItem = StorageItem::new("Swork", "Groups", &[Hasher::Blake2_128Concat]);
pub const IDENTITIES: StorageItem =
    StorageItem::new("Swork", "Identities", &[Hasher::Blake2_128Concat]);
pub const CURRENT_ERA: StorageItem = StorageItem::new("Staking", "CurrentEra", &[]);
pub const ERAS_TOTAL_STAKE: StorageItem =
    StorageItem::new("Staking", "ErasTotalStakes", &[Hasher::Twox64Concat]);
pub const ERAS_STAKING_PAYOUT: StorageItem =
    StorageItem::new("Staking", "ErasStakingPayout", &[Hasher::Twox64Concat]);
pub const ERAS_AUTHORING_PAYOUT: StorageItem = StorageItem::new(
    "Staking",
    "ErasAuthoringPayout",
    &[Hasher::Twox64Concat, Hasher::Twox64Concat],
);
pub const STAKE_LIMIT: StorageItem =
    StorageItem::new("Staking", "StakeLimit", &[Hasher::Twox64Concat]);

/// Key of `System.Events`.
pub fn events_key() -> StorageKey {
    SYSTEM_EVENTS.derive(&[])
}

/// Key of `Market.FilesV2` for `cid`.
pub fn file_key(cid: &str) -> StorageKey {
    FILES_V2.derive(&[&cid.as_bytes().encode()])
}

/// Key of `Swork.Identities` for an account.
pub fn identity_key(account: &[u8; 32]) -> StorageKey {
    IDENTITIES.derive(&[account])
}

/// Key of a single-`u32` era map such as `Staking.ErasTotalStakes`.
pub fn era_key(item: &StorageItem, era: u32) -> StorageKey {
    item.derive(&[&era.encode()])
}

/// Recovers the cid from a `Market.FilesV2` key.
pub fn cid_from_file_key(key: &[u8]) -> Option<String> {
    let mut raw = FILES_V2.first_arg(key)?;
    let bytes = Vec::<u8>::decode(&mut raw).ok()?;
    String::from_utf8(bytes).ok()
}

/// Recovers the provider anchor from a `Swork.WorkReports` key.
pub fn anchor_from_report_key(key: &[u8]) -> Option<Vec<u8>> {
    let mut raw = WORK_REPORTS.first_arg(key)?;
    Vec::<u8>::decode(&mut raw).ok()
}

/// Recovers the account id from a map keyed by `Blake2_128Concat(AccountId)`.
pub fn account_from_blake2_key(key: &[u8]) -> Option<[u8; 32]> {
    account_at(key, PREFIX_LEN + Hasher::Blake2_128Concat.hash_len())
}

/// Recovers the account id from a map keyed by `Twox64Concat(AccountId)`.
pub fn account_from_twox_key(key: &[u8]) -> Option<[u8; 32]> {
    account_at(key, PREFIX_LEN + Hasher::Twox64Concat.hash_len())
}

/// Recovers the era index from a map keyed by `Twox64Concat(EraIndex)`.
pub fn era_from_key(key: &[u8]) -> Option<u32> {
    let start = PREFIX_LEN + Hasher::Twox64Concat.hash_len();
    let raw: [u8; 4] = key.get(start..start + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

fn account_at(key: &[u8], start: usize) -> Option<[u8; 32]> {
    key.get(start..start + 32)?.try_into().ok()
}
