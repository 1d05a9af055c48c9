//! Rows materialized by the indexer.

use serde::{
    Deserialize,
    Serialize,
};

/// A stored file, unique by `cid`.
///
/// `id` is assigned by the store on first insert and stays stable across
/// base and replica updates. Replicas are owned by the file and are always
/// replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub cid: String,
    pub file_size: u64,
    pub spower: u64,
    pub expired_at: u32,
    pub calculated_at: u32,
    pub created_at: u32,
    pub amount: u128,
    pub prepaid: u128,
    pub reported_replica_count: u32,
    pub remaining_paid_count: u32,
    pub replicas: Vec<ReplicaRecord>,
}

impl FileRecord {
    /// Copies every scalar column of `other` into `self`, leaving `id`,
    /// `cid` and the replica set untouched.
    pub fn apply_base(&mut self, other: &Self) {
        self.file_size = other.file_size;
        self.spower = other.spower;
        self.expired_at = other.expired_at;
        self.calculated_at = other.calculated_at;
        self.created_at = other.created_at;
        self.amount = other.amount;
        self.prepaid = other.prepaid;
        self.reported_replica_count = other.reported_replica_count;
        self.remaining_paid_count = other.remaining_paid_count;
    }

    /// Rewrites the owner id of every replica.
    pub(crate) fn assign_id(&mut self, id: u64) {
        self.id = id;
        for replica in &mut self.replicas {
            replica.file_id = id;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub file_id: u64,
    pub group_owner: String,
    pub who: String,
    pub valid_at: u32,
    pub anchor: String,
    pub is_reported: bool,
    pub created_at: u32,
}

/// Latest work report of one storage provider, keyed by its anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkReport {
    pub anchor: String,
    pub slot: u64,
    pub spower: u64,
    pub free: u64,
    pub file_size: u64,
    pub ratio: f64,
    pub srd_root: String,
    pub file_root: String,
}

impl WorkReport {
    pub fn new(
        anchor: String,
        slot: u64,
        spower: u64,
        free: u64,
        file_size: u64,
        srd_root: String,
        file_root: String,
    ) -> Self {
        Self {
            anchor,
            slot,
            spower,
            free,
            file_size,
            ratio: Self::compute_ratio(file_size, free),
            srd_root,
            file_root,
        }
    }

    /// Share of used space against free space, in percent. A provider with no
    /// free space counts as full.
    #[allow(clippy::cast_precision_loss)]
    pub fn compute_ratio(file_size: u64, free: u64) -> f64 {
        if free == 0 {
            100.0
        } else {
            file_size as f64 / free as f64 * 100.0
        }
    }
}

/// Sums over the work reports of a set of anchors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTotals {
    pub active_member_count: u32,
    pub free_sum: u64,
    pub spower_sum: u64,
    pub file_size_sum: u64,
}

impl GroupTotals {
    pub(crate) fn add(&mut self, report: &WorkReport) {
        self.active_member_count += 1;
        self.free_sum = self.free_sum.saturating_add(report.free);
        self.spower_sum = self.spower_sum.saturating_add(report.spower);
        self.file_size_sum = self.file_size_sum.saturating_add(report.file_size);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SworkerGroup {
    pub group_id: String,
    pub all_member_count: u32,
    pub active_member_count: u32,
    pub free_sum: u64,
    pub spower_sum: u64,
    pub file_size_sum: u64,
}

impl SworkerGroup {
    pub fn new(group_id: String, all_member_count: u32, totals: GroupTotals) -> Self {
        Self {
            group_id,
            all_member_count,
            active_member_count: totals.active_member_count,
            free_sum: totals.free_sum,
            spower_sum: totals.spower_sum,
            file_size_sum: totals.file_size_sum,
        }
    }
}

/// Dead-letter row for a file that could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub cid: String,
    pub key: String,
}
