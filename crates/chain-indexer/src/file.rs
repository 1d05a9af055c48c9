//! Conversion of `Market.FilesV2` entries into stored rows.

use crate::{
    address,
    decoder::FileInfoV2,
    primitives::encode_hex,
};
use stats_store::{
    FileRecord,
    ReplicaRecord,
};

/// Lifetime of a storage order in blocks. Used to recover the creation height
/// of a file when it is not known from the event that created it.
pub const EXPIRE_DURATION: u32 = 2_592_000;

/// Builds the stored row for `cid`.
///
/// With `height` the row is created at that block. Without it the creation
/// height is derived from `expired_at` and then pulled back to the earliest
/// replica creation height when that is lower.
pub fn to_file_record(
    cid: &str,
    info: &FileInfoV2,
    height: Option<u64>,
    network_id: u16,
) -> FileRecord {
    let replicas: Vec<ReplicaRecord> = info
        .replicas
        .iter()
        .map(|(owner, replica)| {
            ReplicaRecord {
                file_id: 0,
                group_owner: address::encode(owner, network_id),
                who: address::encode(&replica.who, network_id),
                valid_at: replica.valid_at,
                anchor: encode_hex(&replica.anchor),
                is_reported: replica.is_reported,
                created_at: replica.created_at.unwrap_or(0),
            }
        })
        .collect();

    let created_at = match height {
        Some(height) => u32::try_from(height).unwrap_or(u32::MAX),
        None => derived_created_at(info.expired_at, &replicas),
    };

    FileRecord {
        id: 0,
        cid: cid.to_string(),
        file_size: info.file_size,
        spower: if info.spower == 0 {
            info.file_size
        } else {
            info.spower
        },
        expired_at: info.expired_at,
        calculated_at: info.calculated_at,
        created_at,
        amount: info.amount,
        prepaid: info.prepaid,
        reported_replica_count: info.reported_replica_count,
        remaining_paid_count: info.remaining_paid_count,
        replicas,
    }
}

fn derived_created_at(expired_at: u32, replicas: &[ReplicaRecord]) -> u32 {
    let base = expired_at.saturating_sub(EXPIRE_DURATION);
    let earliest = replicas
        .iter()
        .map(|replica| replica.created_at)
        .filter(|created_at| *created_at > 0)
        .min();
    match earliest {
        Some(earliest) if earliest < base => earliest,
        _ => base,
    }
}
