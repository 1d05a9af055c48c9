//! Work report and group scans over `Swork` storage.

use crate::{
    address,
    connection::Connection,
    decoder::{
        AccountId,
        GroupInfo,
        Identity,
        WorkReportInfo,
        decode_storage,
    },
    error::SnapshotError,
    paged::{
        KeyPager,
        values_at,
    },
    primitives::{
        BlockHash,
        encode_hex,
    },
    storage_key::{
        self,
        GROUPS,
        WORK_REPORTS,
    },
};

use stats_store::{
    Store,
    SworkerGroup,
    WorkReport,
};
use std::collections::HashMap;
use tracing::{
    debug,
    warn,
};

/// Blocks per report slot.
pub const SLOT_LENGTH: u64 = 600;
/// A report is active when it is at most this many slots old.
const ACTIVE_SLOTS: u64 = 6;
const REPORT_PAGE: u32 = 500;
const GROUP_PAGE: u32 = 500;
const IDENTITY_BATCH: usize = 600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportCounts {
    pub all: usize,
    pub active: usize,
}

/// First slot still considered active at block `head`.
pub fn active_slot_floor(head: u64) -> u64 {
    let last_slot = head / SLOT_LENGTH * SLOT_LENGTH;
    last_slot.saturating_sub(ACTIVE_SLOTS * SLOT_LENGTH)
}

/// Scans every work report at the best block and stores the active ones.
pub async fn refresh_work_reports(
    conn: &Connection,
    store: &dyn Store,
) -> Result<ReportCounts, SnapshotError> {
    let (at, head) = conn.best_header().await?;
    let floor = active_slot_floor(head.number);

    let mut counts = ReportCounts::default();
    let mut active = Vec::new();
    let mut pager = KeyPager::new(conn, WORK_REPORTS.prefix(), REPORT_PAGE, at);
    while let Some(keys) = pager.next_page().await? {
        counts.all += keys.len();
        for (key, value) in values_at(conn, &keys, at).await? {
            let info = match decode_storage::<WorkReportInfo>("Swork.WorkReports", value.as_slice()) {
                Ok(info) => info,
                Err(error) => {
                    warn!(%error, %key, "Skipping undecodable work report");
                    continue;
                }
            };
            if info.report_slot < floor {
                continue;
            }
            let Some(anchor) = storage_key::anchor_from_report_key(key.as_slice()) else {
                warn!(%key, "Skipping work report with malformed key");
                continue;
            };
            active.push(WorkReport::new(
                encode_hex(&anchor),
                info.report_slot,
                info.spower,
                info.free,
                info.reported_files_size,
                encode_hex(&info.reported_srd_root),
                encode_hex(&info.reported_files_root),
            ));
        }
    }

    counts.active = active.len();
    store.replace_work_reports(active)?;
    debug!(all = counts.all, active = counts.active, floor, "Work reports refreshed");
    Ok(counts)
}

/// Scans every group at the best block and aggregates the stored work
/// reports of its members. Run after [`refresh_work_reports`].
pub async fn refresh_groups(
    conn: &Connection,
    store: &dyn Store,
    network_id: u16,
) -> Result<usize, SnapshotError> {
    let at = conn.best_hash().await?;

    let mut groups: Vec<(AccountId, GroupInfo)> = Vec::new();
    let mut pager = KeyPager::new(conn, GROUPS.prefix(), GROUP_PAGE, at);
    while let Some(keys) = pager.next_page().await? {
        for (key, value) in values_at(conn, &keys, at).await? {
            let Some(owner) = storage_key::account_from_blake2_key(key.as_slice()) else {
                warn!(%key, "Skipping group with malformed key");
                continue;
            };
            match decode_storage::<GroupInfo>("Swork.Groups", value.as_slice()) {
                Ok(info) => groups.push((owner, info)),
                Err(error) => warn!(%error, %key, "Skipping undecodable group"),
            }
        }
    }

    let members: Vec<AccountId> = groups
        .iter()
        .flat_map(|(_, info)| info.members.iter().copied())
        .collect();
    let anchors = member_anchors(conn, &members, at).await?;

    let mut rows = Vec::with_capacity(groups.len());
    for (owner, info) in &groups {
        let member_anchors: Vec<String> = info
            .members
            .iter()
            .filter_map(|member| anchors.get(member).cloned())
            .collect();
        let totals = if member_anchors.is_empty() {
            Default::default()
        } else {
            store.group_totals(&member_anchors)?
        };
        rows.push(SworkerGroup::new(
            address::encode(owner, network_id),
            u32::try_from(info.members.len()).unwrap_or(u32::MAX),
            totals,
        ));
    }

    let count = rows.len();
    store.replace_groups(rows)?;
    debug!(groups = count, members = members.len(), "Groups refreshed");
    Ok(count)
}

/// Anchor of every member with a registered identity.
async fn member_anchors(
    conn: &Connection,
    members: &[AccountId],
    at: BlockHash,
) -> Result<HashMap<AccountId, String>, SnapshotError> {
    let mut anchors = HashMap::with_capacity(members.len());
    for chunk in members.chunks(IDENTITY_BATCH) {
        let keys: Vec<_> = chunk.iter().map(storage_key::identity_key).collect();
        for (key, value) in values_at(conn, &keys, at).await? {
            let Some(member) = storage_key::account_from_blake2_key(key.as_slice()) else {
                continue;
            };
            match decode_storage::<Identity>("Swork.Identities", value.as_slice()) {
                Ok(identity) => {
                    anchors.insert(member, encode_hex(&identity.anchor));
                }
                Err(error) => warn!(%error, %key, "Skipping undecodable identity"),
            }
        }
    }
    Ok(anchors)
}
