//! Test fixtures shared by unit and end-to-end tests.
//!
//! [`mock_chain::MockChain`] stands in for the node, [`FlakyStore`] wraps an
//! in-memory [`StatsStore`] and fails a configurable number of file writes.

#![allow(dead_code)]

pub mod mock_chain;

use stats_store::{
    ErrorRecord,
    FileRecord,
    GroupTotals,
    StatsStore,
    Store,
    StoreError,
    StoreResult,
    SworkerGroup,
    WorkReport,
};
use std::{
    io,
    sync::atomic::{
        AtomicU32,
        Ordering,
    },
};

/// In-memory store whose file writes fail until `failures` is used up.
pub struct FlakyStore {
    inner: StatsStore,
    failures: AtomicU32,
}

impl FlakyStore {
    pub fn failing_writes(failures: u32) -> Self {
        Self {
            inner: StatsStore::new_in_memory(),
            failures: AtomicU32::new(failures),
        }
    }

    pub fn inner(&self) -> &StatsStore {
        &self.inner
    }

    fn write_fault(&self) -> StoreResult<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::SledError(io::Error::other("injected write failure")))
        } else {
            Ok(())
        }
    }
}

impl Store for FlakyStore {
    fn segment_cursor_or_init(&self, end: u64, default: u64) -> StoreResult<u64> {
        self.inner.segment_cursor_or_init(end, default)
    }

    fn update_segment_cursor(&self, end: u64, cursor: u64) -> StoreResult<()> {
        self.inner.update_segment_cursor(end, cursor)
    }

    fn block_number_or_init(&self, default: u64) -> StoreResult<u64> {
        self.inner.block_number_or_init(default)
    }

    fn update_block_number(&self, block: u64) -> StoreResult<()> {
        self.inner.update_block_number(block)
    }

    fn insert_file(&self, file: FileRecord) -> StoreResult<bool> {
        self.write_fault()?;
        self.inner.insert_file(file)
    }

    fn upsert_file(&self, file: FileRecord) -> StoreResult<()> {
        self.write_fault()?;
        self.inner.upsert_file(file)
    }

    fn update_file_base(&self, file: FileRecord) -> StoreResult<()> {
        self.write_fault()?;
        self.inner.update_file_base(file)
    }

    fn update_replicas(&self, file: FileRecord) -> StoreResult<()> {
        self.write_fault()?;
        self.inner.update_replicas(file)
    }

    fn delete_file(&self, cid: &str) -> StoreResult<bool> {
        self.write_fault()?;
        self.inner.delete_file(cid)
    }

    fn file(&self, cid: &str) -> StoreResult<Option<FileRecord>> {
        self.inner.file(cid)
    }

    fn save_error(&self, record: ErrorRecord) -> StoreResult<bool> {
        self.inner.save_error(record)
    }

    fn errors(&self) -> StoreResult<Vec<ErrorRecord>> {
        self.inner.errors()
    }

    fn replace_work_reports(&self, reports: Vec<WorkReport>) -> StoreResult<()> {
        self.inner.replace_work_reports(reports)
    }

    fn work_reports(&self) -> StoreResult<Vec<WorkReport>> {
        self.inner.work_reports()
    }

    fn group_totals(&self, anchors: &[String]) -> StoreResult<GroupTotals> {
        self.inner.group_totals(anchors)
    }

    fn replace_groups(&self, groups: Vec<SworkerGroup>) -> StoreResult<()> {
        self.inner.replace_groups(groups)
    }

    fn groups(&self) -> StoreResult<Vec<SworkerGroup>> {
        self.inner.groups()
    }
}
