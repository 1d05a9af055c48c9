//! Applies file lifecycle operations to the store.
//!
//! Every operation is retried a bounded number of times. When retries run out
//! the cid is written to the error table and the pipeline moves on.

use crate::{
    critical,
    error::{
        IndexerError,
        IndexerResult,
    },
    metrics,
    storage_key,
};

use stats_store::{
    ErrorRecord,
    FileRecord,
    Store,
    StoreResult,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

const PERSIST_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    /// A file first seen in this block.
    New(FileRecord),
    /// Scalar columns changed, replicas untouched.
    UpdateBase(FileRecord),
    /// Replica set changed.
    UpdateReplicas(FileRecord),
    Delete { cid: String },
}

impl FileOperation {
    pub fn cid(&self) -> &str {
        match self {
            Self::New(file) | Self::UpdateBase(file) | Self::UpdateReplicas(file) => &file.cid,
            Self::Delete { cid } => cid,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::New(_) => "new",
            Self::UpdateBase(_) => "update_base",
            Self::UpdateReplicas(_) => "update_replicas",
            Self::Delete { .. } => "delete",
        }
    }
}

/// How [`FileOperation::New`] treats a cid that is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewFilePolicy {
    /// Leave the stored row alone. Backfill replays must not clobber rows
    /// written by the listener.
    KeepExisting,
    /// Replace the stored row, keeping its id.
    Overwrite,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    policy: NewFilePolicy,
    retries: u32,
    retry_interval: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        policy: NewFilePolicy,
        retries: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            policy,
            retries,
            retry_interval: PERSIST_RETRY_INTERVAL,
            shutdown,
        }
    }

    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Applies `op`. Only shutdown makes this fail.
    pub async fn apply(&self, op: &FileOperation) -> IndexerResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.persist(op) {
                Ok(()) => {
                    debug!(cid = op.cid(), kind = op.kind(), "Persisted file operation");
                    if !matches!(op, FileOperation::Delete { .. }) {
                        metrics::record_file_persisted();
                    }
                    return Ok(());
                }
                Err(error) => {
                    attempt += 1;
                    warn!(%error, cid = op.cid(), kind = op.kind(), attempt, "Failed to persist file operation");
                    if attempt >= self.retries {
                        self.dead_letter(op.cid());
                        return Ok(());
                    }
                }
            }

            tokio::select! {
                () = self.shutdown.cancelled() => return Err(IndexerError::Terminated),
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    fn persist(&self, op: &FileOperation) -> StoreResult<()> {
        match op {
            FileOperation::New(file) => {
                match self.policy {
                    NewFilePolicy::KeepExisting => {
                        if !self.store.insert_file(file.clone())? {
                            debug!(cid = %file.cid, "File already stored, keeping existing row");
                        }
                        Ok(())
                    }
                    NewFilePolicy::Overwrite => self.store.upsert_file(file.clone()),
                }
            }
            FileOperation::UpdateBase(file) => self.store.update_file_base(file.clone()),
            FileOperation::UpdateReplicas(file) => self.store.update_replicas(file.clone()),
            FileOperation::Delete { cid } => {
                if !self.store.delete_file(cid)? {
                    debug!(cid, "File already absent");
                }
                Ok(())
            }
        }
    }

    fn dead_letter(&self, cid: &str) {
        let record = ErrorRecord {
            cid: cid.to_string(),
            key: storage_key::file_key(cid).to_string(),
        };
        metrics::record_dead_letter();
        match self.store.save_error(record) {
            Ok(_) => critical!(cid, "File operation dead-lettered after exhausting retries"),
            Err(error) => critical!(%error, cid, "Failed to dead-letter file operation"),
        }
    }
}
