//! Three-stage pipeline over one backfill segment.
//!
//! ```text
//!  hash stage ──(height, hash)──▶ decode stage ──(height, cids)──▶ persist stage
//! ```
//!
//! Stages are joined by bounded channels, so a slow persist stage throttles
//! the stages feeding it. Heights flow strictly in order. Every height reaches
//! the persist stage, with or without cids, so the checkpoint keeps moving.

use super::Segment;
use crate::{
    config::Config,
    connection::{
        Connection,
        MetadataSnapshot,
    },
    critical,
    decoder::{
        ChainEvent,
        EventRecord,
    },
    dispatcher::{
        Dispatcher,
        FileOperation,
    },
    error::{
        ChainError,
        IndexerError,
        IndexerResult,
    },
    file::to_file_record,
    metrics::{
        self,
        BlockSource,
    },
    primitives::BlockHash,
};

use stats_store::Store;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{
    debug,
    info,
    warn,
};

const STAGE_QUEUE_DEPTH: usize = 10;

/// Longest cid accepted from a `FileSuccess` event.
pub const MAX_CID_LEN: usize = 64;

pub struct SegmentWorker {
    conn: Arc<Connection>,
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
    segment: Segment,
    cursor: u64,
    anchor: BlockHash,
}

impl SegmentWorker {
    /// `cursor` is the first height to process. `anchor` is the block at which
    /// file entries are read.
    pub fn new(
        conn: Arc<Connection>,
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<Config>,
        segment: Segment,
        cursor: u64,
        anchor: BlockHash,
    ) -> Self {
        Self {
            conn,
            store,
            dispatcher,
            config,
            segment,
            cursor,
            anchor,
        }
    }

    pub async fn run(self) -> IndexerResult<()> {
        let Segment { start, end } = self.segment;
        if self.cursor >= end {
            debug!(start, end, cursor = self.cursor, "Segment already done");
            metrics::record_segment_done();
            return Ok(());
        }
        info!(start, end, cursor = self.cursor, "Segment worker started");

        let (hash_tx, hash_rx) = mpsc::channel(STAGE_QUEUE_DEPTH);
        let (cid_tx, cid_rx) = mpsc::channel(STAGE_QUEUE_DEPTH);

        tokio::try_join!(
            self.fetch_hashes(hash_tx),
            self.decode_events(hash_rx, cid_tx),
            self.persist_files(cid_rx),
        )?;

        info!(start, end, "Segment worker done");
        metrics::record_segment_done();
        Ok(())
    }

    async fn fetch_hashes(&self, tx: mpsc::Sender<(u64, BlockHash)>) -> IndexerResult<()> {
        let conn = &self.conn;
        for height in self.cursor..self.segment.end {
            let hash = conn
                .retry("block hash", self.config.hash_retry, move || {
                    conn.block_hash(height)
                })
                .await?;
            self.send(&tx, (height, hash)).await?;
        }
        Ok(())
    }

    async fn decode_events(
        &self,
        mut rx: mpsc::Receiver<(u64, BlockHash)>,
        tx: mpsc::Sender<(u64, Vec<String>)>,
    ) -> IndexerResult<()> {
        let mut metadata: Option<Arc<MetadataSnapshot>> = None;

        while let Some((height, hash)) = self.recv(&mut rx).await? {
            // Decoding starts with the metadata of the first block of the
            // segment and only moves forward on CodeUpdated.
            let snapshot = match &metadata {
                Some(snapshot) => snapshot.clone(),
                None => {
                    let snapshot = self
                        .conn
                        .retry_fetch_metadata(hash, self.config.hash_retry)
                        .await?;
                    metadata = Some(snapshot.clone());
                    snapshot
                }
            };

            let events = self.events(&snapshot, height, hash).await?;
            let cids = file_success_cids(height, &events);
            let code_updated = events
                .iter()
                .any(|record| record.event == ChainEvent::CodeUpdated);

            self.send(&tx, (height, cids)).await?;

            if code_updated {
                info!(height, %hash, "Runtime upgraded, refreshing segment metadata");
                metadata = Some(
                    self.conn
                        .retry_fetch_metadata(hash, self.config.rpc_retry)
                        .await?,
                );
            }
        }
        Ok(())
    }

    async fn events(
        &self,
        snapshot: &MetadataSnapshot,
        height: u64,
        hash: BlockHash,
    ) -> IndexerResult<Vec<EventRecord>> {
        loop {
            match self.conn.events(snapshot, hash).await {
                Ok(events) => return Ok(events),
                Err(ChainError::Decode(error)) => {
                    warn!(%error, height, "Skipping events of undecodable block");
                    return Ok(Vec::new());
                }
                Err(ChainError::Rpc(error)) => {
                    metrics::record_rpc_retry();
                    warn!(%error, height, "Failed to fetch events, retrying");
                    self.conn.pause(self.config.rpc_retry).await?;
                }
            }
        }
    }

    async fn persist_files(&self, mut rx: mpsc::Receiver<(u64, Vec<String>)>) -> IndexerResult<()> {
        let end = self.segment.end;
        let mut next_flush = 0u64;

        while let Some((height, cids)) = self.recv(&mut rx).await? {
            if !cids.is_empty() {
                self.save_files(height, &cids).await?;
            }
            metrics::record_block_processed(BlockSource::Backfill, height);

            // The checkpoint is the next height to process, so a finished
            // segment stores `end`.
            if height >= next_flush || height + 1 == end {
                if let Err(error) = self.store.update_segment_cursor(end, height + 1) {
                    critical!(%error, end, height, "Failed to write segment checkpoint");
                }
                next_flush = height + self.config.checkpoint_stride;
            }
        }
        Ok(())
    }

    async fn save_files(&self, height: u64, cids: &[String]) -> IndexerResult<()> {
        let conn = &self.conn;
        let anchor = self.anchor;
        let files = conn
            .retry("segment files", self.config.rpc_retry, move || {
                conn.files_at(cids, anchor)
            })
            .await?;

        for file in files {
            let record = to_file_record(&file.cid, &file.info, Some(height), self.config.network_id);
            self.dispatcher.apply(&FileOperation::New(record)).await?;
        }
        Ok(())
    }

    async fn send<T>(&self, tx: &mpsc::Sender<T>, value: T) -> IndexerResult<()> {
        tokio::select! {
            () = self.conn.shutdown().cancelled() => Err(IndexerError::Terminated),
            result = tx.send(value) => result.map_err(|_| IndexerError::Terminated),
        }
    }

    async fn recv<T>(&self, rx: &mut mpsc::Receiver<T>) -> IndexerResult<Option<T>> {
        tokio::select! {
            () = self.conn.shutdown().cancelled() => Err(IndexerError::Terminated),
            value = rx.recv() => Ok(value),
        }
    }
}

/// Cids announced by `FileSuccess` events. Oversized or non UTF-8 cids are
/// dropped.
pub fn file_success_cids(height: u64, events: &[EventRecord]) -> Vec<String> {
    events
        .iter()
        .filter_map(|record| {
            match &record.event {
                ChainEvent::FileSuccess { cid } => Some(cid),
                _ => None,
            }
        })
        .filter_map(|cid| {
            if cid.len() > MAX_CID_LEN {
                warn!(height, len = cid.len(), "Dropping oversized cid");
                return None;
            }
            match String::from_utf8(cid.clone()) {
                Ok(cid) => Some(cid),
                Err(_) => {
                    warn!(height, "Dropping non UTF-8 cid");
                    None
                }
            }
        })
        .collect()
}
