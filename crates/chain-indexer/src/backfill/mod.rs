//! Historical backfill.
//!
//! `[0, start_block]` is cut into fixed-size [`Segment`]s. Each segment runs
//! its own [`SegmentWorker`] with a persisted cursor, and all file entries are
//! read at the hash of `start_block` so every segment sees one consistent
//! view of storage. Once every worker is done the [`BackfillCompletion`]
//! signal fires and the listener takes over.

mod segment;

pub use segment::SegmentWorker;

use crate::{
    config::Config,
    connection::Connection,
    critical,
    dispatcher::{
        Dispatcher,
        NewFilePolicy,
    },
    error::{
        IndexerError,
        IndexerResult,
    },
};

use futures::future::join_all;
use stats_store::Store;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{
    debug,
    info,
};

/// Half-open block range `[start, end)` handled by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
}

/// Splits `[0, init_height]` into consecutive segments of `size` blocks. The
/// last segment is clipped to end at `init_height + 1`.
pub fn partition(init_height: u64, size: u64) -> Vec<Segment> {
    let size = size.max(1);
    let mut segments = Vec::new();
    let mut start = 0u64;
    while start <= init_height {
        let end = start.saturating_add(size).min(init_height.saturating_add(1));
        segments.push(Segment { start, end });
        if end == start {
            break;
        }
        start = end;
    }
    segments
}

/// One-shot signal raised when backfill has finished or was skipped.
#[derive(Debug, Clone)]
pub struct BackfillCompletion {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for BackfillCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl BackfillCompletion {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raises the signal. Returns `false` if it was already raised.
    pub fn complete(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|done| *done).await;
    }
}

pub struct Backfill {
    conn: Arc<Connection>,
    store: Arc<dyn Store>,
    config: Arc<Config>,
    completion: BackfillCompletion,
}

impl Backfill {
    pub fn new(
        conn: Arc<Connection>,
        store: Arc<dyn Store>,
        config: Arc<Config>,
        completion: BackfillCompletion,
    ) -> Self {
        Self {
            conn,
            store,
            config,
            completion,
        }
    }

    /// Runs every segment to completion, then raises the completion signal.
    pub async fn run(self) -> IndexerResult<()> {
        let live_block = self.store.block_number_or_init(0)?;
        if live_block > 0 {
            info!(live_block, "Listener already past backfill, skipping");
            self.completion.complete();
            return Ok(());
        }

        let init_height = self.config.start_block;
        let conn = &self.conn;
        let anchor = conn
            .retry("backfill anchor hash", self.config.rpc_retry, || {
                conn.block_hash(init_height)
            })
            .await?;

        let segments = partition(init_height, self.config.segment_size);
        info!(init_height, %anchor, segments = segments.len(), "Starting backfill");

        let dispatcher = Arc::new(
            Dispatcher::new(
                self.store.clone(),
                NewFilePolicy::KeepExisting,
                self.config.persist_retries,
                conn.shutdown().clone(),
            )
            .with_retry_interval(self.config.persist_retry),
        );

        let mut handles = Vec::with_capacity(segments.len());
        for (i, segment) in segments.into_iter().enumerate() {
            if i > 0 && !self.config.segment_stagger.is_zero() {
                conn.pause(self.config.segment_stagger).await?;
            }
            let cursor = self.store.segment_cursor_or_init(segment.end, segment.start)?;
            debug!(start = segment.start, end = segment.end, cursor, "Launching segment worker");
            let worker = SegmentWorker::new(
                conn.clone(),
                self.store.clone(),
                dispatcher.clone(),
                self.config.clone(),
                segment,
                cursor,
                anchor,
            );
            handles.push(tokio::spawn(worker.run()));
        }

        for (i, result) in join_all(handles).await.into_iter().enumerate() {
            match result {
                Ok(Ok(()) | Err(IndexerError::Terminated)) => {}
                Ok(Err(error)) => critical!(%error, segment = i, "Segment worker failed"),
                Err(error) => critical!(%error, segment = i, "Segment worker panicked"),
            }
        }

        if conn.shutdown().is_cancelled() {
            return Err(IndexerError::Terminated);
        }
        info!(init_height, "Backfill complete");
        self.completion.complete();
        Ok(())
    }
}
