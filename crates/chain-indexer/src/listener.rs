//! Follows finalized blocks once backfill is done.
//!
//! The listener keeps a single forward cursor. A block is processed only when
//! it is at least `confirmations` blocks behind the finalized head, and the
//! cursor never skips a block: any failed chain request retries the same
//! height after `rpc_retry`.

use crate::{
    backfill::BackfillCompletion,
    config::Config,
    connection::{
        Connection,
        StorageFile,
    },
    critical,
    decoder::{
        ChainEvent,
        EventRecord,
        ReplicaSource,
    },
    dispatcher::{
        Dispatcher,
        FileOperation,
        NewFilePolicy,
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
    primitives::{
        BlockHash,
        SignedBlock,
    },
    rpc::RpcResult,
};

use stats_store::Store;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
};
use tracing::{
    debug,
    info,
    warn,
};

/// What a block does to a cid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    New,
    Update,
    UpdateReplicas,
    Delete,
}

/// Whether `current` is final and deep enough to be processed.
pub fn ready_to_process(current: u64, finalized: u64, confirmations: u64) -> bool {
    current <= finalized && finalized - current >= confirmations
}

/// Operations derived from one block.
#[derive(Debug, Default)]
pub struct BlockOperations {
    pub operations: Vec<FileOperation>,
    pub code_updated: bool,
}

pub struct Listener {
    conn: Arc<Connection>,
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    completion: BackfillCompletion,
}

impl Listener {
    pub fn new(
        conn: Arc<Connection>,
        store: Arc<dyn Store>,
        config: Arc<Config>,
        completion: BackfillCompletion,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            store.clone(),
            NewFilePolicy::Overwrite,
            config.persist_retries,
            conn.shutdown().clone(),
        )
        .with_retry_interval(config.persist_retry);
        Self {
            conn,
            store,
            dispatcher,
            config,
            completion,
        }
    }

    fn replica_source(&self) -> ReplicaSource {
        if self.config.use_market_update {
            ReplicaSource::Market
        } else {
            ReplicaSource::Swork
        }
    }

    /// Waits for backfill, then follows the chain until shutdown.
    pub async fn run(self) -> IndexerResult<()> {
        tokio::select! {
            () = self.conn.shutdown().cancelled() => return Err(IndexerError::Terminated),
            () = self.completion.wait() => {}
        }

        let stored = self.store.block_number_or_init(0)?;
        let mut current = if stored == 0 {
            self.config.start_block + 1
        } else {
            stored
        };
        let confirmations = self.config.confirmations;
        info!(current, confirmations, "Listener started");

        let mut finalized: Option<u64> = None;
        // The shared snapshot was fetched at the best block; the first block
        // processed has to be decoded with its own metadata.
        let mut metadata_loaded = false;
        loop {
            if self.conn.shutdown().is_cancelled() {
                return Err(IndexerError::Terminated);
            }

            let stale = finalized.is_none_or(|f| !ready_to_process(current, f, confirmations));
            if stale {
                match self.conn.finalized_header().await {
                    Ok(header) => finalized = Some(header.number),
                    Err(error) => {
                        self.retry_later(&error, current, "finalized header").await?;
                        continue;
                    }
                }
            }
            let Some(finalized_number) = finalized else {
                continue;
            };
            if !ready_to_process(current, finalized_number, confirmations) {
                debug!(current, finalized = finalized_number, confirmations, "Block not ready");
                self.conn.pause(self.config.rpc_retry).await?;
                continue;
            }

            let hash = match self.conn.block_hash(current).await {
                Ok(hash) => hash,
                Err(error) => {
                    self.retry_later(&error, current, "block hash").await?;
                    continue;
                }
            };

            if !metadata_loaded {
                self.load_metadata(current, hash).await?;
                debug!(number = current, %hash, "Loaded metadata of first live block");
                metadata_loaded = true;
            }

            let block = match self.collect_operations(current, hash).await {
                Ok(block) => block,
                Err(error) => {
                    self.retry_later(&error, current, "block contents").await?;
                    continue;
                }
            };

            info!(number = current, operations = block.operations.len(), "Processing block");
            for op in &block.operations {
                self.dispatcher.apply(op).await?;
            }
            if block.code_updated {
                self.load_metadata(current, hash).await?;
                info!(number = current, %hash, "Runtime upgraded, metadata refreshed");
            }

            if let Err(error) = self.store.update_block_number(current) {
                critical!(%error, number = current, "Failed to write live block checkpoint");
            }
            metrics::record_block_processed(BlockSource::Live, current);
            current += 1;
        }
    }

    async fn retry_later(
        &self,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        number: u64,
        what: &'static str,
    ) -> IndexerResult<()> {
        metrics::record_rpc_retry();
        warn!(%error, number, what, "Chain request failed, retrying block");
        self.conn.pause(self.config.rpc_retry).await
    }

    /// Swaps the shared snapshot for the metadata at `hash`, retrying until it
    /// is fetched or shutdown.
    async fn load_metadata(&self, number: u64, hash: BlockHash) -> IndexerResult<()> {
        loop {
            match self.conn.update_metadata(hash).await {
                Ok(_) => return Ok(()),
                Err(error) => self.retry_later(&error, number, "metadata").await?,
            }
        }
    }

    /// Reads and classifies the events of block `number`, resolving every cid
    /// that needs a file entry at `hash`.
    pub async fn collect_operations(&self, number: u64, hash: BlockHash) -> RpcResult<BlockOperations> {
        let metadata = self.conn.metadata();
        let events = match self.conn.events(&metadata, hash).await {
            Ok(events) => events,
            Err(ChainError::Rpc(error)) => return Err(error),
            Err(ChainError::Decode(error)) => {
                warn!(%error, number, "Skipping events of undecodable block");
                Vec::new()
            }
        };

        let actions = self.classify(number, hash, &events).await?;
        let lookups: Vec<String> = actions
            .iter()
            .filter(|(_, action)| **action != FileAction::Delete)
            .map(|(cid, _)| cid.clone())
            .collect();
        let files: HashMap<String, StorageFile> = if lookups.is_empty() {
            HashMap::new()
        } else {
            self.conn
                .files_at(&lookups, hash)
                .await?
                .into_iter()
                .map(|file| (file.cid.clone(), file))
                .collect()
        };

        let network_id = self.config.network_id;
        let mut operations = Vec::with_capacity(actions.len());
        for (cid, action) in actions {
            let op = match (action, files.get(&cid)) {
                (FileAction::Delete, _) => FileOperation::Delete { cid },
                (FileAction::New, Some(file)) => {
                    FileOperation::New(to_file_record(&cid, &file.info, Some(number), network_id))
                }
                (FileAction::Update, Some(file)) => {
                    FileOperation::UpdateBase(to_file_record(&cid, &file.info, None, network_id))
                }
                (FileAction::UpdateReplicas, Some(file)) => {
                    FileOperation::UpdateReplicas(to_file_record(&cid, &file.info, None, network_id))
                }
                (action, None) => {
                    debug!(%cid, ?action, number, "File not on chain, skipping");
                    continue;
                }
            };
            operations.push(op);
        }

        Ok(BlockOperations {
            operations,
            code_updated: events.iter().any(|record| record.event == ChainEvent::CodeUpdated),
        })
    }

    /// Maps the events of a block to one action per cid.
    ///
    /// Categories are applied in a fixed order and later ones win: renewals,
    /// then replica updates, then new files, then closures.
    async fn classify(
        &self,
        number: u64,
        hash: BlockHash,
        events: &[EventRecord],
    ) -> RpcResult<BTreeMap<String, FileAction>> {
        let mut actions = BTreeMap::new();

        for record in events {
            if let ChainEvent::RenewFileSuccess { cid } = &record.event
                && let Some(cid) = cid_string(cid, number)
            {
                actions.entry(cid).or_insert(FileAction::Update);
            }
        }

        let source = self.replica_source();
        let mut block: Option<SignedBlock> = None;
        for record in events {
            let index = match (&record.event, source) {
                (ChainEvent::UpdateReplicasSuccess { extrinsic }, ReplicaSource::Market)
                | (ChainEvent::WorksReportSuccess { extrinsic }, ReplicaSource::Swork) => *extrinsic,
                _ => continue,
            };
            if block.is_none() {
                block = Some(self.conn.block(hash).await?);
            }
            let Some(signed) = &block else {
                continue;
            };
            match self.conn.replica_update_cids(signed, index, source) {
                Ok(cids) => {
                    for cid in cids.iter().filter_map(|cid| cid_string(cid, number)) {
                        actions.insert(cid, FileAction::UpdateReplicas);
                    }
                }
                Err(error) => warn!(%error, number, extrinsic = index, "Skipping undecodable replica update"),
            }
        }

        for record in events {
            if let ChainEvent::FileSuccess { cid } = &record.event
                && let Some(cid) = cid_string(cid, number)
            {
                actions.insert(cid, FileAction::New);
            }
        }
        for record in events {
            if let ChainEvent::IllegalFileClosed { cid } = &record.event
                && let Some(cid) = cid_string(cid, number)
            {
                actions.insert(cid, FileAction::Delete);
            }
        }
        for record in events {
            if let ChainEvent::FileClosed { cid } = &record.event
                && let Some(cid) = cid_string(cid, number)
            {
                actions.insert(cid, FileAction::Delete);
            }
        }

        Ok(actions)
    }
}

fn cid_string(raw: &[u8], number: u64) -> Option<String> {
    match std::str::from_utf8(raw) {
        Ok(cid) => Some(cid.to_string()),
        Err(_) => {
            warn!(number, "Dropping non UTF-8 cid");
            None
        }
    }
}
