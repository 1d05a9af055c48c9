//! Shared gateway to the chain.
//!
//! A [`Connection`] owns the RPC handle, the event decoder, the current
//! metadata snapshot and the shutdown token. It is built once at startup and
//! handed to every component as an `Arc`.

use crate::{
    decoder::{
        DecodeError,
        EventDecoder,
        EventRecord,
        FileInfoV2,
        ReplicaSource,
        decode_storage,
    },
    error::{
        ChainError,
        IndexerError,
        IndexerResult,
    },
    metrics,
    primitives::{
        BlockHash,
        Bytes,
        Header,
        SignedBlock,
        StorageChangeSet,
        StorageKey,
    },
    rpc::{
        ChainRpc,
        RpcError,
        RpcResult,
    },
    storage_key,
};

use parking_lot::RwLock;
use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

/// Keys per `state_queryStorageAt` request when resolving files.
pub const FILE_QUERY_CHUNK: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to chain")]
    Connect(#[source] RpcError),
    #[error("failed to fetch metadata at {at}")]
    Fetch {
        at: BlockHash,
        #[source]
        source: RpcError,
    },
}

/// Runtime metadata as fetched at block `at`. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub at: BlockHash,
    pub bytes: Bytes,
}

/// A `Market.FilesV2` entry resolved by cid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFile {
    pub cid: String,
    pub key: StorageKey,
    pub info: FileInfoV2,
}

pub struct Connection {
    rpc: Arc<dyn ChainRpc>,
    decoder: Arc<dyn EventDecoder>,
    metadata: RwLock<Arc<MetadataSnapshot>>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Fetches the metadata of the best block and builds the connection.
    pub async fn connect(
        rpc: Arc<dyn ChainRpc>,
        decoder: Arc<dyn EventDecoder>,
        shutdown: CancellationToken,
    ) -> Result<Self, ConnectionError> {
        let at = rpc.best_hash().await.map_err(ConnectionError::Connect)?;
        let bytes = rpc.metadata(at).await.map_err(ConnectionError::Connect)?;
        info!(%at, metadata_bytes = bytes.as_slice().len(), "Connected to chain");
        Ok(Self {
            rpc,
            decoder,
            metadata: RwLock::new(Arc::new(MetadataSnapshot { at, bytes })),
            shutdown,
        })
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn rpc(&self) -> &dyn ChainRpc {
        self.rpc.as_ref()
    }

    /// Current snapshot. Readers keep the `Arc` they got even if a newer
    /// snapshot is swapped in meanwhile.
    pub fn metadata(&self) -> Arc<MetadataSnapshot> {
        self.metadata.read().clone()
    }

    /// Fetches the metadata valid at `at` without touching the shared snapshot.
    pub async fn fetch_metadata(&self, at: BlockHash) -> Result<Arc<MetadataSnapshot>, ConnectionError> {
        let bytes = self
            .rpc
            .metadata(at)
            .await
            .map_err(|source| ConnectionError::Fetch { at, source })?;
        Ok(Arc::new(MetadataSnapshot { at, bytes }))
    }

    /// Replaces the shared snapshot with the metadata valid at `at`. The fetch
    /// happens outside the lock.
    pub async fn update_metadata(&self, at: BlockHash) -> Result<Arc<MetadataSnapshot>, ConnectionError> {
        let snapshot = self.fetch_metadata(at).await?;
        *self.metadata.write() = snapshot.clone();
        info!(%at, "Swapped chain metadata");
        Ok(snapshot)
    }

    pub async fn best_hash(&self) -> RpcResult<BlockHash> {
        self.rpc.best_hash().await
    }

    /// Hash and header of the best block.
    pub async fn best_header(&self) -> RpcResult<(BlockHash, Header)> {
        let hash = self.rpc.best_hash().await?;
        let header = self
            .rpc
            .header(hash)
            .await?
            .ok_or_else(|| RpcError::Unexpected(format!("best header {hash} not found")))?;
        Ok((hash, header))
    }

    pub async fn block_hash(&self, number: u64) -> RpcResult<BlockHash> {
        self.rpc
            .block_hash(number)
            .await?
            .ok_or(RpcError::UnknownBlock(number))
    }

    pub async fn events(
        &self,
        metadata: &MetadataSnapshot,
        hash: BlockHash,
    ) -> Result<Vec<EventRecord>, ChainError> {
        let Some(raw) = self.rpc.storage(&storage_key::events_key(), hash).await? else {
            return Ok(Vec::new());
        };
        Ok(self.decoder.decode_events(raw.as_slice(), metadata)?)
    }

    pub async fn storage_at(&self, key: &StorageKey, hash: BlockHash) -> RpcResult<Option<Bytes>> {
        self.rpc.storage(key, hash).await
    }

    pub async fn query_storage_at(
        &self,
        keys: &[StorageKey],
        hash: BlockHash,
    ) -> RpcResult<Vec<StorageChangeSet>> {
        self.rpc.query_storage_at(keys, hash).await
    }

    pub async fn keys_paged(
        &self,
        prefix: &StorageKey,
        count: u32,
        start_key: Option<&StorageKey>,
        hash: BlockHash,
    ) -> RpcResult<Vec<StorageKey>> {
        self.rpc.keys_paged(prefix, count, start_key, hash).await
    }

    pub async fn block(&self, hash: BlockHash) -> RpcResult<SignedBlock> {
        self.rpc
            .block(hash)
            .await?
            .ok_or_else(|| RpcError::Unexpected(format!("block {hash} not found")))
    }

    pub async fn finalized_header(&self) -> RpcResult<Header> {
        let hash = self.rpc.finalized_head().await?;
        self.rpc
            .header(hash)
            .await?
            .ok_or_else(|| RpcError::Unexpected(format!("finalized header {hash} not found")))
    }

    /// Cids updated by extrinsic `index` of `block`.
    pub fn replica_update_cids(
        &self,
        block: &SignedBlock,
        index: u32,
        source: ReplicaSource,
    ) -> Result<Vec<Vec<u8>>, DecodeError> {
        let extrinsic = block
            .block
            .extrinsics
            .get(index as usize)
            .ok_or(DecodeError::Extrinsic("extrinsic index out of range"))?;
        self.decoder.replica_update_cids(extrinsic.as_slice(), source)
    }

    /// Resolves `Market.FilesV2` entries for `cids` at `hash`. Unknown cids
    /// are absent from the result. Entries that fail to decode are logged and
    /// skipped.
    pub async fn files_at(&self, cids: &[String], hash: BlockHash) -> RpcResult<Vec<StorageFile>> {
        let mut files = Vec::with_capacity(cids.len());
        for chunk in cids.chunks(FILE_QUERY_CHUNK) {
            let by_key: HashMap<StorageKey, &String> = chunk
                .iter()
                .map(|cid| (storage_key::file_key(cid), cid))
                .collect();
            let keys: Vec<StorageKey> = by_key.keys().cloned().collect();

            for set in self.rpc.query_storage_at(&keys, hash).await? {
                for (key, value) in set.changes {
                    let (Some(cid), Some(value)) = (by_key.get(&key), value) else {
                        continue;
                    };
                    match decode_storage::<FileInfoV2>("Market.FilesV2", value.as_slice()) {
                        Ok(info) => {
                            files.push(StorageFile {
                                cid: (*cid).clone(),
                                key,
                                info,
                            });
                        }
                        Err(error) => warn!(%error, cid = %cid, "Skipping undecodable file record"),
                    }
                }
            }
        }
        debug!(requested = cids.len(), resolved = files.len(), %hash, "Resolved files");
        Ok(files)
    }

    /// Sleeps for `duration` unless shutdown fires first.
    pub async fn pause(&self, duration: Duration) -> IndexerResult<()> {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(IndexerError::Terminated),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Runs `op` until it succeeds, sleeping `interval` between attempts.
    /// Only shutdown stops the loop.
    pub async fn retry<T, F, Fut>(&self, what: &'static str, interval: Duration, mut op: F) -> IndexerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        loop {
            let result = tokio::select! {
                () = self.shutdown.cancelled() => return Err(IndexerError::Terminated),
                result = op() => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    metrics::record_rpc_retry();
                    warn!(%error, what, retry_in = ?interval, "Chain request failed, retrying");
                    self.pause(interval).await?;
                }
            }
        }
    }

    /// Like [`Connection::retry`] for metadata fetches.
    pub async fn retry_fetch_metadata(
        &self,
        at: BlockHash,
        interval: Duration,
    ) -> IndexerResult<Arc<MetadataSnapshot>> {
        loop {
            let result = tokio::select! {
                () = self.shutdown.cancelled() => return Err(IndexerError::Terminated),
                result = self.fetch_metadata(at) => result,
            };
            match result {
                Ok(snapshot) => return Ok(snapshot),
                Err(error) => {
                    metrics::record_rpc_retry();
                    warn!(%error, "Metadata fetch failed, retrying");
                    self.pause(interval).await?;
                }
            }
        }
    }
}
