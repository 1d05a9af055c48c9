//! In-process stand-in for a node.
//!
//! Block `n` has hash [`MockChain::hash_of`]`(n)`, so numbers can be read back
//! from hashes. Storage is global unless written for a specific block, in
//! which case the per-block value wins at that block only.

use crate::{
    connection::MetadataSnapshot,
    decoder::{
        DecodeError,
        EventDecoder,
        EventRecord,
        FileInfoV2,
        ReplicaSource,
        ScaleDecoder,
        decode_storage,
    },
    primitives::{
        Block,
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

use async_trait::async_trait;
use parity_scale_codec::Encode;
use parking_lot::Mutex;
use std::collections::{
    BTreeMap,
    BTreeSet,
    HashMap,
};

const HASH_FILL: u8 = 0x11;
const DEFAULT_METADATA: &[u8] = b"runtime-v1";

#[derive(Default)]
struct ChainState {
    head: u64,
    finalized: Option<u64>,
    storage: BTreeMap<StorageKey, Vec<u8>>,
    storage_at: HashMap<BlockHash, BTreeMap<StorageKey, Vec<u8>>>,
    metadata: HashMap<BlockHash, Vec<u8>>,
    extrinsics: HashMap<BlockHash, Vec<Bytes>>,
    fail_next: u32,
    echo_start_key: bool,
    block_hash_requests: Vec<u64>,
    metadata_requests: Vec<BlockHash>,
    query_storage_calls: usize,
}

impl ChainState {
    fn lookup(&self, key: &StorageKey, at: BlockHash) -> Option<Vec<u8>> {
        self.storage_at
            .get(&at)
            .and_then(|storage| storage.get(key))
            .or_else(|| self.storage.get(key))
            .cloned()
    }
}

#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash_of(&self, number: u64) -> BlockHash {
        let mut hash = [HASH_FILL; 32];
        hash[..8].copy_from_slice(&number.to_be_bytes());
        BlockHash(hash)
    }

    fn number_of(hash: BlockHash) -> u64 {
        let mut number = [0u8; 8];
        number.copy_from_slice(&hash.0[..8]);
        u64::from_be_bytes(number)
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    /// Finalized head. Defaults to the best block.
    pub fn set_finalized(&self, number: u64) {
        self.state.lock().finalized = Some(number);
    }

    pub fn set_metadata(&self, at: BlockHash, bytes: Vec<u8>) {
        self.state.lock().metadata.insert(at, bytes);
    }

    /// Fails the next `n` requests of any kind.
    pub fn fail_next_calls(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Makes `state_getKeysPaged` include `start_key` itself, as some nodes do.
    pub fn echo_start_key(&self, echo: bool) {
        self.state.lock().echo_start_key = echo;
    }

    pub fn put_storage(&self, key: StorageKey, value: Vec<u8>) {
        self.state.lock().storage.insert(key, value);
    }

    pub fn put_storage_at(&self, number: u64, key: StorageKey, value: Vec<u8>) {
        let at = self.hash_of(number);
        self.state
            .lock()
            .storage_at
            .entry(at)
            .or_default()
            .insert(key, value);
    }

    pub fn put_events(&self, number: u64, events: Vec<EventRecord>) {
        self.put_storage_at(number, storage_key::events_key(), events.encode());
    }

    pub fn put_file(&self, cid: &str, info: &FileInfoV2) {
        self.put_storage(storage_key::file_key(cid), info.encode());
    }

    pub fn put_file_at(&self, number: u64, cid: &str, info: &FileInfoV2) {
        self.put_storage_at(number, storage_key::file_key(cid), info.encode());
    }

    pub fn put_extrinsics(&self, number: u64, extrinsics: Vec<Vec<u8>>) {
        let at = self.hash_of(number);
        self.state
            .lock()
            .extrinsics
            .insert(at, extrinsics.into_iter().map(Bytes).collect());
    }

    pub fn block_hash_requests(&self) -> Vec<u64> {
        self.state.lock().block_hash_requests.clone()
    }

    pub fn metadata_requests(&self) -> Vec<BlockHash> {
        self.state.lock().metadata_requests.clone()
    }

    pub fn query_storage_calls(&self) -> usize {
        self.state.lock().query_storage_calls
    }

    fn injected_failure(&self) -> RpcResult<()> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RpcError::Unexpected("injected failure".to_string()));
        }
        Ok(())
    }

    fn header_of(&self, number: u64) -> Header {
        Header {
            parent_hash: self.hash_of(number.saturating_sub(1)),
            number,
        }
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn block_hash(&self, number: u64) -> RpcResult<Option<BlockHash>> {
        self.injected_failure()?;
        let head = {
            let mut state = self.state.lock();
            state.block_hash_requests.push(number);
            state.head
        };
        Ok((number <= head).then(|| self.hash_of(number)))
    }

    async fn best_hash(&self) -> RpcResult<BlockHash> {
        self.injected_failure()?;
        let head = self.state.lock().head;
        Ok(self.hash_of(head))
    }

    async fn metadata(&self, at: BlockHash) -> RpcResult<Bytes> {
        self.injected_failure()?;
        let mut state = self.state.lock();
        state.metadata_requests.push(at);
        let bytes = state
            .metadata
            .get(&at)
            .cloned()
            .unwrap_or_else(|| DEFAULT_METADATA.to_vec());
        Ok(Bytes(bytes))
    }

    async fn storage(&self, key: &StorageKey, at: BlockHash) -> RpcResult<Option<Bytes>> {
        self.injected_failure()?;
        Ok(self.state.lock().lookup(key, at).map(Bytes))
    }

    async fn query_storage_at(
        &self,
        keys: &[StorageKey],
        at: BlockHash,
    ) -> RpcResult<Vec<StorageChangeSet>> {
        self.injected_failure()?;
        let mut state = self.state.lock();
        state.query_storage_calls += 1;
        let changes = keys
            .iter()
            .map(|key| (key.clone(), state.lookup(key, at).map(Bytes)))
            .collect();
        Ok(vec![StorageChangeSet { block: at, changes }])
    }

    async fn keys_paged(
        &self,
        prefix: &StorageKey,
        count: u32,
        start_key: Option<&StorageKey>,
        at: BlockHash,
    ) -> RpcResult<Vec<StorageKey>> {
        self.injected_failure()?;
        let state = self.state.lock();
        let mut keys: BTreeSet<&StorageKey> = state.storage.keys().collect();
        if let Some(storage) = state.storage_at.get(&at) {
            keys.extend(storage.keys());
        }

        Ok(keys
            .into_iter()
            .filter(|key| key.starts_with(prefix.as_slice()))
            .filter(|key| {
                match start_key {
                    Some(start) if state.echo_start_key => *key >= start,
                    Some(start) => *key > start,
                    None => true,
                }
            })
            .take(count as usize)
            .cloned()
            .collect())
    }

    async fn block(&self, hash: BlockHash) -> RpcResult<Option<SignedBlock>> {
        self.injected_failure()?;
        let number = Self::number_of(hash);
        let state = self.state.lock();
        if number > state.head {
            return Ok(None);
        }
        Ok(Some(SignedBlock {
            block: Block {
                header: self.header_of(number),
                extrinsics: state.extrinsics.get(&hash).cloned().unwrap_or_default(),
            },
        }))
    }

    async fn finalized_head(&self) -> RpcResult<BlockHash> {
        self.injected_failure()?;
        let state = self.state.lock();
        Ok(self.hash_of(state.finalized.unwrap_or(state.head)))
    }

    async fn header(&self, hash: BlockHash) -> RpcResult<Option<Header>> {
        self.injected_failure()?;
        let number = Self::number_of(hash);
        let head = self.state.lock().head;
        Ok((number <= head).then(|| self.header_of(number)))
    }
}

/// Decodes `System.Events` values written by [`MockChain::put_events`] and
/// records which metadata snapshot every decode used.
#[derive(Default)]
pub struct FixtureDecoder {
    snapshots: Mutex<Vec<BlockHash>>,
    extrinsics: ScaleDecoder,
}

impl FixtureDecoder {
    pub fn snapshots(&self) -> Vec<BlockHash> {
        self.snapshots.lock().clone()
    }
}

impl EventDecoder for FixtureDecoder {
    fn decode_events(
        &self,
        raw: &[u8],
        metadata: &MetadataSnapshot,
    ) -> Result<Vec<EventRecord>, DecodeError> {
        self.snapshots.lock().push(metadata.at);
        decode_storage("System.Events", raw)
    }

    fn replica_update_cids(
        &self,
        extrinsic: &[u8],
        source: ReplicaSource,
    ) -> Result<Vec<Vec<u8>>, DecodeError> {
        self.extrinsics.replica_update_cids(extrinsic, source)
    }
}
