//! The subset of the Substrate JSON-RPC API the indexer consumes.

use crate::primitives::{
    BlockHash,
    Bytes,
    Header,
    SignedBlock,
    StorageChangeSet,
    StorageKey,
};

use async_trait::async_trait;
use jsonrpsee::{
    core::{
        ClientError,
        client::ClientT,
        params::ArrayParams,
    },
    http_client::{
        HttpClient,
        HttpClientBuilder,
    },
    rpc_params,
    ws_client::{
        WsClient,
        WsClientBuilder,
    },
};
use serde::de::DeserializeOwned;
use url::Url;

/// Responses can carry full runtime metadata, which exceeds the client default.
const MAX_RESPONSE_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc client error")]
    Client(#[source] ClientError),
    #[error("invalid rpc endpoint: {0}")]
    InvalidUrl(String),
    #[error("block {0} is not available yet")]
    UnknownBlock(u64),
    #[error("unexpected rpc response: {0}")]
    Unexpected(String),
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Chain RPC boundary. All hashes and keys are raw bytes; hex encoding is a
/// transport concern.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// `chain_getBlockHash(number)`. `None` when the height is beyond the head.
    async fn block_hash(&self, number: u64) -> RpcResult<Option<BlockHash>>;

    /// `chain_getBlockHash()` for the best block.
    async fn best_hash(&self) -> RpcResult<BlockHash>;

    /// `state_getMetadata(at)`, SCALE encoded.
    async fn metadata(&self, at: BlockHash) -> RpcResult<Bytes>;

    /// `state_getStorage(key, at)`.
    async fn storage(&self, key: &StorageKey, at: BlockHash) -> RpcResult<Option<Bytes>>;

    /// `state_queryStorageAt(keys, at)`.
    async fn query_storage_at(
        &self,
        keys: &[StorageKey],
        at: BlockHash,
    ) -> RpcResult<Vec<StorageChangeSet>>;

    /// `state_getKeysPaged(prefix, count, start_key, at)`.
    async fn keys_paged(
        &self,
        prefix: &StorageKey,
        count: u32,
        start_key: Option<&StorageKey>,
        at: BlockHash,
    ) -> RpcResult<Vec<StorageKey>>;

    /// `chain_getBlock(hash)`.
    async fn block(&self, hash: BlockHash) -> RpcResult<Option<SignedBlock>>;

    /// `chain_getFinalizedHead()`.
    async fn finalized_head(&self) -> RpcResult<BlockHash>;

    /// `chain_getHeader(hash)`.
    async fn header(&self, hash: BlockHash) -> RpcResult<Option<Header>>;
}

/// jsonrpsee backed [`ChainRpc`]. The transport follows the URL scheme.
pub enum JsonRpcClient {
    Http(HttpClient),
    Ws(WsClient),
}

impl JsonRpcClient {
    pub async fn connect(endpoint: &str) -> RpcResult<Self> {
        let url = Url::parse(endpoint).map_err(|_| RpcError::InvalidUrl(endpoint.to_string()))?;
        match url.scheme() {
            "http" | "https" => {
                HttpClientBuilder::default()
                    .max_response_size(MAX_RESPONSE_SIZE)
                    .build(endpoint)
                    .map(Self::Http)
                    .map_err(RpcError::Client)
            }
            "ws" | "wss" => {
                WsClientBuilder::default()
                    .max_response_size(MAX_RESPONSE_SIZE)
                    .build(endpoint)
                    .await
                    .map(Self::Ws)
                    .map_err(RpcError::Client)
            }
            _ => Err(RpcError::InvalidUrl(endpoint.to_string())),
        }
    }

    async fn request<R: DeserializeOwned>(&self, method: &str, params: ArrayParams) -> RpcResult<R> {
        match self {
            Self::Http(client) => client.request(method, params).await,
            Self::Ws(client) => client.request(method, params).await,
        }
        .map_err(RpcError::Client)
    }
}

#[async_trait]
impl ChainRpc for JsonRpcClient {
    async fn block_hash(&self, number: u64) -> RpcResult<Option<BlockHash>> {
        self.request("chain_getBlockHash", rpc_params![number]).await
    }

    async fn best_hash(&self) -> RpcResult<BlockHash> {
        self.request::<Option<BlockHash>>("chain_getBlockHash", rpc_params![])
            .await?
            .ok_or_else(|| RpcError::Unexpected("node returned no best block".to_string()))
    }

    async fn metadata(&self, at: BlockHash) -> RpcResult<Bytes> {
        self.request("state_getMetadata", rpc_params![at]).await
    }

    async fn storage(&self, key: &StorageKey, at: BlockHash) -> RpcResult<Option<Bytes>> {
        self.request("state_getStorage", rpc_params![key, at]).await
    }

    async fn query_storage_at(
        &self,
        keys: &[StorageKey],
        at: BlockHash,
    ) -> RpcResult<Vec<StorageChangeSet>> {
        self.request("state_queryStorageAt", rpc_params![keys, at])
            .await
    }

    async fn keys_paged(
        &self,
        prefix: &StorageKey,
        count: u32,
        start_key: Option<&StorageKey>,
        at: BlockHash,
    ) -> RpcResult<Vec<StorageKey>> {
        self.request(
            "state_getKeysPaged",
            rpc_params![prefix, count, start_key, at],
        )
        .await
    }

    async fn block(&self, hash: BlockHash) -> RpcResult<Option<SignedBlock>> {
        self.request("chain_getBlock", rpc_params![hash]).await
    }

    async fn finalized_head(&self) -> RpcResult<BlockHash> {
        self.request("chain_getFinalizedHead", rpc_params![]).await
    }

    async fn header(&self, hash: BlockHash) -> RpcResult<Option<Header>> {
        self.request("chain_getHeader", rpc_params![hash]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unknown_scheme() {
        let result = JsonRpcClient::connect("ftp://localhost:9933").await;
        assert!(matches!(result, Err(RpcError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn rejects_garbage_endpoint() {
        let result = JsonRpcClient::connect("not a url").await;
        assert!(matches!(result, Err(RpcError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn http_client_builds_without_network() {
        let result = JsonRpcClient::connect("http://127.0.0.1:9933").await;
        assert!(matches!(result, Ok(JsonRpcClient::Http(_))));
    }
}
