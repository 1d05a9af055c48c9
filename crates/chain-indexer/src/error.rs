use crate::{
    connection::ConnectionError,
    decoder::DecodeError,
    rpc::RpcError,
};
use stats_store::StoreError;

/// Failure of a single chain read. RPC failures are transient and retried,
/// decode failures skip the unit being read.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Shutdown was observed. Not an error condition for the operator.
    #[error("terminated")]
    Terminated,
    #[error("chain connection failed")]
    Connection(#[source] ConnectionError),
    #[error("store error")]
    Store(#[source] StoreError),
}

impl From<StoreError> for IndexerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ConnectionError> for IndexerError {
    fn from(value: ConnectionError) -> Self {
        Self::Connection(value)
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;

/// Failure of a periodic storage scan. The scan is abandoned and retried on
/// the next tick.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{0} is not set on chain")]
    Missing(&'static str),
    #[error("store error")]
    Store(#[source] StoreError),
}

impl From<StoreError> for SnapshotError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}
