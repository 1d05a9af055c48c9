#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Sled error")]
    SledError(#[source] std::io::Error),
    #[error("Bincode error")]
    BincodeError(#[source] bincode::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
