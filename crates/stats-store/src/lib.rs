#![doc = include_str!("../README.md")]
#![allow(clippy::missing_errors_doc)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod error;
mod records;
mod store;

pub use error::{
    StoreError,
    StoreResult,
};
pub use records::{
    ErrorRecord,
    FileRecord,
    GroupTotals,
    ReplicaRecord,
    SworkerGroup,
    WorkReport,
};
pub use store::{
    StatsStore,
    Store,
};
