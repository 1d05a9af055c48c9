//! Paged enumeration of storage keys under a prefix.

use crate::{
    connection::Connection,
    primitives::{
        BlockHash,
        Bytes,
        StorageKey,
    },
    rpc::RpcResult,
};

/// Walks `state_getKeysPaged` from `prefix` onwards at a fixed block.
///
/// Each request starts at the last key of the previous page. When a page
/// begins with that boundary key it is dropped, and a page holding only the
/// boundary key ends the scan. Pages from nodes that do not echo the
/// boundary key are taken whole.
pub struct KeyPager<'a> {
    conn: &'a Connection,
    prefix: StorageKey,
    page_size: u32,
    start_key: StorageKey,
    at: BlockHash,
    done: bool,
}

impl<'a> KeyPager<'a> {
    pub fn new(conn: &'a Connection, prefix: StorageKey, page_size: u32, at: BlockHash) -> Self {
        Self {
            conn,
            start_key: prefix.clone(),
            prefix,
            page_size,
            at,
            done: false,
        }
    }

    /// Next page of keys, `None` once the prefix is exhausted.
    pub async fn next_page(&mut self) -> RpcResult<Option<Vec<StorageKey>>> {
        if self.done {
            return Ok(None);
        }
        let keys = self
            .conn
            .keys_paged(&self.prefix, self.page_size, Some(&self.start_key), self.at)
            .await?;

        match strip_boundary(&self.start_key, keys) {
            Some(keys) => {
                if let Some(last) = keys.last() {
                    self.start_key = last.clone();
                }
                Ok(Some(keys))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

/// Applies the boundary-key policy to one page. `None` ends the scan.
pub fn strip_boundary(start_key: &StorageKey, mut keys: Vec<StorageKey>) -> Option<Vec<StorageKey>> {
    if keys.first() == Some(start_key) {
        keys.remove(0);
    }
    if keys.is_empty() { None } else { Some(keys) }
}

/// Reads the values of `keys` at `at` in one batch. Unset keys are omitted.
pub async fn values_at(
    conn: &Connection,
    keys: &[StorageKey],
    at: BlockHash,
) -> RpcResult<Vec<(StorageKey, Bytes)>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let sets = conn.query_storage_at(keys, at).await?;
    Ok(sets
        .into_iter()
        .flat_map(|set| set.changes)
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .collect())
}
