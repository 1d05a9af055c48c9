use crate::{
    error::{
        StoreError,
        StoreResult,
    },
    records::{
        ErrorRecord,
        FileRecord,
        GroupTotals,
        SworkerGroup,
        WorkReport,
    },
};

use std::{
    collections::{
        BTreeMap,
        HashMap,
        HashSet,
    },
    path::Path,
};

use bincode::{
    deserialize as de,
    serialize as ser,
};
use parking_lot::Mutex;
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use tracing::{
    debug,
    info,
};

const LIVE_BLOCK_KEY: &[u8] = b"live_block";
const SEGMENT_KEY_PREFIX: &[u8] = b"segment:";
const NEXT_FILE_ID_KEY: &[u8] = b"next_file_id";

/// Persistence boundary used by the indexer.
///
/// Every write may be replayed after a crash, so implementations must treat
/// repeated calls with the same arguments as no-ops.
pub trait Store: Send + Sync {
    /// Returns the cursor persisted for the segment ending at `end`, creating
    /// it with `default` when absent. The cursor is the next height the
    /// segment has to process; a finished segment holds `end`.
    fn segment_cursor_or_init(&self, end: u64, default: u64) -> StoreResult<u64>;
    fn update_segment_cursor(&self, end: u64, cursor: u64) -> StoreResult<()>;

    /// Returns the live listener's block number, creating it with `default`
    /// when absent.
    fn block_number_or_init(&self, default: u64) -> StoreResult<u64>;
    fn update_block_number(&self, block: u64) -> StoreResult<()>;

    /// Inserts `file` only if its cid is unknown. Returns whether a row was written.
    fn insert_file(&self, file: FileRecord) -> StoreResult<bool>;
    /// Inserts `file`, replacing any existing row with the same cid.
    fn upsert_file(&self, file: FileRecord) -> StoreResult<()>;
    /// Replaces the scalar columns of an existing file, inserting it when absent.
    fn update_file_base(&self, file: FileRecord) -> StoreResult<()>;
    /// Replaces the replica set and reported replica count of a file,
    /// inserting the full record when absent.
    fn update_replicas(&self, file: FileRecord) -> StoreResult<()>;
    /// Removes a file and its replicas. Returns whether anything was removed.
    fn delete_file(&self, cid: &str) -> StoreResult<bool>;
    fn file(&self, cid: &str) -> StoreResult<Option<FileRecord>>;

    /// Records a dead-lettered cid. Returns `false` if it was already recorded.
    fn save_error(&self, record: ErrorRecord) -> StoreResult<bool>;
    fn errors(&self) -> StoreResult<Vec<ErrorRecord>>;

    fn replace_work_reports(&self, reports: Vec<WorkReport>) -> StoreResult<()>;
    fn work_reports(&self) -> StoreResult<Vec<WorkReport>>;
    /// Aggregates the stored work reports of `anchors`. Unknown anchors are skipped.
    fn group_totals(&self, anchors: &[String]) -> StoreResult<GroupTotals>;
    fn replace_groups(&self, groups: Vec<SworkerGroup>) -> StoreResult<()>;
    fn groups(&self) -> StoreResult<Vec<SworkerGroup>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Table {
    Files,
    Errors,
    Checkpoints,
    WorkReports,
    Groups,
    Meta,
}

impl Table {
    const ALL: [Self; 6] = [
        Self::Files,
        Self::Errors,
        Self::Checkpoints,
        Self::WorkReports,
        Self::Groups,
        Self::Meta,
    ];

    fn tree_name(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Errors => "errors",
            Self::Checkpoints => "checkpoints",
            Self::WorkReports => "work_reports",
            Self::Groups => "groups",
            Self::Meta => "meta",
        }
    }
}

/// Storage backend for the stats store.
/// Supports both in-memory (ephemeral) and persistent (sled) storage.
enum StoreBackend {
    /// Ordered byte maps, one per table. Data is lost when the store is dropped.
    InMemory {
        tables: HashMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>,
    },
    /// One sled tree per table. Data survives restarts.
    Sled {
        db: Box<sled::Db>,
        trees: HashMap<Table, sled::Tree>,
    },
}

impl StoreBackend {
    fn new_in_memory() -> Self {
        Self::InMemory {
            tables: Table::ALL
                .into_iter()
                .map(|table| (table, BTreeMap::new()))
                .collect(),
        }
    }

    fn new_sled(db: sled::Db) -> StoreResult<Self> {
        let mut trees = HashMap::new();
        for table in Table::ALL {
            let tree = db
                .open_tree(table.tree_name())
                .map_err(StoreError::SledError)?;
            trees.insert(table, tree);
        }
        Ok(Self::Sled {
            db: Box::new(db),
            trees,
        })
    }

    fn get(&self, table: Table, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self {
            Self::InMemory { tables } => Ok(tables.get(&table).and_then(|t| t.get(key)).cloned()),
            Self::Sled { trees, .. } => {
                let Some(tree) = trees.get(&table) else {
                    return Ok(None);
                };
                Ok(tree
                    .get(key)
                    .map_err(StoreError::SledError)?
                    .map(|value| value.to_vec()))
            }
        }
    }

    fn insert(&mut self, table: Table, key: &[u8], value: Vec<u8>) -> StoreResult<()> {
        match self {
            Self::InMemory { tables } => {
                tables.entry(table).or_default().insert(key.to_vec(), value);
                Ok(())
            }
            Self::Sled { trees, .. } => {
                if let Some(tree) = trees.get(&table) {
                    tree.insert(key, value).map_err(StoreError::SledError)?;
                }
                Ok(())
            }
        }
    }

    fn remove(&mut self, table: Table, key: &[u8]) -> StoreResult<bool> {
        match self {
            Self::InMemory { tables } => {
                Ok(tables
                    .get_mut(&table)
                    .and_then(|t| t.remove(key))
                    .is_some())
            }
            Self::Sled { trees, .. } => {
                let Some(tree) = trees.get(&table) else {
                    return Ok(false);
                };
                Ok(tree.remove(key).map_err(StoreError::SledError)?.is_some())
            }
        }
    }

    fn values(&self, table: Table) -> StoreResult<Vec<Vec<u8>>> {
        match self {
            Self::InMemory { tables } => {
                Ok(tables
                    .get(&table)
                    .map(|t| t.values().cloned().collect())
                    .unwrap_or_default())
            }
            Self::Sled { trees, .. } => {
                let Some(tree) = trees.get(&table) else {
                    return Ok(Vec::new());
                };
                tree.iter()
                    .map(|entry| {
                        entry
                            .map(|(_, value)| value.to_vec())
                            .map_err(StoreError::SledError)
                    })
                    .collect()
            }
        }
    }

    fn clear(&mut self, table: Table) -> StoreResult<()> {
        match self {
            Self::InMemory { tables } => {
                if let Some(t) = tables.get_mut(&table) {
                    t.clear();
                }
                Ok(())
            }
            Self::Sled { trees, .. } => {
                let Some(tree) = trees.get(&table) else {
                    return Ok(());
                };
                let keys = tree
                    .iter()
                    .map(|entry| entry.map(|(key, _)| key))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::SledError)?;
                for key in keys {
                    tree.remove(key).map_err(StoreError::SledError)?;
                }
                Ok(())
            }
        }
    }

    fn flush(&self) -> StoreResult<()> {
        match self {
            Self::InMemory { .. } => Ok(()),
            Self::Sled { db, .. } => {
                db.flush().map_err(StoreError::SledError)?;
                Ok(())
            }
        }
    }

    fn read<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> StoreResult<Option<T>> {
        self.get(table, key)?
            .map(|bytes| de(&bytes))
            .transpose()
            .map_err(StoreError::BincodeError)
    }

    fn write<T: Serialize>(&mut self, table: Table, key: &[u8], value: &T) -> StoreResult<()> {
        let bytes = ser(value).map_err(StoreError::BincodeError)?;
        self.insert(table, key, bytes)
    }

    fn read_all<T: DeserializeOwned>(&self, table: Table) -> StoreResult<Vec<T>> {
        self.values(table)?
            .iter()
            .map(|bytes| de(bytes).map_err(StoreError::BincodeError))
            .collect()
    }

    fn next_file_id(&mut self) -> StoreResult<u64> {
        let next = self.read::<u64>(Table::Meta, NEXT_FILE_ID_KEY)?.unwrap_or(1);
        self.write(Table::Meta, NEXT_FILE_ID_KEY, &(next + 1))?;
        Ok(next)
    }

    /// Writes `file` under a freshly allocated id.
    fn insert_new_file(&mut self, mut file: FileRecord) -> StoreResult<()> {
        let id = self.next_file_id()?;
        file.assign_id(id);
        self.write(Table::Files, file.cid.as_bytes(), &file)
    }
}

fn segment_key(end: u64) -> Vec<u8> {
    let mut key = SEGMENT_KEY_PREFIX.to_vec();
    key.extend_from_slice(&end.to_be_bytes());
    key
}

/// [`Store`] implementation over [`StoreBackend`].
///
/// All operations take one lock, so every trait method is atomic with respect
/// to the others.
pub struct StatsStore {
    backend: Mutex<StoreBackend>,
}

impl StatsStore {
    pub fn new_in_memory() -> Self {
        Self {
            backend: Mutex::new(StoreBackend::new_in_memory()),
        }
    }

    pub fn new(db: sled::Db) -> StoreResult<Self> {
        Ok(Self {
            backend: Mutex::new(StoreBackend::new_sled(db)?),
        })
    }

    /// Opens (or creates) a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .open()
            .map_err(StoreError::SledError)?;
        info!(db_path = ?path.as_ref(), "Opened persistent stats store");
        Self::new(db)
    }

    /// Forces pending writes to disk. A no-op for the in-memory backend.
    pub fn flush(&self) -> StoreResult<()> {
        self.backend.lock().flush()
    }
}

impl Store for StatsStore {
    fn segment_cursor_or_init(&self, end: u64, default: u64) -> StoreResult<u64> {
        let mut backend = self.backend.lock();
        let key = segment_key(end);
        if let Some(cursor) = backend.read::<u64>(Table::Checkpoints, &key)? {
            return Ok(cursor);
        }
        backend.write(Table::Checkpoints, &key, &default)?;
        Ok(default)
    }

    fn update_segment_cursor(&self, end: u64, cursor: u64) -> StoreResult<()> {
        self.backend
            .lock()
            .write(Table::Checkpoints, &segment_key(end), &cursor)
    }

    fn block_number_or_init(&self, default: u64) -> StoreResult<u64> {
        let mut backend = self.backend.lock();
        if let Some(block) = backend.read::<u64>(Table::Checkpoints, LIVE_BLOCK_KEY)? {
            return Ok(block);
        }
        backend.write(Table::Checkpoints, LIVE_BLOCK_KEY, &default)?;
        Ok(default)
    }

    fn update_block_number(&self, block: u64) -> StoreResult<()> {
        self.backend
            .lock()
            .write(Table::Checkpoints, LIVE_BLOCK_KEY, &block)
    }

    fn insert_file(&self, file: FileRecord) -> StoreResult<bool> {
        let mut backend = self.backend.lock();
        if backend.get(Table::Files, file.cid.as_bytes())?.is_some() {
            debug!(cid = %file.cid, "File already stored, skipping insert");
            return Ok(false);
        }
        backend.insert_new_file(file)?;
        Ok(true)
    }

    fn upsert_file(&self, mut file: FileRecord) -> StoreResult<()> {
        let mut backend = self.backend.lock();
        match backend.read::<FileRecord>(Table::Files, file.cid.as_bytes())? {
            Some(existing) => {
                file.assign_id(existing.id);
                backend.write(Table::Files, file.cid.as_bytes(), &file)
            }
            None => backend.insert_new_file(file),
        }
    }

    fn update_file_base(&self, file: FileRecord) -> StoreResult<()> {
        let mut backend = self.backend.lock();
        match backend.read::<FileRecord>(Table::Files, file.cid.as_bytes())? {
            Some(mut existing) => {
                existing.apply_base(&file);
                backend.write(Table::Files, existing.cid.as_bytes(), &existing)
            }
            None => backend.insert_new_file(file),
        }
    }

    fn update_replicas(&self, file: FileRecord) -> StoreResult<()> {
        let mut backend = self.backend.lock();
        match backend.read::<FileRecord>(Table::Files, file.cid.as_bytes())? {
            Some(mut existing) => {
                existing.replicas = file.replicas;
                existing.reported_replica_count = file.reported_replica_count;
                let id = existing.id;
                existing.assign_id(id);
                backend.write(Table::Files, existing.cid.as_bytes(), &existing)
            }
            None => backend.insert_new_file(file),
        }
    }

    fn delete_file(&self, cid: &str) -> StoreResult<bool> {
        self.backend.lock().remove(Table::Files, cid.as_bytes())
    }

    fn file(&self, cid: &str) -> StoreResult<Option<FileRecord>> {
        self.backend.lock().read(Table::Files, cid.as_bytes())
    }

    fn save_error(&self, record: ErrorRecord) -> StoreResult<bool> {
        let mut backend = self.backend.lock();
        if backend.get(Table::Errors, record.cid.as_bytes())?.is_some() {
            return Ok(false);
        }
        backend.write(Table::Errors, record.cid.as_bytes(), &record)?;
        Ok(true)
    }

    fn errors(&self) -> StoreResult<Vec<ErrorRecord>> {
        self.backend.lock().read_all(Table::Errors)
    }

    fn replace_work_reports(&self, reports: Vec<WorkReport>) -> StoreResult<()> {
        let mut backend = self.backend.lock();
        backend.clear(Table::WorkReports)?;
        for report in &reports {
            backend.write(Table::WorkReports, report.anchor.as_bytes(), report)?;
        }
        Ok(())
    }

    fn work_reports(&self) -> StoreResult<Vec<WorkReport>> {
        self.backend.lock().read_all(Table::WorkReports)
    }

    fn group_totals(&self, anchors: &[String]) -> StoreResult<GroupTotals> {
        let backend = self.backend.lock();
        let mut totals = GroupTotals::default();
        let unique: HashSet<&String> = anchors.iter().collect();
        for anchor in unique {
            if let Some(report) = backend.read::<WorkReport>(Table::WorkReports, anchor.as_bytes())? {
                totals.add(&report);
            }
        }
        Ok(totals)
    }

    fn replace_groups(&self, groups: Vec<SworkerGroup>) -> StoreResult<()> {
        let mut backend = self.backend.lock();
        backend.clear(Table::Groups)?;
        for group in &groups {
            backend.write(Table::Groups, group.group_id.as_bytes(), group)?;
        }
        Ok(())
    }

    fn groups(&self) -> StoreResult<Vec<SworkerGroup>> {
        self.backend.lock().read_all(Table::Groups)
    }
}
