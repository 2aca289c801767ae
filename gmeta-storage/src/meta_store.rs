//! LocalMetaStore - node-local metadata in a single redb table
//!
//! Tables:
//! - metastorage: key → value bytes, shared by per-node local keys and the
//!   reserved distributed namespace

use crate::keys::{LocalKey, ReservedKey, ReservedNamespace};
use crate::lock::{CheckpointLock, CheckpointReadGuard, CheckpointWriteGuard};
use crate::store::{BatchOp, LocalPersistentStore, WriteBatch};
use crate::StorageError;
use gmeta_model::StorageConfig;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

const METASTORAGE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("metastorage");

/// redb-backed [`LocalPersistentStore`] that also serves per-node local keys.
pub struct LocalMetaStore {
    db: Database,
    lock: CheckpointLock,
}

impl LocalMetaStore {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Database::create(path)?)
    }

    /// Create a store with no filesystem backing.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Database::builder().create_with_backend(InMemoryBackend::new())?)
    }

    pub fn open_with(config: &StorageConfig) -> Result<Self, StorageError> {
        match config {
            StorageConfig::File(path) => Self::open(path),
            StorageConfig::InMemory => Self::in_memory(),
        }
    }

    fn init(db: Database) -> Result<Self, StorageError> {
        // Ensure the table exists so read transactions never fail on it
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(METASTORAGE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db, lock: CheckpointLock::new() })
    }

    /// Exclusive side of the checkpoint lock. Blocks until in-flight writers finish.
    pub fn checkpoint_write_lock(&self) -> CheckpointWriteGuard<'_> {
        self.lock.write()
    }

    fn check_lock(&self, lock: &CheckpointReadGuard<'_>) -> Result<(), StorageError> {
        if lock.is_for(&self.lock) {
            Ok(())
        } else {
            Err(StorageError::ForeignLock)
        }
    }

    // ==================== Local Metadata ====================

    pub fn read(&self, key: &LocalKey) -> Result<Option<Vec<u8>>, StorageError> {
        let _lock = self.lock.read();
        self.get_raw(key.as_str())
    }

    pub fn write(&self, key: &LocalKey, value: &[u8]) -> Result<(), StorageError> {
        let _lock = self.lock.read();
        self.put_raw(key.as_str(), value)
    }

    pub fn remove(&self, key: &LocalKey) -> Result<(), StorageError> {
        let _lock = self.lock.read();
        self.remove_raw(key.as_str())
    }

    // ==================== Raw Access ====================

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METASTORAGE_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(METASTORAGE_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove_raw(&self, key: &str) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(METASTORAGE_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl LocalPersistentStore for LocalMetaStore {
    fn checkpoint_read_lock(&self) -> CheckpointReadGuard<'_> {
        self.lock.read()
    }

    fn read_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        key: &ReservedKey,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_lock(lock)?;
        self.get_raw(key.as_str())
    }

    fn write_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        key: &ReservedKey,
        value: &[u8],
    ) -> Result<(), StorageError> {
        self.check_lock(lock)?;
        self.put_raw(key.as_str(), value)
    }

    fn remove_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        key: &ReservedKey,
    ) -> Result<(), StorageError> {
        self.check_lock(lock)?;
        self.remove_raw(key.as_str())
    }

    fn scan_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        namespace: ReservedNamespace,
    ) -> Result<Vec<(ReservedKey, Vec<u8>)>, StorageError> {
        self.check_lock(lock)?;
        let prefix = namespace.prefix();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METASTORAGE_TABLE)?;

        let mut out = Vec::new();
        for result in table.range(prefix..)? {
            let (key, value) = result?;
            let raw = key.value();
            if !raw.starts_with(prefix) {
                break;
            }
            if let Some(reserved) = ReservedKey::from_stored(raw) {
                out.push((reserved, value.value().to_vec()));
            }
        }
        Ok(out)
    }

    fn commit_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        batch: WriteBatch,
    ) -> Result<(), StorageError> {
        self.check_lock(lock)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(METASTORAGE_TABLE)?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put(key, value) => {
                        table.insert(key.as_str(), value.as_slice())?;
                    }
                    BatchOp::Delete(key) => {
                        table.remove(key.as_str())?;
                    }
                    BatchOp::Clear(namespace) => {
                        let prefix = namespace.prefix();
                        let mut doomed = Vec::new();
                        for result in table.range(prefix..)? {
                            let (key, _) = result?;
                            let raw = key.value();
                            if !raw.starts_with(prefix) {
                                break;
                            }
                            doomed.push(raw.to_string());
                        }
                        for key in doomed {
                            table.remove(key.as_str())?;
                        }
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
