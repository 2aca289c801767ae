//! The contract the metastorage consumes from the local storage engine.

use crate::keys::{ReservedKey, ReservedNamespace};
use crate::lock::CheckpointReadGuard;
use crate::StorageError;

/// One step of an atomic [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(ReservedKey, Vec<u8>),
    Delete(ReservedKey),
    /// Remove every key in the namespace.
    Clear(ReservedNamespace),
}

/// Reserved-key mutations applied all-or-nothing by
/// [`LocalPersistentStore::commit_under_lock`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: ReservedKey, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put(key, value));
        self
    }

    pub fn delete(&mut self, key: ReservedKey) -> &mut Self {
        self.ops.push(BatchOp::Delete(key));
        self
    }

    pub fn clear(&mut self, namespace: ReservedNamespace) -> &mut Self {
        self.ops.push(BatchOp::Clear(namespace));
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Durable key/value storage guarded by a caller-held checkpoint lock.
///
/// Every method takes the read guard as proof that the caller holds the lock
/// for the whole operation. Implementations reject guards taken on another
/// store's lock with [`StorageError::ForeignLock`].
pub trait LocalPersistentStore: Send + Sync + 'static {
    fn checkpoint_read_lock(&self) -> CheckpointReadGuard<'_>;

    fn read_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        key: &ReservedKey,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    fn write_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        key: &ReservedKey,
        value: &[u8],
    ) -> Result<(), StorageError>;

    fn remove_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        key: &ReservedKey,
    ) -> Result<(), StorageError>;

    /// All keys of a namespace, in key order.
    fn scan_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        namespace: ReservedNamespace,
    ) -> Result<Vec<(ReservedKey, Vec<u8>)>, StorageError>;

    /// Apply a batch atomically.
    fn commit_under_lock(
        &self,
        lock: &CheckpointReadGuard<'_>,
        batch: WriteBatch,
    ) -> Result<(), StorageError>;
}
