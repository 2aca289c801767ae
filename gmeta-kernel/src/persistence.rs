//! Persistence adapter: maps replica state onto reserved keys of the local store.
//!
//! Every state change is one atomic batch, so a crash leaves either the
//! whole update or none of it.

use crate::history::AppendPlan;
use crate::values::{StoredValue, ValueStore};
use borsh::{BorshDeserialize, BorshSerialize};
use gmeta_model::{Hash, HistoryOp, HistoryRecord, Snapshot, Version, VersionStamp};
use gmeta_storage::{
    LocalPersistentStore, ReservedKey, ReservedNamespace, StorageError, WriteBatch,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stored at the version key after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PersistedState {
    pub latest: VersionStamp,
    pub boundary: VersionStamp,
    /// Digest of the value set at `latest`.
    pub digest: Hash,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct PersistedValue {
    version: Version,
    value: Vec<u8>,
}

fn encode_value(value: &[u8], version: Version) -> Vec<u8> {
    borsh::to_vec(&PersistedValue { version, value: value.to_vec() })
        .expect("borsh serialization cannot fail")
}

fn encode<T: BorshSerialize>(value: &T) -> Vec<u8> {
    borsh::to_vec(value).expect("borsh serialization cannot fail")
}

/// Everything read back at startup, with decoding problems recorded rather
/// than raised.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub state: Option<PersistedState>,
    pub values: BTreeMap<String, StoredValue>,
    pub records: Vec<HistoryRecord>,
    pub last_update: Option<HistoryRecord>,
    /// Reserved keys whose bytes did not decode.
    pub undecodable: Vec<String>,
}

impl LoadedState {
    pub fn is_blank(&self) -> bool {
        self.state.is_none() && self.values.is_empty() && self.records.is_empty()
    }
}

pub struct MetaPersistence<S> {
    store: Arc<S>,
}

impl<S: LocalPersistentStore> MetaPersistence<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<LoadedState, StorageError> {
        let lock = self.store.checkpoint_read_lock();
        let mut loaded = LoadedState::default();

        if let Some(bytes) = self.store.read_under_lock(&lock, &ReservedKey::version_state())? {
            match borsh::from_slice::<PersistedState>(&bytes) {
                Ok(state) => loaded.state = Some(state),
                Err(_) => loaded.undecodable.push(ReservedKey::version_state().as_str().into()),
            }
        }

        if let Some(bytes) = self.store.read_under_lock(&lock, &ReservedKey::last_update())? {
            match HistoryRecord::from_borsh(&bytes) {
                Ok(record) => loaded.last_update = Some(record),
                Err(_) => loaded.undecodable.push(ReservedKey::last_update().as_str().into()),
            }
        }

        for (key, bytes) in self.store.scan_under_lock(&lock, ReservedNamespace::Values)? {
            let Some(user_key) = key.user_key() else { continue };
            match borsh::from_slice::<PersistedValue>(&bytes) {
                Ok(v) => {
                    loaded
                        .values
                        .insert(user_key.to_string(), StoredValue { value: v.value, version: v.version });
                }
                Err(_) => loaded.undecodable.push(key.as_str().into()),
            }
        }

        for (key, bytes) in self.store.scan_under_lock(&lock, ReservedNamespace::History)? {
            match HistoryRecord::from_borsh(&bytes) {
                Ok(record) if Some(record.version) == key.history_version() => {
                    loaded.records.push(record)
                }
                _ => loaded.undecodable.push(key.as_str().into()),
            }
        }

        Ok(loaded)
    }

    /// Persist one applied record together with its evictions.
    pub fn commit_record(
        &self,
        record: &HistoryRecord,
        plan: &AppendPlan,
        digest: Hash,
    ) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        put_op(&mut batch, record);
        if plan.retains_record {
            batch.put(ReservedKey::history(record.version), record.to_borsh());
        }
        for version in &plan.evicted {
            batch.delete(ReservedKey::history(*version));
        }
        batch.put(ReservedKey::last_update(), record.to_borsh());
        batch.put(
            ReservedKey::version_state(),
            encode(&PersistedState { latest: record.stamp(), boundary: plan.boundary, digest }),
        );

        let lock = self.store.checkpoint_read_lock();
        self.store.commit_under_lock(&lock, batch)
    }

    /// Replace all distributed state with a snapshot.
    pub fn commit_snapshot(&self, snapshot: &Snapshot, digest: Hash) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.clear(ReservedNamespace::Values).clear(ReservedNamespace::History);
        for entry in &snapshot.entries {
            batch.put(ReservedKey::value(&entry.key), encode_value(&entry.value, entry.version));
        }
        batch.delete(ReservedKey::last_update());
        batch.put(
            ReservedKey::version_state(),
            encode(&PersistedState { latest: snapshot.at, boundary: snapshot.at, digest }),
        );

        let lock = self.store.checkpoint_read_lock();
        self.store.commit_under_lock(&lock, batch)
    }

    /// Rewrite one value after crash recovery re-applied the last update.
    pub fn commit_repair(&self, record: &HistoryRecord) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        put_op(&mut batch, record);
        let lock = self.store.checkpoint_read_lock();
        self.store.commit_under_lock(&lock, batch)
    }

    /// Drop history records evicted after a budget change.
    pub fn commit_evictions(
        &self,
        evicted: &[Version],
        state: PersistedState,
    ) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        for version in evicted {
            batch.delete(ReservedKey::history(*version));
        }
        batch.put(ReservedKey::version_state(), encode(&state));
        let lock = self.store.checkpoint_read_lock();
        self.store.commit_under_lock(&lock, batch)
    }

    /// Reserved-key view of the current values, for integrity checks.
    pub fn persisted_digest(&self) -> Result<Result<Hash, String>, StorageError> {
        let loaded = self.load()?;
        if !loaded.undecodable.is_empty() {
            return Ok(Err(format!("undecodable keys {:?}", loaded.undecodable)));
        }
        let store = ValueStore::from_entries(loaded.values.into_iter().map(|(key, v)| {
            gmeta_model::Entry { key, value: v.value, version: v.version }
        }));
        Ok(Ok(store.digest()))
    }
}

fn put_op(batch: &mut WriteBatch, record: &HistoryRecord) {
    match &record.op {
        HistoryOp::Write(value) => {
            batch.put(ReservedKey::value(&record.key), encode_value(value, record.version));
        }
        HistoryOp::Remove => {
            batch.delete(ReservedKey::value(&record.key));
        }
    }
}
