//! Replica: one node's copy of the distributed state.
//!
//! Owns the ValueStore and HistoryLog and keeps them in step with the local
//! persistent store. Every change is persisted first and applied to memory
//! only after the batch commits.

use crate::checksum::ConflictDetector;
use crate::history::HistoryLog;
use crate::persistence::{LoadedState, MetaPersistence, PersistedState};
use crate::values::{StoredValue, ValueStore};
use crate::MetaStorageError;
use gmeta_model::{
    Hash, HistoryRecord, JoinRequest, Mutation, NodeId, Snapshot, Version, VersionStamp,
};
use gmeta_storage::{LocalPersistentStore, ReservedKey};
use std::sync::Arc;

/// What `Replica::open` found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    /// Key whose value was restored from the last-update record.
    pub repaired: Option<String>,
    /// Set when the local copy cannot be trusted.
    pub corruption: Option<String>,
    /// History records dropped because the budget shrank.
    pub evicted: usize,
}

pub struct Replica<S> {
    node: NodeId,
    values: ValueStore,
    history: HistoryLog,
    persistence: MetaPersistence<S>,
    trusted: bool,
}

impl<S: LocalPersistentStore> Replica<S> {
    /// Load persisted state, repair the last write and verify integrity.
    pub fn open(
        node: NodeId,
        store: Arc<S>,
        history_max_bytes: u64,
    ) -> Result<(Self, OpenReport), MetaStorageError> {
        let persistence = MetaPersistence::new(store);
        let mut loaded = persistence.load()?;
        let mut report = OpenReport::default();

        let state = loaded.state.unwrap_or(PersistedState {
            latest: VersionStamp::INITIAL,
            boundary: VersionStamp::INITIAL,
            digest: ValueStore::new().digest(),
        });

        if let Some(record) = loaded.last_update.take() {
            if record.version == state.latest.version && repair_needed(&loaded, &record) {
                persistence.commit_repair(&record)?;
                apply_to_loaded(&mut loaded, &record);
                tracing::warn!(node = %node, key = %record.key, version = %record.version, "Restored value of last update");
                report.repaired = Some(record.key.clone());
            }
        }

        report.corruption = check_loaded(&loaded, &state);

        let values = ValueStore::from_entries(loaded.values.into_iter().map(|(key, v)| {
            gmeta_model::Entry { key, value: v.value, version: v.version }
        }));
        if report.corruption.is_none() && values.digest() != state.digest {
            report.corruption = Some("value digest mismatch".to_string());
        }

        let mut history =
            HistoryLog::restore(history_max_bytes, state.boundary, loaded.records, state.latest);
        if report.corruption.is_none() {
            let evicted = history.enforce_budget();
            if !evicted.is_empty() {
                persistence.commit_evictions(
                    &evicted,
                    PersistedState { boundary: history.boundary(), ..state },
                )?;
                report.evicted = evicted.len();
            }
        }

        if let Some(reason) = &report.corruption {
            tracing::warn!(node = %node, reason = %reason, "Local distributed metastorage is corrupt, will request a snapshot");
        }

        let replica = Self {
            node,
            values,
            history,
            persistence,
            trusted: report.corruption.is_none(),
        };
        Ok((replica, report))
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn latest(&self) -> VersionStamp {
        self.history.latest()
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn mark_untrusted(&mut self) {
        self.trusted = false;
    }

    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.values.read(key).map(<[u8]>::to_vec)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.values.snapshot(self.latest())
    }

    /// Assign the next version to a delivered update and apply it.
    pub fn apply_mutation(&mut self, mutation: Mutation) -> Result<HistoryRecord, MetaStorageError> {
        let latest = self.latest();
        let version = latest.version.next();
        let checksum = ConflictDetector::fold(&latest.checksum, version, &mutation.key, &mutation.op);
        let record = HistoryRecord { version, key: mutation.key, op: mutation.op, checksum };
        self.commit(record.clone())?;
        Ok(record)
    }

    fn commit(&mut self, record: HistoryRecord) -> Result<(), MetaStorageError> {
        let plan = self
            .history
            .plan_append(&record)
            .map_err(|e| MetaStorageError::Protocol(e.to_string()))?;

        let previous = self.values.apply(&record);
        let digest = self.values.digest();
        if let Err(e) = self.persistence.commit_record(&record, &plan, digest) {
            self.values.restore(&record.key, previous);
            return Err(e.into());
        }

        self.history
            .append(record)
            .map_err(|e| MetaStorageError::Protocol(e.to_string()))?;
        Ok(())
    }

    /// Apply a catch-up suffix strictly in version order.
    /// Stops at the first gap or checksum mismatch; records before it stay applied.
    pub fn replay(
        &mut self,
        records: Vec<HistoryRecord>,
        to: VersionStamp,
    ) -> Result<usize, MetaStorageError> {
        let mut applied = 0;
        for record in records {
            let latest = self.latest();
            let expected = latest.version.next();
            if record.version != expected {
                return Err(MetaStorageError::Protocol(format!(
                    "replay gap: expected {expected}, got {}",
                    record.version
                )));
            }
            let checksum = ConflictDetector::fold(&latest.checksum, record.version, &record.key, &record.op);
            if checksum != record.checksum {
                return Err(MetaStorageError::Protocol(format!(
                    "replay checksum mismatch at {}",
                    record.version
                )));
            }
            self.commit(record)?;
            applied += 1;
        }
        if self.latest() != to {
            return Err(MetaStorageError::Protocol(format!(
                "replay ended at {}, expected {to}",
                self.latest()
            )));
        }
        Ok(applied)
    }

    /// Replace local state wholesale. Returns false when the snapshot matches
    /// what a trusted replica already holds.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<bool, MetaStorageError> {
        let values = ValueStore::from_entries(snapshot.entries.iter().cloned());
        let digest = values.digest();
        if self.trusted && snapshot.at == self.latest() && digest == self.values.digest() {
            return Ok(false);
        }

        self.persistence.commit_snapshot(&snapshot, digest)?;
        self.values = values;
        self.history.reset(snapshot.at);
        self.trusted = true;
        tracing::info!(node = %self.node, at = %snapshot.at, keys = self.values.len(), "Installed snapshot");
        Ok(true)
    }

    /// What this node tells a peer when it asks to join.
    pub fn join_request(&self) -> JoinRequest {
        JoinRequest {
            node: self.node,
            stamp: self.latest(),
            boundary: self.history.boundary(),
            trusted: self.trusted,
            records: self.history.records().cloned().collect(),
            entries: self.values.entries(),
        }
    }

    /// Retained records chain from the boundary to the latest stamp.
    pub fn history_is_intact(&self) -> bool {
        self.verify_history().is_ok()
    }

    fn verify_history(&self) -> Result<(), MetaStorageError> {
        let records: Vec<_> = self.history.records().cloned().collect();
        let end = ConflictDetector::verify_chain(self.history.boundary(), &records)
            .map_err(|e| MetaStorageError::CorruptionDetected(e.to_string()))?;
        if end != self.latest() {
            return Err(MetaStorageError::CorruptionDetected(format!(
                "history ends at {end}, latest is {}",
                self.latest()
            )));
        }
        Ok(())
    }

    /// Recheck the history chain and compare persisted values with memory.
    /// Reads back every persisted value, so its cost grows with the key space.
    pub fn verify_integrity(&self) -> Result<(), MetaStorageError> {
        self.verify_history()?;

        let persisted = self
            .persistence
            .persisted_digest()?
            .map_err(MetaStorageError::CorruptionDetected)?;
        if persisted != self.values.digest() {
            return Err(MetaStorageError::CorruptionDetected(
                "persisted values differ from memory".to_string(),
            ));
        }
        Ok(())
    }

    pub fn digest(&self) -> Hash {
        self.values.digest()
    }

    pub fn version(&self) -> Version {
        self.history.latest_version()
    }
}

fn repair_needed(loaded: &LoadedState, record: &HistoryRecord) -> bool {
    let current = loaded.values.get(&record.key);
    match record.op.value() {
        Some(value) => current.map_or(true, |v| v.value != value || v.version != record.version),
        None => current.is_some(),
    }
}

fn apply_to_loaded(loaded: &mut LoadedState, record: &HistoryRecord) {
    match record.op.value() {
        Some(value) => {
            loaded.values.insert(
                record.key.clone(),
                StoredValue { value: value.to_vec(), version: record.version },
            );
        }
        None => {
            loaded.values.remove(&record.key);
        }
    }
    let repaired = ReservedKey::value(&record.key);
    loaded.undecodable.retain(|k| k != repaired.as_str());
}

/// Structural checks on what was loaded. Returns the first problem found.
fn check_loaded(loaded: &LoadedState, state: &PersistedState) -> Option<String> {
    if !loaded.undecodable.is_empty() {
        return Some(format!("undecodable keys {:?}", loaded.undecodable));
    }
    if loaded.state.is_none() && !loaded.is_blank() {
        return Some("missing version record".to_string());
    }
    match ConflictDetector::verify_chain(state.boundary, &loaded.records) {
        Ok(end) if end == state.latest => None,
        Ok(end) => Some(format!("history ends at {end}, latest is {}", state.latest)),
        Err(e) => Some(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gmeta_model::HistoryOp;
    use gmeta_storage::LocalMetaStore;

    fn open(store: &Arc<LocalMetaStore>, budget: u64) -> (Replica<LocalMetaStore>, OpenReport) {
        Replica::open(NodeId(1), store.clone(), budget).unwrap()
    }

    fn write(replica: &mut Replica<LocalMetaStore>, key: &str, value: &str) -> HistoryRecord {
        replica.apply_mutation(Mutation::write(key, value)).unwrap()
    }

    #[test]
    fn test_fresh_replica_is_empty_and_trusted() {
        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (replica, report) = open(&store, u64::MAX);
        assert_eq!(replica.latest(), VersionStamp::INITIAL);
        assert!(replica.is_trusted());
        assert_eq!(report, OpenReport::default());
    }

    #[test]
    fn test_apply_assigns_versions_and_survives_reopen() {
        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut replica, _) = open(&store, u64::MAX);
        let r1 = write(&mut replica, "key1", "value1");
        let r2 = replica.apply_mutation(Mutation::remove("key1")).unwrap();
        let r3 = write(&mut replica, "key2", "value2");
        assert_eq!((r1.version, r2.version, r3.version), (Version(1), Version(2), Version(3)));
        let latest = replica.latest();
        drop(replica);

        let (replica, report) = open(&store, u64::MAX);
        assert!(report.corruption.is_none());
        assert_eq!(replica.latest(), latest);
        assert_eq!(replica.read("key1"), None);
        assert_eq!(replica.read("key2"), Some(b"value2".to_vec()));
        assert_eq!(replica.history().len(), 3);
        replica.verify_integrity().unwrap();
    }

    #[test]
    fn test_removed_last_value_is_repaired() {
        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut replica, _) = open(&store, 0);
        write(&mut replica, "key1", "val1");
        write(&mut replica, "key9", "val9");
        drop(replica);

        {
            let lock = store.checkpoint_read_lock();
            store.remove_under_lock(&lock, &ReservedKey::value("key9")).unwrap();
        }

        let (replica, report) = open(&store, 0);
        assert_eq!(report.repaired.as_deref(), Some("key9"));
        assert!(report.corruption.is_none());
        assert!(replica.is_trusted());
        assert_eq!(replica.read("key9"), Some(b"val9".to_vec()));
        replica.verify_integrity().unwrap();
    }

    #[test]
    fn test_garbled_last_value_is_repaired() {
        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut replica, _) = open(&store, 0);
        write(&mut replica, "key1", "val1");
        write(&mut replica, "key5", "val5");
        drop(replica);

        {
            let lock = store.checkpoint_read_lock();
            store
                .write_under_lock(&lock, &ReservedKey::value("key5"), b"wrong-value")
                .unwrap();
        }

        let (replica, report) = open(&store, 0);
        assert!(report.corruption.is_none());
        assert_eq!(replica.read("key5"), Some(b"val5".to_vec()));
    }

    #[test]
    fn test_corrupt_older_value_is_untrusted() {
        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut replica, _) = open(&store, u64::MAX);
        write(&mut replica, "key1", "val1");
        write(&mut replica, "key2", "val2");
        drop(replica);

        {
            let lock = store.checkpoint_read_lock();
            store
                .write_under_lock(
                    &lock,
                    &ReservedKey::value("key1"),
                    &borsh::to_vec(&(Version(1), b"forged".to_vec())).unwrap(),
                )
                .unwrap();
        }

        let (replica, report) = open(&store, u64::MAX);
        assert_eq!(report.corruption.as_deref(), Some("value digest mismatch"));
        assert!(!replica.is_trusted());
        assert!(!replica.join_request().trusted);
    }

    #[test]
    fn test_tampered_history_is_untrusted() {
        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut replica, _) = open(&store, u64::MAX);
        write(&mut replica, "key1", "val1");
        let mut r2 = write(&mut replica, "key2", "val2");
        write(&mut replica, "key3", "val3");
        drop(replica);

        r2.op = HistoryOp::Write(b"other".to_vec());
        {
            let lock = store.checkpoint_read_lock();
            store
                .write_under_lock(&lock, &ReservedKey::history(Version(2)), &r2.to_borsh())
                .unwrap();
        }

        let (replica, report) = open(&store, u64::MAX);
        assert!(report.corruption.unwrap().contains("Checksum mismatch"));
        assert!(!replica.is_trusted());
    }

    #[test]
    fn test_shrunk_budget_evicts_on_open() {
        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut replica, _) = open(&store, u64::MAX);
        write(&mut replica, "key1", "val1");
        write(&mut replica, "key2", "val2");
        drop(replica);

        let (replica, report) = open(&store, 0);
        assert_eq!(report.evicted, 2);
        assert!(replica.history().is_empty());
        drop(replica);

        let (replica, report) = open(&store, 0);
        assert!(report.corruption.is_none());
        assert_eq!(replica.history().boundary(), replica.latest());
    }

    #[test]
    fn test_replay_rejects_gap_and_bad_checksum() {
        let source_store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut source, _) = open(&source_store, u64::MAX);
        write(&mut source, "a", "1");
        write(&mut source, "b", "2");
        write(&mut source, "c", "3");
        let records = source.history().records_since(Version(0)).unwrap();

        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut target, _) = open(&store, u64::MAX);
        let gap = vec![records[0].clone(), records[2].clone()];
        assert!(matches!(
            target.replay(gap, source.latest()),
            Err(MetaStorageError::Protocol(_))
        ));
        assert_eq!(target.version(), Version(1));

        let mut bad = records[1..].to_vec();
        bad[0].checksum = Hash([1; 32]);
        assert!(target.replay(bad, source.latest()).is_err());
        assert_eq!(target.version(), Version(1));

        assert_eq!(target.replay(records[1..].to_vec(), source.latest()).unwrap(), 2);
        assert_eq!(target.latest(), source.latest());
        assert_eq!(target.digest(), source.digest());
    }

    #[test]
    fn test_install_snapshot_is_idempotent() {
        let source_store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut source, _) = open(&source_store, u64::MAX);
        write(&mut source, "a", "1");
        write(&mut source, "b", "2");

        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut target, _) = open(&store, u64::MAX);
        write(&mut target, "stale", "x");

        assert!(target.install_snapshot(source.snapshot()).unwrap());
        assert!(!target.install_snapshot(source.snapshot()).unwrap());
        assert_eq!(target.read("stale"), None);
        assert_eq!(target.latest(), source.latest());
        drop(target);

        let (target, report) = open(&store, u64::MAX);
        assert!(report.corruption.is_none());
        assert_eq!(target.read("b"), Some(b"2".to_vec()));
        target.verify_integrity().unwrap();
    }

    #[test]
    fn test_verify_integrity_spots_on_disk_change() {
        let store = Arc::new(LocalMetaStore::in_memory().unwrap());
        let (mut replica, _) = open(&store, u64::MAX);
        write(&mut replica, "a", "1");
        {
            let lock = store.checkpoint_read_lock();
            store.remove_under_lock(&lock, &ReservedKey::value("a")).unwrap();
        }
        assert!(matches!(
            replica.verify_integrity(),
            Err(MetaStorageError::CorruptionDetected(_))
        ));
    }
}
