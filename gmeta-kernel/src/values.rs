//! ValueStore: in-memory projection of the current key/value state.

use crate::checksum::ConflictDetector;
use gmeta_model::{Entry, Hash, HistoryOp, HistoryRecord, Snapshot, Version, VersionStamp};
use std::collections::BTreeMap;

/// Value and the version that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub version: Version,
}

impl StoredValue {
    fn digest(&self, key: &str) -> Hash {
        ConflictDetector::entry_digest(key, &self.value, self.version)
    }
}

/// Current values plus their set digest, kept up to date on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStore {
    entries: BTreeMap<String, StoredValue>,
    digest: Hash,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        let mut store = Self::new();
        for e in entries {
            store.insert(e.key, StoredValue { value: e.value, version: e.version });
        }
        store
    }

    fn insert(&mut self, key: String, value: StoredValue) -> Option<StoredValue> {
        self.digest = ConflictDetector::combine(&self.digest, &value.digest(&key));
        let previous = self.entries.insert(key.clone(), value);
        if let Some(old) = &previous {
            self.digest = ConflictDetector::combine(&self.digest, &old.digest(&key));
        }
        previous
    }

    fn take(&mut self, key: &str) -> Option<StoredValue> {
        let previous = self.entries.remove(key);
        if let Some(old) = &previous {
            self.digest = ConflictDetector::combine(&self.digest, &old.digest(key));
        }
        previous
    }

    pub fn read(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.value.as_slice())
    }

    pub fn get(&self, key: &str) -> Option<&StoredValue> {
        self.entries.get(key)
    }

    /// Apply one record. Returns the value it replaced.
    pub fn apply(&mut self, record: &HistoryRecord) -> Option<StoredValue> {
        match &record.op {
            HistoryOp::Write(value) => self.insert(
                record.key.clone(),
                StoredValue { value: value.clone(), version: record.version },
            ),
            HistoryOp::Remove => self.take(&record.key),
        }
    }

    /// Put back what `apply` returned.
    pub fn restore(&mut self, key: &str, previous: Option<StoredValue>) {
        match previous {
            Some(v) => {
                self.insert(key.to_string(), v);
            }
            None => {
                self.take(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StoredValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.entries
            .iter()
            .map(|(k, v)| Entry { key: k.clone(), value: v.value.clone(), version: v.version })
            .collect()
    }

    pub fn snapshot(&self, at: VersionStamp) -> Snapshot {
        Snapshot { entries: self.entries(), at }
    }

    pub fn digest(&self) -> Hash {
        self.digest
    }
}
