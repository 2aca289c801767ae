//! Updates, history records, entries and snapshots.

use crate::types::Hash;
use crate::version::{Version, VersionStamp};
use borsh::{BorshDeserialize, BorshSerialize};

/// What an update does to its key.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum HistoryOp {
    Write(Vec<u8>),
    Remove,
}

impl HistoryOp {
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            HistoryOp::Write(v) => Some(v),
            HistoryOp::Remove => None,
        }
    }
}

/// An unversioned update as submitted by a client and broadcast to the cluster.
///
/// The version is assigned by each node when the update is delivered in the
/// cluster-wide order.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Mutation {
    pub key: String,
    pub op: HistoryOp,
}

impl Mutation {
    pub fn write(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), op: HistoryOp::Write(value.into()) }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self { key: key.into(), op: HistoryOp::Remove }
    }
}

/// An applied update. Immutable once appended to the history log.
///
/// `checksum` covers every record up to and including `version`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HistoryRecord {
    pub version: Version,
    pub key: String,
    pub op: HistoryOp,
    pub checksum: Hash,
}

impl HistoryRecord {
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp::new(self.version, self.checksum)
    }

    pub fn mutation(&self) -> Mutation {
        Mutation { key: self.key.clone(), op: self.op.clone() }
    }

    /// Size charged against the history byte budget.
    pub fn encoded_len(&self) -> u64 {
        self.to_borsh().len() as u64
    }

    pub fn to_borsh(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("borsh serialization cannot fail")
    }

    pub fn from_borsh(bytes: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(bytes)
    }
}

/// Current value of one key.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    /// Version of the update that produced this value.
    pub version: Version,
}

/// Full key/value state at a stamp. Entries are sorted by key.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Snapshot {
    pub entries: Vec<Entry>,
    pub at: VersionStamp,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self { entries: Vec::new(), at: VersionStamp::INITIAL }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .binary_search_by(|e| e.key.as_str().cmp(key))
            .ok()
            .map(|i| self.entries[i].value.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_constructors() {
        let w = Mutation::write("k", "v");
        assert_eq!(w.op.value(), Some(&b"v"[..]));
        let r = Mutation::remove("k");
        assert_eq!(r.op, HistoryOp::Remove);
        assert_eq!(r.op.value(), None);
    }

    #[test]
    fn test_record_encoded_len_grows_with_value() {
        let small = HistoryRecord {
            version: Version(1),
            key: "k".into(),
            op: HistoryOp::Write(vec![0; 4]),
            checksum: Hash::ZERO,
        };
        let mut big = small.clone();
        big.op = HistoryOp::Write(vec![0; 400]);
        assert_eq!(big.encoded_len() - small.encoded_len(), 396);

        let decoded = HistoryRecord::from_borsh(&big.to_borsh()).unwrap();
        assert_eq!(decoded, big);
    }

    #[test]
    fn test_snapshot_lookup() {
        let snap = Snapshot {
            entries: vec![
                Entry { key: "a".into(), value: b"1".to_vec(), version: Version(1) },
                Entry { key: "c".into(), value: b"3".to_vec(), version: Version(3) },
            ],
            at: VersionStamp::new(Version(3), Hash::ZERO),
        };
        assert_eq!(snap.get("c"), Some(&b"3"[..]));
        assert_eq!(snap.get("b"), None);
        assert!(Snapshot::empty().entries.is_empty());
    }
}
