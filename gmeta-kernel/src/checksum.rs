//! ConflictDetector: rolling history checksums and state digests.
//!
//! `checksum(v) = blake3(borsh(checksum(v - 1), v, key, op))` with
//! `checksum(0) = Hash::ZERO`. Equal checksums at a version mean equal
//! history up to that version.

use gmeta_model::{Hash, HistoryOp, HistoryRecord, Version, VersionStamp};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Equal,
    Diverged,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("Version gap: expected {expected}, got {got}")]
    Gap { expected: Version, got: Version },
    #[error("Checksum mismatch at {0}")]
    Mismatch(Version),
}

pub struct ConflictDetector;

impl ConflictDetector {
    /// Fold one update into the previous checksum.
    pub fn fold(prev: &Hash, version: Version, key: &str, op: &HistoryOp) -> Hash {
        let bytes = borsh::to_vec(&(prev, version, key, op)).expect("borsh serialization cannot fail");
        Hash::digest(&bytes)
    }

    /// Checksum of a complete history starting at version 1.
    /// Stored record checksums are ignored.
    pub fn checksum_of(records: &[HistoryRecord]) -> Hash {
        records.iter().fold(Hash::ZERO, |acc, r| {
            Self::fold(&acc, r.version, &r.key, &r.op)
        })
    }

    pub fn compare(a: &Hash, b: &Hash) -> Verdict {
        if a == b {
            Verdict::Equal
        } else {
            Verdict::Diverged
        }
    }

    /// Check that `records` continue `base` without gaps and that every stored
    /// checksum matches its recomputation. Returns the stamp of the last record.
    pub fn verify_chain(
        base: VersionStamp,
        records: &[HistoryRecord],
    ) -> Result<VersionStamp, ChainError> {
        let mut cur = base;
        for r in records {
            let expected = cur.version.next();
            if r.version != expected {
                return Err(ChainError::Gap { expected, got: r.version });
            }
            let checksum = Self::fold(&cur.checksum, r.version, &r.key, &r.op);
            if Self::compare(&checksum, &r.checksum) == Verdict::Diverged {
                return Err(ChainError::Mismatch(r.version));
            }
            cur = r.stamp();
        }
        Ok(cur)
    }

    /// Digest of one stored value.
    pub fn entry_digest(key: &str, value: &[u8], version: Version) -> Hash {
        let bytes = borsh::to_vec(&(key, value, version)).expect("borsh serialization cannot fail");
        Hash::digest(&bytes)
    }

    /// Digest of a value set: the XOR of its entry digests. Independent of
    /// iteration order; `ValueStore` maintains it one entry at a time.
    pub fn digest<'a>(entries: impl IntoIterator<Item = (&'a str, &'a [u8], Version)>) -> Hash {
        entries.into_iter().fold(Hash::ZERO, |acc, (key, value, version)| {
            Self::combine(&acc, &Self::entry_digest(key, value, version))
        })
    }

    /// Add an entry digest to a set digest, or take it back out.
    pub fn combine(set: &Hash, entry: &Hash) -> Hash {
        let mut out = *set;
        for (o, e) in out.0.iter_mut().zip(entry.0.iter()) {
            *o ^= e;
        }
        out
    }
}
