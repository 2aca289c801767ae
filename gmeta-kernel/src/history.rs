//! HistoryLog: bounded, append-only suffix of applied updates.
//!
//! Records are evicted oldest-first once their total encoded size exceeds the
//! byte budget. The stamp just before the oldest retained record (the
//! boundary) and the latest stamp are kept even when their records are gone.

use gmeta_model::{Hash, HistoryRecord, Version, VersionStamp};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("Out of order record: expected {expected}, got {got}")]
    OutOfOrder { expected: Version, got: Version },
}

/// `records_since` cannot serve the request because eviction already
/// discarded part of it. Triggers a snapshot join; not a user-facing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Insufficient history: requested {requested}, oldest available {boundary}")]
pub struct InsufficientHistory {
    pub requested: Version,
    pub boundary: Version,
}

/// What appending a record will do, computed before anything is mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendPlan {
    /// Versions dropped from the front of the log.
    pub evicted: Vec<Version>,
    /// False when the budget is too small to hold the new record itself.
    pub retains_record: bool,
    pub boundary: VersionStamp,
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    records: VecDeque<HistoryRecord>,
    retained_bytes: u64,
    max_bytes: u64,
    boundary: VersionStamp,
    latest: VersionStamp,
}

impl HistoryLog {
    pub fn new(max_bytes: u64) -> Self {
        Self::starting_at(max_bytes, VersionStamp::INITIAL)
    }

    /// Empty log whose history up to `at` is known only by its stamp.
    pub fn starting_at(max_bytes: u64, at: VersionStamp) -> Self {
        Self {
            records: VecDeque::new(),
            retained_bytes: 0,
            max_bytes,
            boundary: at,
            latest: at,
        }
    }

    /// Rebuild from persisted parts. `records` must continue `boundary` and
    /// end at `latest`; callers verify that separately.
    pub fn restore(
        max_bytes: u64,
        boundary: VersionStamp,
        records: Vec<HistoryRecord>,
        latest: VersionStamp,
    ) -> Self {
        let retained_bytes = records.iter().map(HistoryRecord::encoded_len).sum();
        Self {
            records: records.into(),
            retained_bytes,
            max_bytes,
            boundary,
            latest,
        }
    }

    pub fn latest(&self) -> VersionStamp {
        self.latest
    }

    pub fn latest_version(&self) -> Version {
        self.latest.version
    }

    pub fn boundary(&self) -> VersionStamp {
        self.boundary
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn retained_bytes(&self) -> u64 {
        self.retained_bytes
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter()
    }

    pub fn plan_append(&self, record: &HistoryRecord) -> Result<AppendPlan, HistoryError> {
        let expected = self.latest.version.next();
        if record.version != expected {
            return Err(HistoryError::OutOfOrder { expected, got: record.version });
        }

        let mut total = self.retained_bytes + record.encoded_len();
        let mut evicted = Vec::new();
        let mut boundary = self.boundary;
        for old in &self.records {
            if total <= self.max_bytes {
                break;
            }
            total -= old.encoded_len();
            evicted.push(old.version);
            boundary = old.stamp();
        }

        let retains_record = total <= self.max_bytes;
        if !retains_record {
            boundary = record.stamp();
        }
        Ok(AppendPlan { evicted, retains_record, boundary })
    }

    /// Append and evict. Returns the plan that was carried out.
    pub fn append(&mut self, record: HistoryRecord) -> Result<AppendPlan, HistoryError> {
        let plan = self.plan_append(&record)?;
        for _ in &plan.evicted {
            if let Some(old) = self.records.pop_front() {
                self.retained_bytes -= old.encoded_len();
            }
        }
        self.latest = record.stamp();
        self.boundary = plan.boundary;
        if plan.retains_record {
            self.retained_bytes += record.encoded_len();
            self.records.push_back(record);
        }
        if !plan.evicted.is_empty() {
            tracing::debug!(
                evicted = plan.evicted.len(),
                boundary = %self.boundary,
                retained_bytes = self.retained_bytes,
                "History evicted"
            );
        }
        Ok(plan)
    }

    /// Drop oldest records until the log fits the budget. Used after the
    /// budget shrinks between restarts. Returns the dropped versions.
    pub fn enforce_budget(&mut self) -> Vec<Version> {
        let mut evicted = Vec::new();
        while self.retained_bytes > self.max_bytes {
            let Some(old) = self.records.pop_front() else { break };
            self.retained_bytes -= old.encoded_len();
            self.boundary = old.stamp();
            evicted.push(old.version);
        }
        evicted
    }

    /// Ordered records with versions greater than `version`.
    pub fn records_since(&self, version: Version) -> Result<Vec<HistoryRecord>, InsufficientHistory> {
        if version < self.boundary.version {
            return Err(InsufficientHistory { requested: version, boundary: self.boundary.version });
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.version > version)
            .cloned()
            .collect())
    }

    /// Checksum at `version` if it lies within `boundary..=latest`.
    pub fn checksum_at(&self, version: Version) -> Option<Hash> {
        if version == self.latest.version {
            return Some(self.latest.checksum);
        }
        if version == self.boundary.version {
            return Some(self.boundary.checksum);
        }
        if version < self.boundary.version || version > self.latest.version {
            return None;
        }
        let first = self.records.front()?.version;
        let idx = usize::try_from(version.0.checked_sub(first.0)?).ok()?;
        self.records.get(idx).map(|r| r.checksum)
    }

    /// Forget all records; the log restarts at `at`.
    pub fn reset(&mut self, at: VersionStamp) {
        self.records.clear();
        self.retained_bytes = 0;
        self.boundary = at;
        self.latest = at;
    }
}
