//! Join protocol and broadcast messages.
//!
//! Transport-agnostic; Borsh derives give every message a canonical byte form
//! for transports that need one.

use crate::record::{Entry, HistoryRecord, Mutation, Snapshot};
use crate::types::NodeId;
use crate::version::VersionStamp;
use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

/// Sent by a starting node to a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct JoinRequest {
    pub node: NodeId,
    /// Latest local `(version, checksum)`.
    pub stamp: VersionStamp,
    /// Oldest stamp the joiner can still vouch for (its history boundary).
    pub boundary: VersionStamp,
    /// False when the joiner found its local copy corrupt.
    pub trusted: bool,
    /// Retained history, oldest first.
    pub records: Vec<HistoryRecord>,
    /// Full local state. Only consulted when the joiner is ahead of the
    /// cluster and the cluster is inactive.
    pub entries: Vec<Entry>,
}

impl JoinRequest {
    /// Checksum the joiner claims at `version`, if its history window covers it.
    pub fn claimed_checksum_at(&self, version: crate::Version) -> Option<crate::Hash> {
        if version == self.stamp.version {
            return Some(self.stamp.checksum);
        }
        if version == self.boundary.version {
            return Some(self.boundary.checksum);
        }
        self.records
            .iter()
            .find(|r| r.version == version)
            .map(|r| r.checksum)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot { entries: self.entries.clone(), at: self.stamp }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RejectReason {
    /// Both sides know the state at a shared version and disagree on it.
    ConflictingData,
    /// The joiner is ahead of an active cluster.
    JoinerAhead,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ConflictingData => "conflicting-data",
            RejectReason::JoinerAhead => "joiner-ahead",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum JoinResponse {
    /// Joiner already matches the responder.
    UpToDate { at: VersionStamp },
    /// The inactive cluster takes over the joiner's longer history. The
    /// responder broadcasts an `Install` of the joiner's state.
    Adopted { at: VersionStamp },
    /// Missing suffix of history, oldest first.
    Incremental { records: Vec<HistoryRecord>, to: VersionStamp },
    /// Full state; history could not bridge the gap.
    Snapshot(Snapshot),
    Rejected { reason: RejectReason },
    /// Responder is itself still joining.
    NotReady,
}

impl JoinResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            JoinResponse::UpToDate { .. } => "up-to-date",
            JoinResponse::Adopted { .. } => "adopted",
            JoinResponse::Incremental { .. } => "incremental",
            JoinResponse::Snapshot(_) => "snapshot",
            JoinResponse::Rejected { .. } => "rejected",
            JoinResponse::NotReady => "not-ready",
        }
    }
}

/// Response plus the responder's delivery watermark.
///
/// The response reflects every broadcast delivery with a sequence number up
/// to and including `watermark`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct JoinReply {
    pub from: NodeId,
    /// Whether the responder's local copy passed its integrity checks.
    pub trusted: bool,
    pub watermark: u64,
    pub response: JoinResponse,
}

/// Broadcast payload, delivered to every node in one cluster-wide order.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ClusterMessage {
    /// A client update. `request` lets the origin match the delivery to its
    /// waiting caller.
    Update { origin: NodeId, request: u64, mutation: Mutation },
    /// Replace state wholesale. Emitted when an inactive cluster adopts the
    /// state of a joiner with a longer history.
    Install { origin: NodeId, snapshot: Snapshot },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hash, HistoryOp, Version};

    fn record(v: u64, seed: u8) -> HistoryRecord {
        HistoryRecord {
            version: Version(v),
            key: format!("k{v}"),
            op: HistoryOp::Write(vec![seed]),
            checksum: Hash([seed; 32]),
        }
    }

    #[test]
    fn test_claimed_checksum_at() {
        let req = JoinRequest {
            node: NodeId(1),
            stamp: VersionStamp::new(Version(5), Hash([5; 32])),
            boundary: VersionStamp::new(Version(2), Hash([2; 32])),
            trusted: true,
            records: vec![record(3, 3), record(4, 4), record(5, 5)],
            entries: vec![],
        };
        assert_eq!(req.claimed_checksum_at(Version(5)), Some(Hash([5; 32])));
        assert_eq!(req.claimed_checksum_at(Version(4)), Some(Hash([4; 32])));
        assert_eq!(req.claimed_checksum_at(Version(2)), Some(Hash([2; 32])));
        assert_eq!(req.claimed_checksum_at(Version(1)), None);
    }

    #[test]
    fn test_reject_reason_display() {
        assert_eq!(RejectReason::ConflictingData.to_string(), "conflicting-data");
        assert_eq!(JoinResponse::NotReady.kind(), "not-ready");
    }
}
