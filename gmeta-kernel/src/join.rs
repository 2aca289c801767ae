//! JoinCoordinator: the join state machine and the join decision.
//!
//! ```text
//! Starting ─► AwaitingDecision ─┬─► Reconciled
//!                 ▲             ├─► Replaying ───────► Reconciled
//!                 │             ├─► SnapshotTransfer ─► Reconciled
//!                 │             └─► Failed
//!                 └──────────── Reconciled   (resync after local corruption)
//! ```

use crate::checksum::{ConflictDetector, Verdict};
use crate::error::JoinFailure;
use crate::extras::{ExtrasOverflow, StartupExtras};
use crate::history::HistoryLog;
use crate::values::ValueStore;
use gmeta_model::{
    ClusterMessage, JoinConfig, JoinReply, JoinRequest, JoinResponse, NodeId, RejectReason,
    Snapshot,
};
use gmeta_net_types::ClusterMessenger;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinPhase {
    Starting,
    AwaitingDecision,
    Replaying,
    SnapshotTransfer,
    Reconciled,
    Failed(JoinFailure),
}

impl JoinPhase {
    pub fn name(&self) -> &'static str {
        match self {
            JoinPhase::Starting => "starting",
            JoinPhase::AwaitingDecision => "awaiting-decision",
            JoinPhase::Replaying => "replaying",
            JoinPhase::SnapshotTransfer => "snapshot-transfer",
            JoinPhase::Reconciled => "reconciled",
            JoinPhase::Failed(_) => "failed",
        }
    }

    /// Reconciled or Failed.
    pub fn is_settled(&self) -> bool {
        matches!(self, JoinPhase::Reconciled | JoinPhase::Failed(_))
    }

    fn may_become(&self, next: &JoinPhase) -> bool {
        use JoinPhase::*;
        matches!(
            (self, next),
            (Starting, AwaitingDecision)
                | (Starting, Failed(_))
                | (AwaitingDecision, AwaitingDecision)
                | (AwaitingDecision, Replaying)
                | (AwaitingDecision, SnapshotTransfer)
                | (AwaitingDecision, Reconciled)
                | (AwaitingDecision, Failed(_))
                | (Replaying, Reconciled)
                | (Replaying, Failed(_))
                | (SnapshotTransfer, Reconciled)
                | (SnapshotTransfer, Failed(_))
                | (Reconciled, AwaitingDecision)
                | (Reconciled, Failed(_))
        )
    }
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinPhase::Failed(failure) => write!(f, "failed: {failure}"),
            other => f.write_str(other.name()),
        }
    }
}

/// How the node reached `Reconciled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// No reconciled peer; the node's own state became authoritative.
    Alone,
    UpToDate,
    /// Caught up by replaying this many records.
    Replayed(usize),
    Snapshot,
    /// The inactive cluster took over this node's longer history.
    Adopted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal join transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

/// Join state plus the StartupExtras it owns.
///
/// Extras exist exactly while the node is between `Starting` and a settled
/// phase.
#[derive(Debug)]
pub struct JoinCoordinator {
    phase: JoinPhase,
    extras: Option<StartupExtras>,
    mode: Option<JoinMode>,
    capacity: usize,
}

impl JoinCoordinator {
    pub fn new(extras_capacity: usize) -> Self {
        Self {
            phase: JoinPhase::Starting,
            extras: Some(StartupExtras::new(extras_capacity)),
            mode: None,
            capacity: extras_capacity,
        }
    }

    pub fn phase(&self) -> &JoinPhase {
        &self.phase
    }

    pub fn mode(&self) -> Option<JoinMode> {
        self.mode
    }

    pub fn is_reconciled(&self) -> bool {
        self.phase == JoinPhase::Reconciled
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.phase, JoinPhase::Failed(_))
    }

    /// True when the next deferred delivery would not fit.
    pub fn extras_full(&self) -> bool {
        self.extras.as_ref().is_some_and(|e| e.len() >= self.capacity)
    }

    /// Pending extras, `None` once settled.
    pub fn startup_extras(&self) -> Option<usize> {
        self.extras.as_ref().map(StartupExtras::len)
    }

    fn transition(&mut self, next: JoinPhase) -> Result<(), TransitionError> {
        if !self.phase.may_become(&next) {
            return Err(TransitionError { from: self.phase.name(), to: next.name() });
        }
        self.phase = next;
        Ok(())
    }

    /// Start (or restart) negotiation. Restarting discards queued extras;
    /// everything they held is covered by the next reply.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(JoinPhase::AwaitingDecision)?;
        self.extras = Some(StartupExtras::new(self.capacity));
        self.mode = None;
        Ok(())
    }

    pub fn replaying(&mut self) -> Result<(), TransitionError> {
        self.transition(JoinPhase::Replaying)
    }

    pub fn snapshot_transfer(&mut self) -> Result<(), TransitionError> {
        self.transition(JoinPhase::SnapshotTransfer)
    }

    /// Queue a broadcast that arrived mid-join.
    pub fn defer(&mut self, seq: u64, message: ClusterMessage) -> Result<(), ExtrasOverflow> {
        match self.extras.as_mut() {
            Some(extras) => extras.push(seq, message),
            None => Err(ExtrasOverflow { capacity: 0 }),
        }
    }

    /// Move to `Reconciled` and hand over the extras for draining.
    pub fn settle(&mut self, mode: JoinMode) -> Result<StartupExtras, TransitionError> {
        self.transition(JoinPhase::Reconciled)?;
        self.mode = Some(mode);
        Ok(self.extras.take().unwrap_or_else(|| StartupExtras::new(0)))
    }

    pub fn fail(&mut self, failure: JoinFailure) -> Result<(), TransitionError> {
        self.transition(JoinPhase::Failed(failure))?;
        self.extras = None;
        Ok(())
    }
}

/// What a reconciled node does with a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    Respond(JoinResponse),
    /// Broadcast an install of the joiner's state, then answer `Adopted`.
    Adopt(Snapshot),
}

/// Decide how a joiner reconciles against this node's state.
pub fn decide(
    history: &HistoryLog,
    values: &ValueStore,
    request: &JoinRequest,
    cluster_active: bool,
) -> JoinDecision {
    let local = history.latest();

    if !request.trusted {
        return JoinDecision::Respond(JoinResponse::Snapshot(values.snapshot(local)));
    }
    if request.stamp == local {
        return JoinDecision::Respond(JoinResponse::UpToDate { at: local });
    }

    let joiner = request.stamp.version;
    if let Some(ours) = history.checksum_at(joiner) {
        if ConflictDetector::compare(&ours, &request.stamp.checksum) == Verdict::Diverged {
            return reject(RejectReason::ConflictingData);
        }
    }

    if joiner < local.version {
        return match history.records_since(joiner) {
            Ok(records) => JoinDecision::Respond(JoinResponse::Incremental { records, to: local }),
            Err(_) => JoinDecision::Respond(JoinResponse::Snapshot(values.snapshot(local))),
        };
    }

    if let Some(theirs) = request.claimed_checksum_at(local.version) {
        if ConflictDetector::compare(&theirs, &local.checksum) == Verdict::Diverged {
            return reject(RejectReason::ConflictingData);
        }
    }
    if cluster_active {
        reject(RejectReason::JoinerAhead)
    } else {
        JoinDecision::Adopt(request.snapshot())
    }
}

fn reject(reason: RejectReason) -> JoinDecision {
    JoinDecision::Respond(JoinResponse::Rejected { reason })
}

/// Result of one negotiation.
#[derive(Debug)]
pub enum Negotiated {
    /// No reconciled peer to join.
    Alone,
    Reply(JoinReply),
}

/// Whether `a` goes first when neither node has a reconciled peer to join.
/// A trusted copy always outranks an untrusted one; ties go to the lower id.
pub fn outranks(a: (NodeId, bool), b: (NodeId, bool)) -> bool {
    (!a.1, a.0) < (!b.1, b.0)
}

/// Ask peers until one gives a definitive answer.
///
/// Messenger failures and timeouts move on to the next peer. When every
/// reachable peer is itself still joining, the node that outranks all of
/// them settles alone and the others retry.
pub async fn negotiate<M: ClusterMessenger>(
    messenger: Arc<M>,
    request: JoinRequest,
    config: JoinConfig,
) -> Result<Negotiated, JoinFailure> {
    let me = messenger.local_id();
    let rank = (me, request.trusted);
    let mut round: u32 = 0;
    loop {
        round += 1;
        let peers = messenger.peers();
        if peers.is_empty() {
            return Ok(Negotiated::Alone);
        }

        let mut not_ready: Vec<(NodeId, bool)> = Vec::new();
        let mut failed = 0usize;
        for peer in peers {
            let attempt = messenger.request_join(peer, request.clone());
            match tokio::time::timeout(config.request_timeout, attempt).await {
                Ok(Ok(reply)) if matches!(reply.response, JoinResponse::NotReady) => {
                    not_ready.push((peer, reply.trusted));
                }
                Ok(Ok(reply)) => {
                    tracing::debug!(node = %me, peer = %peer, response = reply.response.kind(), "Join reply");
                    return Ok(Negotiated::Reply(reply));
                }
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(node = %me, peer = %peer, error = %e, "Join request failed");
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(node = %me, peer = %peer, "Join request timed out");
                }
            }
        }

        if failed == 0 && not_ready.iter().all(|peer| outranks(rank, *peer)) {
            return Ok(Negotiated::Alone);
        }
        if let Some(max) = config.max_rounds {
            if round >= max {
                return Err(JoinFailure::Exhausted(round));
            }
        }
        tracing::debug!(node = %me, round, not_ready = not_ready.len(), failed, "Retrying join");
        tokio::time::sleep(config.retry_backoff).await;
    }
}
