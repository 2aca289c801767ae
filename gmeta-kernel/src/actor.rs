//! MetaStorageActor - owns the Replica and the join state machine.
//!
//! Handle commands, messenger deliveries and negotiation outcomes are all
//! processed on one task, so the replica never needs a lock.

use crate::cluster::ClusterContext;
use crate::join::{
    decide, negotiate, outranks, JoinCoordinator, JoinDecision, JoinMode, JoinPhase, Negotiated,
};
use crate::replica::Replica;
use crate::{JoinFailure, MetaStorageError};
use gmeta_model::{
    ClusterMessage, Hash, JoinReply, JoinRequest, JoinResponse, MetaStorageConfig, Mutation,
    NodeId, RejectReason, Snapshot, Version, VersionStamp,
};
use gmeta_net_types::{ClusterMessenger, Delivery};
use gmeta_storage::LocalPersistentStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type Responder<T> = oneshot::Sender<Result<T, MetaStorageError>>;
type NegotiationTask = JoinHandle<Result<Negotiated, JoinFailure>>;

/// Commands sent to the MetaStorageActor
pub enum MetaStorageCmd {
    /// Broadcast a mutation; answered once it is applied locally
    Write {
        mutation: Mutation,
        resp: Responder<Version>,
    },
    Read {
        key: String,
        resp: Responder<Option<Vec<u8>>>,
    },
    Snapshot {
        resp: Responder<Snapshot>,
    },
    Status {
        resp: oneshot::Sender<NodeStatus>,
    },
    /// Re-check local integrity now
    VerifyIntegrity {
        resp: Responder<()>,
    },
    Shutdown,
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node: NodeId,
    pub phase: JoinPhase,
    pub latest: VersionStamp,
    pub boundary: VersionStamp,
    pub retained_records: usize,
    pub retained_bytes: u64,
    pub join_mode: Option<JoinMode>,
    pub corruption_detected: bool,
    /// Deliveries queued while joining; `None` once settled.
    pub startup_extras: Option<usize>,
    /// Highest delivery sequence reflected in local state.
    pub watermark: u64,
    pub digest: Hash,
}

pub struct MetaStorageActor<S, M> {
    node: NodeId,
    config: MetaStorageConfig,
    replica: Replica<S>,
    coordinator: JoinCoordinator,
    corruption_detected: bool,
    messenger: Arc<M>,
    cluster: Arc<ClusterContext>,
    rx: mpsc::Receiver<MetaStorageCmd>,
    phase_tx: watch::Sender<JoinPhase>,
    /// Local writes waiting for their own broadcast to come back, with its sequence.
    pending: HashMap<u64, (u64, Responder<Version>)>,
    next_request: u64,
    watermark: u64,
    negotiation: Option<NegotiationTask>,
    /// A node that outranks this one asked to join while this node was still joining.
    saw_senior_joiner: bool,
}

impl<S, M> MetaStorageActor<S, M>
where
    S: LocalPersistentStore,
    M: ClusterMessenger,
{
    pub fn new(
        replica: Replica<S>,
        corruption_detected: bool,
        config: MetaStorageConfig,
        messenger: Arc<M>,
        cluster: Arc<ClusterContext>,
        rx: mpsc::Receiver<MetaStorageCmd>,
        phase_tx: watch::Sender<JoinPhase>,
    ) -> Self {
        let coordinator = JoinCoordinator::new(config.startup_extras_capacity);
        Self {
            node: replica.node(),
            config,
            replica,
            coordinator,
            corruption_detected,
            messenger,
            cluster,
            rx,
            phase_tx,
            pending: HashMap::new(),
            next_request: 0,
            watermark: 0,
            negotiation: None,
            saw_senior_joiner: false,
        }
    }

    /// Run the actor loop - connects, joins, then serves until Shutdown,
    /// cancellation, or channel closed
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        let mut inbox = match self.messenger.connect().await {
            Ok(connection) => {
                self.watermark = connection.joined_at;
                self.begin_negotiation();
                Some(connection.inbox)
            }
            Err(e) => {
                self.fail(JoinFailure::Messenger(e.to_string()));
                None
            }
        };

        let mut integrity = self.config.integrity_check_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    break;
                }

                msg = self.rx.recv() => {
                    match msg {
                        Some(MetaStorageCmd::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                delivery = next_delivery(&mut inbox) => {
                    match delivery {
                        Some(delivery) => self.handle_delivery(delivery).await,
                        None => {
                            tracing::warn!(node = %self.node, "Messenger inbox closed");
                            inbox = None;
                        }
                    }
                }

                outcome = next_outcome(&mut self.negotiation) => {
                    self.negotiation = None;
                    self.on_negotiated(outcome);
                }

                _ = next_tick(&mut integrity) => {
                    if self.coordinator.is_reconciled() {
                        let _ = self.check_integrity();
                    }
                }
            }

            if self.coordinator.is_failed() && inbox.is_some() {
                self.messenger.disconnect().await;
                inbox = None;
            }
        }

        if let Some(task) = self.negotiation.take() {
            task.abort();
        }
        self.messenger.disconnect().await;
        tracing::debug!(node = %self.node, "Metastorage actor stopped");
    }

    async fn handle_command(&mut self, cmd: MetaStorageCmd) {
        match cmd {
            MetaStorageCmd::Write { mutation, resp } => {
                if let Err(e) = self.check_writable() {
                    let _ = resp.send(Err(e));
                    return;
                }
                self.next_request += 1;
                let request = self.next_request;
                let message = ClusterMessage::Update { origin: self.node, request, mutation };
                match self.messenger.broadcast(message).await {
                    Ok(seq) => {
                        tracing::trace!(node = %self.node, request, seq, "Update broadcast");
                        self.pending.insert(request, (seq, resp));
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e.into()));
                    }
                }
            }
            MetaStorageCmd::Read { key, resp } => {
                let _ = resp.send(Ok(self.replica.read(&key)));
            }
            MetaStorageCmd::Snapshot { resp } => {
                let _ = resp.send(Ok(self.replica.snapshot()));
            }
            MetaStorageCmd::Status { resp } => {
                let _ = resp.send(self.status());
            }
            MetaStorageCmd::VerifyIntegrity { resp } => {
                let _ = resp.send(self.check_integrity());
            }
            MetaStorageCmd::Shutdown => {}
        }
    }

    fn check_writable(&self) -> Result<(), MetaStorageError> {
        if !self.cluster.is_active() {
            return Err(MetaStorageError::ClusterNotActive);
        }
        match self.coordinator.phase() {
            JoinPhase::Reconciled => Ok(()),
            JoinPhase::Failed(failure) => Err(failure.clone().into()),
            _ => Err(MetaStorageError::NotReady),
        }
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Broadcast { seq, message } => self.on_broadcast(seq, message),
            Delivery::JoinRequest { request, reply } => {
                let answer = self.answer_join(request).await;
                let _ = reply.send(answer);
            }
        }
    }

    fn on_broadcast(&mut self, seq: u64, message: ClusterMessage) {
        match self.coordinator.phase() {
            JoinPhase::Reconciled => {
                if seq <= self.watermark {
                    tracing::debug!(node = %self.node, seq, watermark = self.watermark, "Skipping delivery already reflected");
                    return;
                }
                self.apply_message(seq, message);
            }
            JoinPhase::Failed(_) => {}
            _ => {
                if self.coordinator.extras_full() {
                    tracing::warn!(node = %self.node, capacity = self.config.startup_extras_capacity, "Startup extras overflowed, restarting join");
                    self.begin_negotiation();
                }
                if let Err(e) = self.coordinator.defer(seq, message) {
                    tracing::error!(node = %self.node, seq, error = %e, "Dropped delivery while joining");
                }
            }
        }
    }

    /// Apply one ordered broadcast to the replica and advance the watermark.
    fn apply_message(&mut self, seq: u64, message: ClusterMessage) {
        let failure = match message {
            ClusterMessage::Update { origin, request, mutation } => {
                let result = self.replica.apply_mutation(mutation).map(|record| {
                    tracing::trace!(node = %self.node, seq, key = %record.key, version = %record.version, "Applied update");
                    record.version
                });
                let failure = result.as_ref().err().map(|e| e.to_string());
                if origin == self.node {
                    if let Some((_, resp)) = self.pending.remove(&request) {
                        let _ = resp.send(result);
                    }
                }
                failure
            }
            ClusterMessage::Install { origin, snapshot } => {
                let at = snapshot.at;
                match self.replica.install_snapshot(snapshot) {
                    Ok(installed) => {
                        if installed {
                            tracing::info!(node = %self.node, origin = %origin, at = %at, "Installed adopted state");
                        }
                        None
                    }
                    Err(e) => Some(e.to_string()),
                }
            }
        };
        self.watermark = seq;
        if let Some(reason) = failure {
            self.fail(JoinFailure::Storage(reason));
        }
    }

    fn reply(&self, response: JoinResponse) -> JoinReply {
        JoinReply {
            from: self.node,
            trusted: self.replica.is_trusted(),
            watermark: self.watermark,
            response,
        }
    }

    async fn answer_join(&mut self, request: JoinRequest) -> JoinReply {
        if !self.coordinator.is_reconciled() {
            let joiner = (request.node, request.trusted);
            if outranks(joiner, (self.node, self.replica.is_trusted())) && !self.coordinator.is_failed() {
                self.saw_senior_joiner = true;
            }
            return self.reply(JoinResponse::NotReady);
        }
        if !self.replica.is_trusted() && request.trusted {
            return self.yield_to_trusted(request);
        }

        let decision = decide(
            self.replica.history(),
            self.replica.values(),
            &request,
            self.cluster.is_active(),
        );
        let response = match decision {
            JoinDecision::Respond(response) => response,
            JoinDecision::Adopt(snapshot) => {
                let at = snapshot.at;
                let install = ClusterMessage::Install { origin: request.node, snapshot };
                match self.messenger.broadcast(install).await {
                    Ok(seq) => {
                        tracing::info!(node = %self.node, joiner = %request.node, at = %at, seq, "Adopting state of joining node");
                        JoinResponse::Adopted { at }
                    }
                    Err(e) => {
                        tracing::warn!(node = %self.node, joiner = %request.node, error = %e, "Failed to broadcast adopted state");
                        JoinResponse::NotReady
                    }
                }
            }
        };

        match &response {
            JoinResponse::Rejected { reason } => {
                tracing::warn!(node = %self.node, joiner = %request.node, reason = ?reason, "Rejected joining node");
            }
            other => {
                tracing::info!(node = %self.node, joiner = %request.node, response = other.kind(), "Answered join request");
            }
        }
        self.reply(response)
    }

    /// An untrusted copy never answers a trusted joiner with its own values.
    /// A joiner that is behind still gets the missing records when the local
    /// chain verifies. Either way this node then resynchronizes.
    fn yield_to_trusted(&mut self, request: JoinRequest) -> JoinReply {
        let decision = decide(
            self.replica.history(),
            self.replica.values(),
            &request,
            self.cluster.is_active(),
        );
        let response = match decision {
            JoinDecision::Respond(response @ JoinResponse::Incremental { .. })
                if self.replica.history_is_intact() =>
            {
                response
            }
            _ => JoinResponse::NotReady,
        };
        tracing::warn!(
            node = %self.node,
            joiner = %request.node,
            response = response.kind(),
            "Local copy is untrusted, resynchronizing from joining node"
        );
        let reply = self.reply(response);
        self.begin_negotiation();
        reply
    }

    fn begin_negotiation(&mut self) {
        if let Err(e) = self.coordinator.begin() {
            tracing::error!(node = %self.node, error = %e, "Cannot start join");
            return;
        }
        self.saw_senior_joiner = false;
        self.publish_phase();

        let request = self.replica.join_request();
        tracing::info!(node = %self.node, stamp = %request.stamp, trusted = request.trusted, "Joining cluster");
        if let Some(previous) = self.negotiation.take() {
            previous.abort();
        }
        self.negotiation = Some(tokio::spawn(negotiate(
            self.messenger.clone(),
            request,
            self.config.join.clone(),
        )));
    }

    fn on_negotiated(&mut self, outcome: Result<Negotiated, JoinFailure>) {
        let reply = match outcome {
            Err(failure) => {
                self.fail(failure);
                return;
            }
            Ok(Negotiated::Alone) => {
                if self.saw_senior_joiner {
                    tracing::debug!(node = %self.node, "Higher-ranked node is joining, retrying");
                    self.begin_negotiation();
                } else {
                    self.settle(JoinMode::Alone, self.watermark);
                }
                return;
            }
            Ok(Negotiated::Reply(reply)) => reply,
        };

        let watermark = reply.watermark;
        match reply.response {
            JoinResponse::UpToDate { at } | JoinResponse::Adopted { at } if at != self.replica.latest() => {
                self.fail(JoinFailure::Protocol(format!(
                    "peer {} confirmed {} but local state is {}",
                    reply.from,
                    at,
                    self.replica.latest()
                )));
            }
            JoinResponse::UpToDate { .. } => self.settle(JoinMode::UpToDate, watermark),
            JoinResponse::Adopted { .. } => self.settle(JoinMode::Adopted, watermark),
            JoinResponse::Incremental { records, to } => {
                if let Err(e) = self.coordinator.replaying() {
                    tracing::error!(node = %self.node, error = %e, "Invalid join transition");
                    return;
                }
                self.publish_phase();
                match self.replica.replay(records, to) {
                    Ok(replayed) => self.settle(JoinMode::Replayed(replayed), watermark),
                    Err(e) => self.fail(JoinFailure::Protocol(e.to_string())),
                }
            }
            JoinResponse::Snapshot(snapshot) => {
                if let Err(e) = self.coordinator.snapshot_transfer() {
                    tracing::error!(node = %self.node, error = %e, "Invalid join transition");
                    return;
                }
                self.publish_phase();
                match self.replica.install_snapshot(snapshot) {
                    Ok(_) => self.settle(JoinMode::Snapshot, watermark),
                    Err(e) => self.fail(JoinFailure::Storage(e.to_string())),
                }
            }
            JoinResponse::Rejected { reason } => self.fail(match reason {
                RejectReason::ConflictingData => JoinFailure::ConflictingData,
                RejectReason::JoinerAhead => JoinFailure::JoinerAhead,
            }),
            JoinResponse::NotReady => self.begin_negotiation(),
        }
    }

    /// Become Reconciled at `watermark`, then apply extras ordered after it.
    fn settle(&mut self, mode: JoinMode, watermark: u64) {
        let extras = match self.coordinator.settle(mode) {
            Ok(extras) => extras,
            Err(e) => {
                tracing::error!(node = %self.node, error = %e, "Invalid join transition");
                return;
            }
        };
        self.watermark = self.watermark.max(watermark);

        let mut applied = 0usize;
        for (seq, message) in extras.drain_after(self.watermark) {
            self.apply_message(seq, message);
            if self.coordinator.is_failed() {
                return;
            }
            applied += 1;
        }

        // Own updates folded into the state received from the peer never
        // come back individually.
        let watermark = self.watermark;
        let covered: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, (seq, _))| *seq <= watermark)
            .map(|(request, _)| *request)
            .collect();
        for request in covered {
            if let Some((seq, resp)) = self.pending.remove(&request) {
                let _ = resp.send(Err(MetaStorageError::Protocol(format!(
                    "update {seq} was applied during resynchronization"
                ))));
            }
        }
        tracing::info!(
            node = %self.node,
            mode = ?mode,
            stamp = %self.replica.latest(),
            extras = applied,
            watermark = self.watermark,
            "Joined cluster"
        );
        self.publish_phase();
    }

    fn fail(&mut self, failure: JoinFailure) {
        tracing::error!(node = %self.node, failure = %failure, "Metastorage failed");
        if let Err(e) = self.coordinator.fail(failure.clone()) {
            tracing::error!(node = %self.node, error = %e, "Invalid join transition");
        }
        for (_, (_, resp)) in self.pending.drain() {
            let _ = resp.send(Err(failure.clone().into()));
        }
        if let Some(task) = self.negotiation.take() {
            task.abort();
        }
        self.publish_phase();
    }

    /// Verify local state; on corruption drop trust and resynchronize.
    fn check_integrity(&mut self) -> Result<(), MetaStorageError> {
        match self.replica.verify_integrity() {
            Err(MetaStorageError::CorruptionDetected(reason)) => {
                tracing::warn!(node = %self.node, reason = %reason, "Integrity check failed, resynchronizing");
                self.corruption_detected = true;
                self.replica.mark_untrusted();
                if self.coordinator.is_reconciled() {
                    self.begin_negotiation();
                }
                Err(MetaStorageError::CorruptionDetected(reason))
            }
            other => other,
        }
    }

    fn status(&self) -> NodeStatus {
        let history = self.replica.history();
        NodeStatus {
            node: self.node,
            phase: self.coordinator.phase().clone(),
            latest: self.replica.latest(),
            boundary: history.boundary(),
            retained_records: history.len(),
            retained_bytes: history.retained_bytes(),
            join_mode: self.coordinator.mode(),
            corruption_detected: self.corruption_detected,
            startup_extras: self.coordinator.startup_extras(),
            watermark: self.watermark,
            digest: self.replica.digest(),
        }
    }

    fn publish_phase(&self) {
        self.phase_tx.send_replace(self.coordinator.phase().clone());
    }
}

async fn next_delivery(
    inbox: &mut Option<mpsc::UnboundedReceiver<Delivery>>,
) -> Option<Delivery> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_outcome(task: &mut Option<NegotiationTask>) -> Result<Negotiated, JoinFailure> {
    match task {
        Some(handle) => match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(JoinFailure::Protocol(format!("negotiation task ended: {e}"))),
        },
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
