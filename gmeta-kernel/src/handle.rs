//! MetaStorage - handle to one node's distributed metastorage

use crate::actor::{MetaStorageActor, MetaStorageCmd, NodeStatus};
use crate::cluster::ClusterContext;
use crate::join::JoinPhase;
use crate::replica::{OpenReport, Replica};
use crate::MetaStorageError;
use gmeta_model::{MetaStorageConfig, Mutation, NodeId, Snapshot, Version, VersionStamp};
use gmeta_net_types::ClusterMessenger;
use gmeta_storage::LocalPersistentStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// A node whose local state is loaded but whose actor is not running yet.
/// Use `into_handle()` to build the handle and the runner.
pub struct OpenedMetaStorage<S, M> {
    config: MetaStorageConfig,
    replica: Replica<S>,
    report: OpenReport,
    messenger: Arc<M>,
    cluster: Arc<ClusterContext>,
}

impl<S, M> OpenedMetaStorage<S, M>
where
    S: LocalPersistentStore,
    M: ClusterMessenger,
{
    /// Load and verify local state for the messenger's node.
    pub fn open(
        config: MetaStorageConfig,
        store: Arc<S>,
        messenger: Arc<M>,
        cluster: Arc<ClusterContext>,
    ) -> Result<Self, MetaStorageError> {
        let node = messenger.local_id();
        let (replica, report) = Replica::open(node, store, config.history_max_bytes)?;
        tracing::info!(
            node = %node,
            latest = %replica.latest(),
            boundary = %replica.history().boundary(),
            entries = replica.values().len(),
            "Opened local metastorage"
        );
        Ok(Self { config, replica, report, messenger, cluster })
    }

    pub fn report(&self) -> &OpenReport {
        &self.report
    }

    pub fn latest(&self) -> VersionStamp {
        self.replica.latest()
    }

    /// Returns the handle and an ActorRunner that must be spawned by the caller.
    pub fn into_handle(self) -> (MetaStorage, ActorRunner<S, M>) {
        let (tx, rx) = mpsc::channel(32);
        let (phase_tx, phase_rx) = watch::channel(JoinPhase::Starting);
        let shutdown_token = CancellationToken::new();
        let node = self.replica.node();

        let actor = MetaStorageActor::new(
            self.replica,
            self.report.corruption.is_some(),
            self.config,
            self.messenger,
            self.cluster.clone(),
            rx,
            phase_tx,
        );
        let runner = ActorRunner { actor, shutdown_token: shutdown_token.clone() };
        let handle = MetaStorage { node, tx, phase_rx, cluster: self.cluster, shutdown_token };
        (handle, runner)
    }
}

/// Runner for the metastorage actor. Must be spawned as a tokio task.
pub struct ActorRunner<S, M> {
    actor: MetaStorageActor<S, M>,
    shutdown_token: CancellationToken,
}

impl<S, M> ActorRunner<S, M>
where
    S: LocalPersistentStore,
    M: ClusterMessenger,
{
    pub async fn run(self) {
        self.actor.run(self.shutdown_token).await;
    }
}

#[derive(Clone)]
pub struct MetaStorage {
    node: NodeId,
    tx: mpsc::Sender<MetaStorageCmd>,
    phase_rx: watch::Receiver<JoinPhase>,
    cluster: Arc<ClusterContext>,
    shutdown_token: CancellationToken,
}

impl std::fmt::Debug for MetaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStorage")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl MetaStorage {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Write `value` under `key` cluster-wide. Resolves with the version the
    /// write received once it is applied locally.
    pub async fn write(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Version, MetaStorageError> {
        self.submit(Mutation::write(key, value)).await
    }

    /// Remove `key` cluster-wide. Removing an absent key still consumes a version.
    pub async fn remove(&self, key: impl Into<String>) -> Result<Version, MetaStorageError> {
        self.submit(Mutation::remove(key)).await
    }

    async fn submit(&self, mutation: Mutation) -> Result<Version, MetaStorageError> {
        if !self.cluster.is_active() {
            return Err(MetaStorageError::ClusterNotActive);
        }
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(MetaStorageCmd::Write { mutation, resp })
            .await
            .map_err(|_| MetaStorageError::Closed)?;
        rx.await.map_err(|_| MetaStorageError::Closed)?
    }

    /// Local read. Works in every phase, including before the node has joined.
    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, MetaStorageError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(MetaStorageCmd::Read { key: key.to_string(), resp })
            .await
            .map_err(|_| MetaStorageError::Closed)?;
        rx.await.map_err(|_| MetaStorageError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<Snapshot, MetaStorageError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(MetaStorageCmd::Snapshot { resp })
            .await
            .map_err(|_| MetaStorageError::Closed)?;
        rx.await.map_err(|_| MetaStorageError::Closed)?
    }

    pub async fn status(&self) -> Result<NodeStatus, MetaStorageError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(MetaStorageCmd::Status { resp })
            .await
            .map_err(|_| MetaStorageError::Closed)?;
        rx.await.map_err(|_| MetaStorageError::Closed)
    }

    /// Latest version and its running checksum.
    pub async fn checksum(&self) -> Result<VersionStamp, MetaStorageError> {
        Ok(self.status().await?.latest)
    }

    pub async fn verify_integrity(&self) -> Result<(), MetaStorageError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(MetaStorageCmd::VerifyIntegrity { resp })
            .await
            .map_err(|_| MetaStorageError::Closed)?;
        rx.await.map_err(|_| MetaStorageError::Closed)?
    }

    pub fn phase(&self) -> JoinPhase {
        self.phase_rx.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<JoinPhase> {
        self.phase_rx.clone()
    }

    /// Wait until the node settles. Fails if the join failed.
    pub async fn ready(&self) -> Result<(), MetaStorageError> {
        let mut rx = self.phase_rx.clone();
        let phase = rx
            .wait_for(JoinPhase::is_settled)
            .await
            .map_err(|_| MetaStorageError::Closed)?
            .clone();
        match phase {
            JoinPhase::Failed(failure) => Err(failure.into()),
            _ => Ok(()),
        }
    }

    /// Request actor shutdown
    pub fn shutdown(&self) {
        use tokio::sync::mpsc::error::TrySendError;

        match self.tx.try_send(MetaStorageCmd::Shutdown) {
            Ok(_) => {}
            Err(TrySendError::Full(_)) => {
                // Queue is backed up, cancel instead.
                self.shutdown_token.cancel();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Shut down and wait for the actor to exit.
    pub async fn close(&self) {
        self.shutdown();
        self.tx.closed().await;
    }
}
