//! Shared cluster harness for metastorage integration tests.
#![allow(dead_code)]

use gmeta_kernel::{
    ClusterContext, JoinMode, JoinPhase, MetaStorage, MetaStorageError, NodeStatus, OpenedMetaStorage,
};
use gmeta_model::{JoinConfig, MetaStorageConfig, NodeId, Version};
use gmeta_net_sim::{SimMessenger, SimNetwork};
use gmeta_storage::LocalMetaStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

/// On-disk encoding of a distributed value, for forging tampered stores.
pub fn stored_value(value: &[u8], version: Version) -> Vec<u8> {
    borsh::to_vec(&(version, value.to_vec())).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timeouts so retries happen quickly.
pub fn fast_config() -> MetaStorageConfig {
    MetaStorageConfig {
        join: JoinConfig {
            request_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(10),
            max_rounds: None,
        },
        ..MetaStorageConfig::default()
    }
}

struct Running {
    handle: MetaStorage,
    task: JoinHandle<()>,
}

/// In-process cluster over a `SimNetwork`. Each node's store outlives its
/// actor, so stopping and starting a node simulates a restart.
pub struct TestCluster {
    pub network: SimNetwork,
    pub cluster: Arc<ClusterContext>,
    pub config: MetaStorageConfig,
    stores: BTreeMap<u64, Arc<LocalMetaStore>>,
    messengers: BTreeMap<u64, SimMessenger>,
    running: BTreeMap<u64, Running>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: MetaStorageConfig) -> Self {
        init_tracing();
        Self {
            network: SimNetwork::new(),
            cluster: Arc::new(ClusterContext::new()),
            config,
            stores: BTreeMap::new(),
            messengers: BTreeMap::new(),
            running: BTreeMap::new(),
        }
    }

    /// History budget of every node started from now on.
    pub fn set_history_max_bytes(&mut self, bytes: u64) {
        self.config.history_max_bytes = bytes;
    }

    /// The node's local store, created empty on first use.
    pub fn store(&mut self, id: u64) -> Arc<LocalMetaStore> {
        self.stores
            .entry(id)
            .or_insert_with(|| Arc::new(LocalMetaStore::in_memory().unwrap()))
            .clone()
    }

    /// Replace the node's store, e.g. with a file-backed one.
    pub fn set_store(&mut self, id: u64, store: Arc<LocalMetaStore>) {
        self.stores.insert(id, store);
    }

    /// Forget the node's store; the next start begins from an empty one.
    pub fn drop_store(&mut self, id: u64) {
        self.stores.remove(&id);
    }

    pub fn messenger(&mut self, id: u64) -> SimMessenger {
        let network = self.network.clone();
        self.messengers
            .entry(id)
            .or_insert_with(|| network.messenger(NodeId(id)))
            .clone()
    }

    /// Open and spawn a node without waiting for it to join.
    pub fn spawn(&mut self, id: u64) -> MetaStorage {
        assert!(!self.running.contains_key(&id), "node {id} already running");
        let store = self.store(id);
        let messenger = Arc::new(self.messenger(id));
        let opened =
            OpenedMetaStorage::open(self.config.clone(), store, messenger, self.cluster.clone())
                .unwrap();
        let (handle, runner) = opened.into_handle();
        let task = tokio::spawn(runner.run());
        self.running.insert(id, Running { handle: handle.clone(), task });
        handle
    }

    /// Start a node and wait until it settles.
    pub async fn start(&mut self, id: u64) -> Result<MetaStorage, MetaStorageError> {
        let handle = self.spawn(id);
        tokio::time::timeout(WAIT, handle.ready())
            .await
            .expect("node did not settle")?;
        Ok(handle)
    }

    pub fn node(&self, id: u64) -> MetaStorage {
        self.running
            .get(&id)
            .map(|r| r.handle.clone())
            .unwrap_or_else(|| panic!("node {id} is not running"))
    }

    pub fn running(&self) -> Vec<u64> {
        self.running.keys().copied().collect()
    }

    pub fn activate(&self) {
        self.cluster.activate();
    }

    /// Stop a node; stopping the last one deactivates the cluster.
    pub async fn stop(&mut self, id: u64) {
        let Some(running) = self.running.remove(&id) else {
            return;
        };
        running.handle.close().await;
        running.task.await.unwrap();
        if self.running.is_empty() {
            self.cluster.deactivate();
        }
    }

    pub async fn stop_all(&mut self) {
        for id in self.running() {
            self.stop(id).await;
        }
    }

    pub async fn status(&self, id: u64) -> NodeStatus {
        self.node(id).status().await.unwrap()
    }

    /// Wait until every running node reports `version`.
    pub async fn wait_for_version(&self, version: Version) {
        for id in self.running() {
            let handle = self.node(id);
            tokio::time::timeout(WAIT, async {
                loop {
                    let status = handle.status().await.unwrap();
                    if status.phase == JoinPhase::Reconciled && status.latest.version >= version {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("node {id} did not reach {version}"));
        }
    }

    /// Assert every running node holds identical state.
    pub async fn assert_converged(&self) {
        let mut reference: Option<(u64, NodeStatus)> = None;
        for id in self.running() {
            let status = self.status(id).await;
            assert_eq!(status.phase, JoinPhase::Reconciled, "node {id} not reconciled");
            match &reference {
                None => reference = Some((id, status)),
                Some((first, expected)) => {
                    assert_eq!(status.latest, expected.latest, "node {id} vs node {first}");
                    assert_eq!(status.digest, expected.digest, "node {id} vs node {first}");
                }
            }
        }
    }

    /// Wait until the node has resynchronized from a peer's snapshot.
    pub async fn wait_for_snapshot(&self, id: u64) -> NodeStatus {
        let handle = self.node(id);
        tokio::time::timeout(WAIT, async {
            loop {
                let status = handle.status().await.unwrap();
                if status.phase == JoinPhase::Reconciled && status.join_mode == Some(JoinMode::Snapshot) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("node {id} did not resynchronize"))
    }

    pub async fn read(&self, id: u64, key: &str) -> Option<String> {
        self.node(id)
            .read(key)
            .await
            .unwrap()
            .map(|v| String::from_utf8(v).unwrap())
    }
}
