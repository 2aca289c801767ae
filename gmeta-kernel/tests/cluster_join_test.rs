//! Join and restart behaviour of a multi-node metastorage cluster.

mod common;

use common::TestCluster;
use gmeta_kernel::{JoinFailure, JoinMode, JoinPhase, MetaStorageError};
use gmeta_model::Version;
use gmeta_storage::LocalKey;
use std::time::Duration;

async fn write_keys(cluster: &TestCluster, node: u64, keys: std::ops::Range<u32>) -> Version {
    let handle = cluster.node(node);
    let mut last = Version::INITIAL;
    for i in keys {
        last = handle.write(format!("key{i}"), format!("value{i}")).await.unwrap();
    }
    last
}

#[tokio::test]
async fn test_first_node_settles_alone() {
    let mut cluster = TestCluster::new();
    let node = cluster.start(1).await.unwrap();

    let status = node.status().await.unwrap();
    assert_eq!(status.phase, JoinPhase::Reconciled);
    assert_eq!(status.join_mode, Some(JoinMode::Alone));
    assert_eq!(status.latest.version, Version::INITIAL);
    assert_eq!(status.startup_extras, None);
}

#[tokio::test]
async fn test_writes_are_versioned_identically_on_every_node() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.start(2).await.unwrap();
    cluster.start(3).await.unwrap();
    cluster.activate();

    let v1 = cluster.node(1).write("a", "1").await.unwrap();
    let v2 = cluster.node(2).write("b", "2").await.unwrap();
    let v3 = cluster.node(3).remove("a").await.unwrap();
    assert_eq!((v1, v2, v3), (Version(1), Version(2), Version(3)));

    cluster.wait_for_version(Version(3)).await;
    cluster.assert_converged().await;
    for id in [1, 2, 3] {
        assert_eq!(cluster.read(id, "a").await, None);
        assert_eq!(cluster.read(id, "b").await.as_deref(), Some("2"));
    }
}

#[tokio::test]
async fn test_restart() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.activate();
    let last = write_keys(&cluster, 1, 0..5).await;
    assert_eq!(last, Version(5));

    let joiner = cluster.start(2).await.unwrap();
    let status = joiner.status().await.unwrap();
    assert_eq!(status.join_mode, Some(JoinMode::Replayed(5)));
    assert_eq!(cluster.read(2, "key4").await.as_deref(), Some("value4"));

    cluster.stop_all().await;
    assert!(!cluster.cluster.is_active());

    let a = cluster.spawn(1);
    let b = cluster.spawn(2);
    a.ready().await.unwrap();
    b.ready().await.unwrap();
    cluster.activate();

    cluster.assert_converged().await;
    assert_eq!(cluster.status(1).await.latest.version, Version(5));
    for i in 0..5 {
        let expected = format!("value{i}");
        assert_eq!(cluster.read(2, &format!("key{i}")).await, Some(expected));
    }

    cluster.node(2).write("after", "restart").await.unwrap();
    cluster.wait_for_version(Version(6)).await;
    assert_eq!(cluster.read(1, "after").await.as_deref(), Some("restart"));
}

#[tokio::test]
async fn test_stale_node_replays_missed_updates() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.start(2).await.unwrap();
    cluster.activate();
    write_keys(&cluster, 1, 0..3).await;
    cluster.wait_for_version(Version(3)).await;

    cluster.stop(2).await;
    write_keys(&cluster, 1, 3..7).await;

    let node = cluster.start(2).await.unwrap();
    assert_eq!(node.status().await.unwrap().join_mode, Some(JoinMode::Replayed(4)));
    cluster.assert_converged().await;
}

#[tokio::test]
async fn test_join_with_zero_history_uses_snapshot() {
    let mut cluster = TestCluster::new();
    cluster.set_history_max_bytes(0);
    cluster.start(1).await.unwrap();
    cluster.activate();
    write_keys(&cluster, 1, 0..3).await;

    let status = cluster.status(1).await;
    assert_eq!(status.retained_records, 0);
    assert_eq!(status.boundary, status.latest);

    let node = cluster.start(2).await.unwrap();
    assert_eq!(node.status().await.unwrap().join_mode, Some(JoinMode::Snapshot));
    assert_eq!(cluster.read(2, "key2").await.as_deref(), Some("value2"));
    cluster.assert_converged().await;
}

#[tokio::test]
async fn test_join_node_with_longer_history() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.start(2).await.unwrap();
    cluster.activate();
    cluster.node(1).write("k1", "v1").await.unwrap();
    cluster.wait_for_version(Version(1)).await;

    cluster.stop(2).await;
    cluster.node(1).write("k2", "v2").await.unwrap();
    cluster.stop(1).await;
    assert!(!cluster.cluster.is_active());

    cluster.start(2).await.unwrap();
    assert_eq!(cluster.status(2).await.latest.version, Version(1));

    let node = cluster.start(1).await.unwrap();
    assert_eq!(node.status().await.unwrap().join_mode, Some(JoinMode::Adopted));

    cluster.wait_for_version(Version(2)).await;
    cluster.assert_converged().await;
    assert_eq!(cluster.read(2, "k2").await.as_deref(), Some("v2"));

    cluster.activate();
    cluster.node(2).write("k3", "v3").await.unwrap();
    cluster.wait_for_version(Version(3)).await;
    assert_eq!(cluster.read(1, "k3").await.as_deref(), Some("v3"));
}

#[tokio::test]
async fn test_joiner_ahead_rejected_by_active_cluster() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.start(2).await.unwrap();
    cluster.activate();
    cluster.node(1).write("k1", "v1").await.unwrap();
    cluster.wait_for_version(Version(1)).await;

    cluster.stop(2).await;
    cluster.node(1).write("k2", "v2").await.unwrap();
    cluster.stop(1).await;

    cluster.start(2).await.unwrap();
    cluster.activate();

    let err = cluster.start(1).await.unwrap_err();
    assert!(matches!(err, MetaStorageError::JoinerAhead), "{err}");
    assert_eq!(cluster.node(1).phase(), JoinPhase::Failed(JoinFailure::JoinerAhead));

    // The rejected node keeps its own data and refuses writes.
    assert_eq!(cluster.read(1, "k2").await.as_deref(), Some("v2"));
    let write = cluster.node(1).write("k3", "v3").await;
    assert!(matches!(write, Err(MetaStorageError::JoinerAhead)));
    assert_eq!(cluster.status(2).await.latest.version, Version(1));
}

#[tokio::test]
async fn test_conflicting_data() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.activate();
    cluster.node(1).write("key", "from-node-1").await.unwrap();
    cluster.stop(1).await;

    cluster.start(2).await.unwrap();
    cluster.activate();
    cluster.node(2).write("key", "from-node-2").await.unwrap();

    let err = cluster.start(1).await.unwrap_err();
    assert!(matches!(err, MetaStorageError::ConflictingData), "{err}");
    assert_eq!(
        err.to_string(),
        "Joining node has conflicting distributed metastorage data"
    );
    let status = cluster.status(1).await;
    assert_eq!(status.phase, JoinPhase::Failed(JoinFailure::ConflictingData));
    assert_eq!(status.startup_extras, None);
    assert_eq!(cluster.read(2, "key").await.as_deref(), Some("from-node-2"));
}

#[tokio::test]
async fn test_inactive_cluster_write() {
    let mut cluster = TestCluster::new();
    let node = cluster.start(1).await.unwrap();

    let err = node.write("key", "value").await.unwrap_err();
    assert!(matches!(err, MetaStorageError::ClusterNotActive));
    assert!(err.to_string().contains("cluster is not active"));
    assert!(matches!(node.remove("key").await, Err(MetaStorageError::ClusterNotActive)));
    assert_eq!(node.read("key").await.unwrap(), None);

    cluster.activate();
    assert_eq!(node.write("key", "value").await.unwrap(), Version(1));
    assert_eq!(cluster.read(1, "key").await.as_deref(), Some("value"));
}

#[tokio::test]
async fn test_names_collision() {
    let mut cluster = TestCluster::new();
    let store = cluster.store(1);
    let node = cluster.start(1).await.unwrap();
    cluster.activate();

    let local = LocalKey::new("key").unwrap();
    store.write(&local, b"local").unwrap();
    node.write("key", "distributed").await.unwrap();

    assert_eq!(store.read(&local).unwrap().as_deref(), Some(&b"local"[..]));
    assert_eq!(cluster.read(1, "key").await.as_deref(), Some("distributed"));

    node.remove("key").await.unwrap();
    assert_eq!(store.read(&local).unwrap().as_deref(), Some(&b"local"[..]));
    assert_eq!(cluster.read(1, "key").await, None);

    assert!(LocalKey::new("\0key-key").is_err());
}

async fn wrong_start_order(order: [u64; 3]) {
    let mut cluster = TestCluster::new();
    cluster.set_history_max_bytes(0);
    for id in [1, 2, 3] {
        cluster.start(id).await.unwrap();
    }
    cluster.activate();

    cluster.node(1).write("k1", "v1").await.unwrap();
    cluster.wait_for_version(Version(1)).await;
    cluster.stop(3).await;
    cluster.node(1).write("k2", "v2").await.unwrap();
    cluster.wait_for_version(Version(2)).await;
    cluster.stop(2).await;
    cluster.node(1).write("k3", "v3").await.unwrap();
    cluster.stop(1).await;

    for id in order {
        cluster.start(id).await.unwrap();
    }
    cluster.wait_for_version(Version(3)).await;
    cluster.assert_converged().await;
    for id in [1, 2, 3] {
        assert_eq!(cluster.read(id, "k3").await.as_deref(), Some("v3"), "node {id}");
    }

    cluster.activate();
    cluster.node(order[0]).write("k4", "v4").await.unwrap();
    cluster.wait_for_version(Version(4)).await;
    cluster.assert_converged().await;
}

#[tokio::test]
async fn test_wrong_start_order_oldest_first() {
    wrong_start_order([3, 2, 1]).await;
}

#[tokio::test]
async fn test_wrong_start_order_mixed() {
    wrong_start_order([2, 3, 1]).await;
}

#[tokio::test]
async fn test_wrong_start_order_newest_first() {
    wrong_start_order([1, 3, 2]).await;
}

#[tokio::test]
async fn test_unstable_topology() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.activate();

    let writer = cluster.node(1);
    let writes = tokio::spawn(async move {
        for i in 0..60u32 {
            writer.write(format!("key{i}"), format!("value{i}")).await.unwrap();
            if i % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    });

    for id in [2, 3, 4] {
        let node = cluster.start(id).await.unwrap();
        assert_eq!(node.status().await.unwrap().startup_extras, None);
    }
    cluster.stop(3).await;
    cluster.start(3).await.unwrap();

    writes.await.unwrap();
    cluster.wait_for_version(Version(60)).await;
    cluster.assert_converged().await;
    for id in cluster.running() {
        let status = cluster.status(id).await;
        assert_eq!(status.startup_extras, None, "node {id}");
        assert_eq!(cluster.read(id, "key59").await.as_deref(), Some("value59"));
    }
}

#[tokio::test]
async fn test_simultaneous_start_settles_one_authority() {
    let mut cluster = TestCluster::new();
    let handles: Vec<_> = [1, 2, 3].into_iter().map(|id| cluster.spawn(id)).collect();
    for handle in &handles {
        handle.ready().await.unwrap();
    }

    let alone = count_settled_alone(&cluster).await;
    assert!(alone >= 1);
    cluster.activate();
    cluster.node(3).write("k", "v").await.unwrap();
    cluster.wait_for_version(Version(1)).await;
    cluster.assert_converged().await;
}

async fn count_settled_alone(cluster: &TestCluster) -> usize {
    let mut alone = 0;
    for id in cluster.running() {
        if cluster.status(id).await.join_mode == Some(JoinMode::Alone) {
            alone += 1;
        }
    }
    alone
}

#[tokio::test]
async fn test_dropped_join_request_is_retried() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.activate();
    cluster.node(1).write("k", "v").await.unwrap();

    cluster.messenger(1).drop_next_incoming_join_requests(2);
    let node = cluster.start(2).await.unwrap();
    assert_eq!(node.status().await.unwrap().join_mode, Some(JoinMode::Replayed(1)));
    assert_eq!(cluster.read(2, "k").await.as_deref(), Some("v"));
}

#[tokio::test]
async fn test_writes_refused_while_joining() {
    let mut cluster = TestCluster::new();
    cluster.start(1).await.unwrap();
    cluster.activate();

    // Node 1 swallows every join request, so node 2 keeps retrying.
    cluster.messenger(1).drop_next_incoming_join_requests(u32::MAX);
    let joining = cluster.spawn(2);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!joining.phase().is_settled());
    assert!(matches!(joining.write("k", "v").await, Err(MetaStorageError::NotReady)));
    assert!(joining.status().await.unwrap().startup_extras.is_some());
    assert_eq!(joining.read("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_startup_extras_overflow_restarts_join() {
    let mut config = common::fast_config();
    config.startup_extras_capacity = 1;
    let mut cluster = TestCluster::with_config(config);
    cluster.start(1).await.unwrap();
    cluster.activate();

    let mut writes = tokio::task::JoinSet::new();
    for i in 0..200u32 {
        let writer = cluster.node(1);
        writes.spawn(async move { writer.write(format!("key{i}"), format!("value{i}")).await });
    }
    cluster.start(2).await.unwrap();
    cluster.start(3).await.unwrap();

    while let Some(result) = writes.join_next().await {
        result.unwrap().unwrap();
    }
    cluster.wait_for_version(Version(200)).await;
    cluster.assert_converged().await;
    for id in cluster.running() {
        assert_eq!(cluster.status(id).await.startup_extras, None, "node {id}");
        assert_eq!(cluster.read(id, "key199").await.as_deref(), Some("value199"));
    }
}
