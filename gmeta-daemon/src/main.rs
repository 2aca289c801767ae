//! gmeta Daemon (`gmetad`)
//!
//! Boots an in-process metastorage cluster over the simulated network, runs a
//! small workload, restarts a node and reports the converged state.

use anyhow::Context;
use clap::Parser;
use gmeta_kernel::{ClusterContext, MetaStorage, OpenedMetaStorage};
use gmeta_model::{MetaStorageConfig, NodeId, StorageConfig};
use gmeta_net_sim::SimNetwork;
use gmeta_storage::LocalMetaStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gmetad", version, about = "gmeta distributed metastorage demo cluster")]
struct Args {
    /// Number of nodes
    #[arg(long, default_value_t = 3)]
    nodes: u64,

    /// Directory for per-node redb files (in-memory when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// History budget in bytes (overrides GMETA_HISTORY_MAX_BYTES)
    #[arg(long)]
    history_max_bytes: Option<u64>,

    /// Number of writes in the workload
    #[arg(long, default_value_t = 20)]
    writes: u32,

    /// Keep serving after the workload until Ctrl+C
    #[arg(long)]
    wait: bool,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Node {
    store: Arc<LocalMetaStore>,
    handle: MetaStorage,
    task: JoinHandle<()>,
}

struct DemoCluster {
    network: SimNetwork,
    cluster: Arc<ClusterContext>,
    config: MetaStorageConfig,
}

impl DemoCluster {
    async fn start(&self, id: NodeId, store: Arc<LocalMetaStore>) -> anyhow::Result<Node> {
        let messenger = Arc::new(self.network.messenger(id));
        let opened = OpenedMetaStorage::open(
            self.config.clone(),
            store.clone(),
            messenger,
            self.cluster.clone(),
        )?;
        let (handle, runner) = opened.into_handle();
        let task = tokio::spawn(runner.run());
        handle.ready().await.with_context(|| format!("{id} failed to join"))?;
        Ok(Node { store, handle, task })
    }

    async fn stop(&self, node: Node) -> anyhow::Result<Arc<LocalMetaStore>> {
        node.handle.close().await;
        node.task.await?;
        Ok(node.store)
    }
}

fn open_store(data_dir: Option<&PathBuf>, id: NodeId) -> anyhow::Result<LocalMetaStore> {
    let config = match data_dir {
        Some(dir) => StorageConfig::File(dir.join(id.to_string()).join("metastorage.redb")),
        None => StorageConfig::InMemory,
    };
    Ok(LocalMetaStore::open_with(&config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    tracing::info!("gmetad v{} starting...", env!("CARGO_PKG_VERSION"));
    anyhow::ensure!(args.nodes > 0, "--nodes must be at least 1");

    let mut config = MetaStorageConfig::from_env()?;
    if let Some(bytes) = args.history_max_bytes {
        config = config.with_history_max_bytes(bytes);
    }

    let demo = DemoCluster {
        network: SimNetwork::new(),
        cluster: Arc::new(ClusterContext::new()),
        config,
    };

    let mut nodes = Vec::new();
    for id in 1..=args.nodes {
        let id = NodeId(id);
        let store = Arc::new(open_store(args.data_dir.as_ref(), id)?);
        nodes.push(demo.start(id, store).await?);
    }
    demo.cluster.activate();

    for i in 0..args.writes {
        let writer = &nodes[i as usize % nodes.len()].handle;
        let version = writer.write(format!("demo/key{}", i % 7), format!("value{i}")).await?;
        tracing::debug!(node = %writer.node(), version = %version, "Write applied");
    }

    // Restart the last node; it rejoins and catches up.
    if nodes.len() > 1 {
        let last = nodes.remove(nodes.len() - 1);
        let id = last.handle.node();
        let store = demo.stop(last).await?;
        nodes[0].handle.write("demo/restarted", id.to_string()).await?;
        nodes.push(demo.start(id, store).await?);
    }

    report(&nodes).await?;

    if args.wait {
        tracing::info!("Cluster ready. Press Ctrl+C to stop.");
        shutdown_signal().await?;
        tracing::info!("Shutdown signal received...");
    }

    for node in nodes {
        demo.stop(node).await?;
    }
    tracing::info!("Cluster stopped");
    Ok(())
}

async fn report(nodes: &[Node]) -> anyhow::Result<()> {
    let mut stamps = Vec::new();
    for node in nodes {
        let status = node.handle.status().await?;
        println!(
            "{:<8} {:<11} latest={:<16} boundary={:<16} records={:<4} mode={:?} digest={}",
            status.node.to_string(),
            status.phase.to_string(),
            status.latest.to_string(),
            status.boundary.to_string(),
            status.retained_records,
            status.join_mode,
            hex::encode(&status.digest.as_bytes()[..4]),
        );
        stamps.push((status.latest, status.digest));
    }
    if stamps.windows(2).all(|w| w[0] == w[1]) {
        println!("converged on {} keys", nodes[0].handle.snapshot().await?.entries.len());
    } else {
        tracing::warn!("Nodes report different state");
    }
    Ok(())
}

fn init_tracing(verbosity: u8) -> anyhow::Result<()> {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
