//! gmeta Kernel
//!
//! Cluster-wide persistent metastorage: every node keeps a full copy of the
//! distributed key space, versions updates identically from one total order
//! of broadcasts, and reconciles with the cluster when it (re)joins.
//!
//! ## Components
//!
//! - `ValueStore` / `HistoryLog`: current values and the bounded update log
//! - `ConflictDetector`: running checksums and divergence checks
//! - `JoinCoordinator`: join state machine plus StartupExtras
//! - `Replica`: persists every change through a `LocalPersistentStore`
//! - `MetaStorage`: handle to the per-node actor

mod actor;
pub mod checksum;
pub mod cluster;
mod error;
pub mod extras;
mod handle;
pub mod history;
pub mod join;
pub mod persistence;
pub mod replica;
pub mod values;

pub use actor::{MetaStorageCmd, NodeStatus};
pub use checksum::{ChainError, ConflictDetector, Verdict};
pub use cluster::ClusterContext;
pub use error::{JoinFailure, MetaStorageError};
pub use extras::{ExtrasOverflow, StartupExtras};
pub use handle::{ActorRunner, MetaStorage, OpenedMetaStorage};
pub use history::{HistoryError, HistoryLog, InsufficientHistory};
pub use join::{JoinCoordinator, JoinMode, JoinPhase};
pub use replica::{OpenReport, Replica};
pub use values::{StoredValue, ValueStore};
