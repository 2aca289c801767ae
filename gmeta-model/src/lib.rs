//! gmeta Model
//!
//! Pure data types for the distributed metastorage, decoupled from
//! storage engines and network stacks.

pub mod config;
pub mod message;
pub mod record;
pub mod types;
pub mod version;

pub use config::{ConfigError, JoinConfig, MetaStorageConfig, StorageConfig};
pub use message::{ClusterMessage, JoinReply, JoinRequest, JoinResponse, RejectReason};
pub use record::{Entry, HistoryOp, HistoryRecord, Mutation, Snapshot};
pub use types::{Hash, NodeId};
pub use version::{Version, VersionStamp};
