//! gmeta Storage
//!
//! The local persistent store contract used by the distributed metastorage,
//! the reserved key namespace, and a redb implementation.

mod error;
pub mod keys;
pub mod lock;
pub mod meta_store;
pub mod store;

pub use error::StorageError;
pub use keys::{LocalKey, ReservedKey, ReservedNamespace};
pub use lock::{CheckpointLock, CheckpointReadGuard, CheckpointWriteGuard};
pub use meta_store::LocalMetaStore;
pub use store::{BatchOp, LocalPersistentStore, WriteBatch};
