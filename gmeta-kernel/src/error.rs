use gmeta_net_types::MessengerError;
use gmeta_storage::StorageError;
use thiserror::Error;

/// Why a join ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinFailure {
    #[error("Joining node has conflicting distributed metastorage data")]
    ConflictingData,

    #[error("Joining node has a longer distributed metastorage history than the active cluster")]
    JoinerAhead,

    #[error("Join protocol violation: {0}")]
    Protocol(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Messenger failure: {0}")]
    Messenger(String),

    #[error("Gave up joining after {0} rounds")]
    Exhausted(u32),
}

#[derive(Debug, Error)]
pub enum MetaStorageError {
    #[error("Failed to perform distributed metastorage operation: cluster is not active")]
    ClusterNotActive,

    #[error("Node has not finished joining the cluster")]
    NotReady,

    #[error("Joining node has conflicting distributed metastorage data")]
    ConflictingData,

    #[error("Joining node has a longer distributed metastorage history than the active cluster")]
    JoinerAhead,

    #[error("Local distributed metastorage is corrupt: {0}")]
    CorruptionDetected(String),

    #[error("Join failed: {0}")]
    JoinFailed(JoinFailure),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Metastorage closed")]
    Closed,
}

impl From<JoinFailure> for MetaStorageError {
    fn from(failure: JoinFailure) -> Self {
        match failure {
            JoinFailure::ConflictingData => MetaStorageError::ConflictingData,
            JoinFailure::JoinerAhead => MetaStorageError::JoinerAhead,
            other => MetaStorageError::JoinFailed(other),
        }
    }
}
