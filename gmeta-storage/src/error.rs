use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key {0:?} collides with the reserved namespace")]
    ReservedKey(String),

    #[error("Checkpoint read lock belongs to a different store")]
    ForeignLock,
}
