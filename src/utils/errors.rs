//! Custom error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive database error: {0}")]
    Database(#[from] redb::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Archive walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Malformed entry identifier: {0}")]
    EntryId(String),

    #[error("Malformed source key: {0}")]
    SourceKey(String),

    #[error("No such folder: {0}")]
    FolderNotFound(String),

    #[error("No such store: {0}")]
    StoreNotFound(String),

    #[error("No such user: {0}")]
    UserNotFound(String),
}

// redb reports every operation with its own error type; funnel them all
// through the unified redb::Error so callers can use `?` directly.
impl From<redb::DatabaseError> for BackupError {
    fn from(e: redb::DatabaseError) -> Self {
        BackupError::Database(e.into())
    }
}

impl From<redb::TransactionError> for BackupError {
    fn from(e: redb::TransactionError) -> Self {
        BackupError::Database(e.into())
    }
}

impl From<redb::TableError> for BackupError {
    fn from(e: redb::TableError) -> Self {
        BackupError::Database(e.into())
    }
}

impl From<redb::StorageError> for BackupError {
    fn from(e: redb::StorageError) -> Self {
        BackupError::Database(e.into())
    }
}

impl From<redb::CommitError> for BackupError {
    fn from(e: redb::CommitError) -> Self {
        BackupError::Database(e.into())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
