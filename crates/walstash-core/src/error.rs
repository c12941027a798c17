use std::path::PathBuf;

use thiserror::Error;
use walstash_storage::StorageError;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A required precondition does not hold (live cluster, missing
    /// tablespace link, concurrent backup already in progress).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Archived data does not match its own metadata (short tar member,
    /// partition count mismatch, decompressor failure).
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("filter '{program}' exited with status {status}")]
    FilterExit { program: String, status: i32 },

    /// A file changed under the partitioner between scan and read. The
    /// backup engine retries the partition once before giving up.
    #[error("file changed during read: {0}")]
    MemberChanged(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ArchiveError {
    /// Whether the segment was simply absent (wal-fetch end-of-archive).
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArchiveError::Storage(StorageError::NotFound(_)))
    }

    /// Process exit code: 0 success, 1 user error, 2 system/transient.
    pub fn exit_code(&self) -> i32 {
        match self {
            ArchiveError::Storage(e) => match e {
                StorageError::NotFound(_) => 1,
                StorageError::Config(_) => 1,
                StorageError::Fatal(_) => 1,
                StorageError::Transient(_)
                | StorageError::Io(_)
                | StorageError::Cancelled => 2,
            },
            ArchiveError::Config(_) | ArchiveError::Precondition(_) => 1,
            ArchiveError::Io(_)
            | ArchiveError::Serialization(_)
            | ArchiveError::Integrity(_)
            | ArchiveError::FilterExit { .. }
            | ArchiveError::MemberChanged(_)
            | ArchiveError::Cancelled
            | ArchiveError::Other(_) => 2,
        }
    }
}
