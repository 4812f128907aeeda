use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("archive with hash {0} already exists")]
    UniqueViolation(String),
    #[error("invalid archive row: {0}")]
    InvalidRow(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("set is inconsistent with the index: expected {expected} records, found {actual}")]
    InconsistentSet { expected: i64, actual: i64 },
    #[error("{0} not found")]
    NotFound(String),
    #[error("index is being updated, last update {last_updated_millis} ms")]
    IndexUpdating { last_updated_millis: i64 },
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },
    #[error("archive with hash {0} disappeared during creation")]
    Vanished(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("index error: {0}")]
    Index(#[source] anyhow::Error),
    #[error(transparent)]
    Internal(anyhow::Error),
}

impl ArchiveError {
    pub fn archive_not_found(id: Uuid) -> Self {
        Self::NotFound(format!("archive {id}"))
    }

    pub fn set_not_found(id: Uuid) -> Self {
        Self::NotFound(format!("set {id}"))
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to download object {object_id}: {source}")]
    Download {
        object_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("index error: {0}")]
    Index(#[source] anyhow::Error),
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },
    #[error("ledger error: {0}")]
    Ledger(#[from] ArchiveError),
    #[error("archive {0} is already being built by another worker")]
    AlreadyBuilding(Uuid),
}
