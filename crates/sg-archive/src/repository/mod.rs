use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::model::{Archive, ArchiveFilter, ArchiveStatus, ArchiveType, Page};

mod memory;
mod postgres;

pub use memory::MemoryArchiveRepository;
pub use postgres::PgArchiveRepository;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Persistence for archive rows. `hash` is unique across all rows and
/// `insert` reports a clash as [`RepositoryError::UniqueViolation`].
///
/// Status updates are conditional on the current status and report whether
/// a row changed.
#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    async fn insert(&self, archive: &Archive) -> RepositoryResult<()>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Archive>>;

    async fn find_by_hash(&self, hash: &str) -> RepositoryResult<Option<Archive>>;

    /// Any non-COMPLETE archive becomes COMPLETE.
    async fn mark_complete(
        &self,
        id: Uuid,
        object_id: &str,
        num_of_samples: i32,
    ) -> RepositoryResult<bool>;

    /// BUILDING to FAILED.
    async fn mark_failed(&self, id: Uuid) -> RepositoryResult<bool>;

    /// FAILED back to BUILDING with a fresh `created_at`, offered at that
    /// same instant, and no attempts.
    async fn restart(&self, id: Uuid, created_at: i64) -> RepositoryResult<bool>;

    /// Bumps `build_attempts` on a BUILDING archive, stamps `offered_at` and
    /// returns the new count.
    async fn record_build_attempt(
        &self,
        id: Uuid,
        offered_at: i64,
    ) -> RepositoryResult<Option<i32>>;

    async fn increment_downloads(&self, id: Uuid) -> RepositoryResult<bool>;

    async fn list(&self, filter: &ArchiveFilter) -> RepositoryResult<Page<Archive>>;

    /// BUILDING archives last offered before `cutoff`, longest waiting first.
    async fn find_building_offered_before(&self, cutoff: i64)
        -> RepositoryResult<Vec<Archive>>;

    /// Most recently created archive of the given type and status.
    async fn find_latest(
        &self,
        archive_type: ArchiveType,
        status: ArchiveStatus,
    ) -> RepositoryResult<Option<Archive>>;

    async fn check_ready(&self) -> RepositoryResult<()>;
}
