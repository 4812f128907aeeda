use std::sync::Arc;
use uuid::Uuid;

use crate::channel::BuildRequestChannel;
use crate::error::{ArchiveError, RepositoryError};
use crate::fingerprint::SetQueryArchiveHashInfo;
use crate::model::{
    Archive, ArchiveFilter, ArchiveStatus, ArchiveType, BuildRequest, MembershipQuery, Page,
};
use crate::repository::ArchiveRepository;

const INSERT_ATTEMPTS: usize = 2;

/// Owns every archive state transition. Creation is deduplicated by the
/// repository's unique hash; whoever wins the insert emits the build request.
#[derive(Clone)]
pub struct ArchiveLedger {
    repository: Arc<dyn ArchiveRepository>,
    channel: BuildRequestChannel,
}

impl ArchiveLedger {
    pub fn new(repository: Arc<dyn ArchiveRepository>, channel: BuildRequestChannel) -> Self {
        Self {
            repository,
            channel,
        }
    }

    pub fn channel(&self) -> &BuildRequestChannel {
        &self.channel
    }

    pub async fn get_or_create(
        &self,
        hash_info: &SetQueryArchiveHashInfo,
        archive_type: ArchiveType,
        membership_query: MembershipQuery,
        now: i64,
    ) -> Result<Archive, ArchiveError> {
        let set_id = match membership_query {
            MembershipQuery::SetTermsLookup { set_id } => Some(set_id),
            MembershipQuery::MatchAll => None,
        };
        let hash = hash_info.hash();

        for _ in 0..INSERT_ATTEMPTS {
            let archive = Archive::building(hash_info, archive_type, set_id, now);
            match self.repository.insert(&archive).await {
                Ok(()) => {
                    tracing::info!(
                        archive_id = %archive.id,
                        archive_type = %archive_type,
                        hash = %archive.hash,
                        "archive created"
                    );
                    self.channel.emit(BuildRequest {
                        archive: archive.clone(),
                        membership_query,
                    });
                    return Ok(archive);
                }
                Err(RepositoryError::UniqueViolation(_)) => {
                    if let Some(existing) = self.repository.find_by_hash(&hash).await? {
                        return self.resume(existing, membership_query, now).await;
                    }
                    // removed between our insert and lookup; try once more
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ArchiveError::Vanished(hash))
    }

    /// Existing archives are returned as they are, except FAILED ones which
    /// are put back to BUILDING and offered for another build.
    async fn resume(
        &self,
        existing: Archive,
        membership_query: MembershipQuery,
        now: i64,
    ) -> Result<Archive, ArchiveError> {
        if existing.status != ArchiveStatus::Failed {
            tracing::debug!(archive_id = %existing.id, status = %existing.status, "archive exists");
            return Ok(existing);
        }
        if !self.repository.restart(existing.id, now).await? {
            return self
                .repository
                .find_by_id(existing.id)
                .await?
                .ok_or_else(|| ArchiveError::archive_not_found(existing.id));
        }
        let restarted = self
            .repository
            .find_by_id(existing.id)
            .await?
            .ok_or_else(|| ArchiveError::archive_not_found(existing.id))?;
        tracing::info!(archive_id = %restarted.id, "failed archive restarted");
        self.channel.emit(BuildRequest {
            archive: restarted.clone(),
            membership_query,
        });
        Ok(restarted)
    }

    /// Idempotent; returns false when the archive was already COMPLETE.
    pub async fn mark_complete(
        &self,
        id: Uuid,
        object_id: &str,
        num_of_samples: i32,
    ) -> Result<bool, ArchiveError> {
        let updated = self
            .repository
            .mark_complete(id, object_id, num_of_samples)
            .await?;
        if updated {
            tracing::info!(archive_id = %id, object_id, num_of_samples, "archive complete");
        } else {
            tracing::debug!(archive_id = %id, "archive already complete");
        }
        Ok(updated)
    }

    pub async fn find_completed(&self, id: Uuid) -> Result<Option<Archive>, ArchiveError> {
        Ok(self
            .repository
            .find_by_id(id)
            .await?
            .filter(|archive| archive.status == ArchiveStatus::Complete))
    }

    pub async fn list(&self, filter: &ArchiveFilter) -> Result<Page<Archive>, ArchiveError> {
        Ok(self.repository.list(filter).await?)
    }

    /// BUILDING archives nobody has offered since `cutoff`.
    pub async fn find_stale_building(&self, cutoff: i64) -> Result<Vec<Archive>, ArchiveError> {
        Ok(self.repository.find_building_offered_before(cutoff).await?)
    }

    /// Counts a re-offer made at `now`. `None` once the archive left BUILDING.
    pub async fn record_build_attempt(
        &self,
        id: Uuid,
        now: i64,
    ) -> Result<Option<i32>, ArchiveError> {
        Ok(self.repository.record_build_attempt(id, now).await?)
    }

    pub async fn mark_failed(&self, id: Uuid) -> Result<bool, ArchiveError> {
        let updated = self.repository.mark_failed(id).await?;
        if updated {
            tracing::warn!(archive_id = %id, "archive marked failed");
        }
        Ok(updated)
    }

    pub async fn find_latest_all_archive(&self) -> Result<Option<Archive>, ArchiveError> {
        Ok(self
            .repository
            .find_latest(ArchiveType::All, ArchiveStatus::Complete)
            .await?)
    }

    pub async fn record_download(&self, id: Uuid) -> Result<(), ArchiveError> {
        self.repository.increment_downloads(id).await?;
        Ok(())
    }

    pub async fn check_ready(&self) -> Result<(), ArchiveError> {
        Ok(self.repository.check_ready().await?)
    }
}
