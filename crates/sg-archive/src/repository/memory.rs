use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ArchiveRepository, RepositoryResult};
use crate::error::RepositoryError;
use crate::model::{
    Archive, ArchiveFilter, ArchiveStatus, ArchiveType, Page, SortDirection, SortField,
};

/// Process-local repository. Hash uniqueness is checked under the write lock,
/// so it serializes concurrent inserts the way the table constraint does.
#[derive(Clone, Default)]
pub struct MemoryArchiveRepository {
    archives: Arc<RwLock<HashMap<Uuid, Archive>>>,
}

impl MemoryArchiveRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.archives.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.archives.read().await.is_empty()
    }

    async fn update<F>(&self, id: Uuid, apply: F) -> bool
    where
        F: FnOnce(&mut Archive) -> bool + Send,
    {
        let mut archives = self.archives.write().await;
        match archives.get_mut(&id) {
            Some(archive) => apply(archive),
            None => false,
        }
    }
}

fn filter_matches(archive: &Archive, filter: &ArchiveFilter) -> bool {
    filter.status.map_or(true, |status| archive.status == status)
        && filter
            .archive_type
            .map_or(true, |archive_type| archive.archive_type == archive_type)
        && filter
            .created_after
            .map_or(true, |after| archive.created_at >= after)
        && filter
            .created_before
            .map_or(true, |before| archive.created_at <= before)
}

fn compare(a: &Archive, b: &Archive, field: SortField) -> Ordering {
    let primary = match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
        SortField::Type => a.archive_type.as_str().cmp(b.archive_type.as_str()),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl ArchiveRepository for MemoryArchiveRepository {
    async fn insert(&self, archive: &Archive) -> RepositoryResult<()> {
        let mut archives = self.archives.write().await;
        if archives.values().any(|existing| existing.hash == archive.hash) {
            return Err(RepositoryError::UniqueViolation(archive.hash.clone()));
        }
        archives.insert(archive.id, archive.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Archive>> {
        Ok(self.archives.read().await.get(&id).cloned())
    }

    async fn find_by_hash(&self, hash: &str) -> RepositoryResult<Option<Archive>> {
        Ok(self
            .archives
            .read()
            .await
            .values()
            .find(|archive| archive.hash == hash)
            .cloned())
    }

    async fn mark_complete(
        &self,
        id: Uuid,
        object_id: &str,
        num_of_samples: i32,
    ) -> RepositoryResult<bool> {
        let object_id = object_id.to_string();
        Ok(self
            .update(id, move |archive| {
                if archive.status == ArchiveStatus::Complete {
                    return false;
                }
                archive.status = ArchiveStatus::Complete;
                archive.object_id = Some(object_id);
                archive.meta.num_of_samples = num_of_samples;
                true
            })
            .await)
    }

    async fn mark_failed(&self, id: Uuid) -> RepositoryResult<bool> {
        Ok(self
            .update(id, |archive| {
                if archive.status != ArchiveStatus::Building {
                    return false;
                }
                archive.status = ArchiveStatus::Failed;
                true
            })
            .await)
    }

    async fn restart(&self, id: Uuid, created_at: i64) -> RepositoryResult<bool> {
        Ok(self
            .update(id, move |archive| {
                if archive.status != ArchiveStatus::Failed {
                    return false;
                }
                archive.status = ArchiveStatus::Building;
                archive.build_attempts = 0;
                archive.created_at = created_at;
                archive.offered_at = created_at;
                true
            })
            .await)
    }

    async fn record_build_attempt(
        &self,
        id: Uuid,
        offered_at: i64,
    ) -> RepositoryResult<Option<i32>> {
        let mut archives = self.archives.write().await;
        Ok(archives
            .get_mut(&id)
            .filter(|archive| archive.status == ArchiveStatus::Building)
            .map(|archive| {
                archive.build_attempts += 1;
                archive.offered_at = offered_at;
                archive.build_attempts
            }))
    }

    async fn increment_downloads(&self, id: Uuid) -> RepositoryResult<bool> {
        Ok(self
            .update(id, |archive| {
                archive.meta.num_of_downloads += 1;
                true
            })
            .await)
    }

    async fn list(&self, filter: &ArchiveFilter) -> RepositoryResult<Page<Archive>> {
        let archives = self.archives.read().await;
        let mut selected: Vec<Archive> = archives
            .values()
            .filter(|archive| filter_matches(archive, filter))
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            let ordering = compare(a, b, filter.sort_field);
            match filter.sort_direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
        let total_elements = selected.len() as i64;
        let content = selected
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.size as usize)
            .collect();
        Ok(Page {
            content,
            total_elements,
            page: filter.page,
            size: filter.size,
        })
    }

    async fn find_building_offered_before(
        &self,
        cutoff: i64,
    ) -> RepositoryResult<Vec<Archive>> {
        let archives = self.archives.read().await;
        let mut stale: Vec<Archive> = archives
            .values()
            .filter(|archive| archive.status == ArchiveStatus::Building && archive.offered_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|archive| (archive.offered_at, archive.id));
        Ok(stale)
    }

    async fn find_latest(
        &self,
        archive_type: ArchiveType,
        status: ArchiveStatus,
    ) -> RepositoryResult<Option<Archive>> {
        let archives = self.archives.read().await;
        Ok(archives
            .values()
            .filter(|archive| archive.archive_type == archive_type && archive.status == status)
            .max_by_key(|archive| archive.created_at)
            .cloned())
    }

    async fn check_ready(&self) -> RepositoryResult<()> {
        Ok(())
    }
}
