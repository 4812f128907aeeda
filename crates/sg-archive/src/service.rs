use sg_core::{metrics, service_config, time};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::ArchiveRuntimeConfig;
use crate::consistency;
use crate::error::ArchiveError;
use crate::fingerprint::SetQueryArchiveHashInfo;
use crate::index::IndexQuery;
use crate::ledger::ArchiveLedger;
use crate::model::{Archive, ArchiveFilter, ArchiveType, MembershipQuery, Page};
use crate::SERVICE_NAME;

/// Entry points used by the HTTP routes and the CLI.
#[derive(Clone)]
pub struct ArchiveService {
    index: Arc<dyn IndexQuery>,
    ledger: ArchiveLedger,
    config: service_config::ServiceConfigHandle,
    download_dir: PathBuf,
}

fn now_seconds() -> Result<i64, ArchiveError> {
    time::unix_seconds()
        .map(|seconds| seconds as i64)
        .map_err(ArchiveError::Internal)
}

fn record_request<T>(archive_type: ArchiveType, result: &Result<T, ArchiveError>) {
    let label = match result {
        Ok(_) => metrics::RESULT_SUCCESS,
        Err(ArchiveError::InconsistentSet { .. }) => "inconsistent",
        Err(ArchiveError::IndexUpdating { .. }) => "index_updating",
        Err(ArchiveError::NotFound(_)) => "not_found",
        Err(_) => metrics::RESULT_ERROR,
    };
    metrics::inc_archive_request(SERVICE_NAME, archive_type.as_str(), label);
}

impl ArchiveService {
    pub fn new(
        index: Arc<dyn IndexQuery>,
        ledger: ArchiveLedger,
        config: service_config::ServiceConfigHandle,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            index,
            ledger,
            config,
            download_dir,
        }
    }

    pub fn ledger(&self) -> &ArchiveLedger {
        &self.ledger
    }

    async fn runtime(&self) -> ArchiveRuntimeConfig {
        ArchiveRuntimeConfig::from_json(&self.config.get().await.config_json)
    }

    /// Returns the archive for the set's current content, creating it and
    /// requesting a build when none exists yet.
    pub async fn get_or_create_set_archive(&self, set_id: Uuid) -> Result<Archive, ArchiveError> {
        let result = self.create_set_archive(set_id).await;
        record_request(ArchiveType::Set, &result);
        result
    }

    async fn create_set_archive(&self, set_id: Uuid) -> Result<Archive, ArchiveError> {
        let runtime = self.runtime().await;
        let timeout = runtime.consistency_timeout();
        let set = tokio::time::timeout(timeout, self.index.get_set_document(set_id))
            .await
            .map_err(|_| ArchiveError::Timeout {
                operation: "set lookup",
                seconds: timeout.as_secs(),
            })?
            .map_err(ArchiveError::Index)?
            .ok_or_else(|| ArchiveError::set_not_found(set_id))?;

        let aggregation = consistency::check(self.index.as_ref(), &set, timeout).await?;
        let hash_info = SetQueryArchiveHashInfo::for_set(&set, &aggregation);
        self.ledger
            .get_or_create(
                &hash_info,
                ArchiveType::Set,
                MembershipQuery::SetTermsLookup { set_id },
                now_seconds()?,
            )
            .await
    }

    /// Archive of the entire index. Refused while the index has been written
    /// to within the configured window.
    pub async fn request_all_archive(&self) -> Result<Archive, ArchiveError> {
        let result = self.create_all_archive().await;
        record_request(ArchiveType::All, &result);
        result
    }

    async fn create_all_archive(&self) -> Result<Archive, ArchiveError> {
        let runtime = self.runtime().await;
        let now = now_seconds()?;
        if let Some(last_updated_millis) = self
            .index
            .latest_update_millis()
            .await
            .map_err(ArchiveError::Index)?
        {
            let window = Duration::from_secs(runtime.updating_window_minutes * 60);
            if is_within_window(now, last_updated_millis, window) {
                return Err(ArchiveError::IndexUpdating {
                    last_updated_millis,
                });
            }
        }

        let timeout = runtime.consistency_timeout();
        let aggregation = tokio::time::timeout(
            timeout,
            self.index.count_and_last_updated(&MembershipQuery::MatchAll),
        )
        .await
        .map_err(|_| ArchiveError::Timeout {
            operation: "index aggregation",
            seconds: timeout.as_secs(),
        })?
        .map_err(ArchiveError::Index)?;
        let hash_info = SetQueryArchiveHashInfo::for_all(&aggregation);
        self.ledger
            .get_or_create(&hash_info, ArchiveType::All, MembershipQuery::MatchAll, now)
            .await
    }

    pub async fn list_archives(&self, filter: &ArchiveFilter) -> Result<Page<Archive>, ArchiveError> {
        self.ledger.list(filter).await
    }

    pub async fn get_completed_archive(&self, id: Uuid) -> Result<Archive, ArchiveError> {
        self.ledger
            .find_completed(id)
            .await?
            .ok_or_else(|| ArchiveError::archive_not_found(id))
    }

    pub async fn latest_all_archive(&self) -> Result<Archive, ArchiveError> {
        self.ledger
            .find_latest_all_archive()
            .await?
            .ok_or_else(|| ArchiveError::NotFound("complete ALL archive".to_string()))
    }

    /// Resolves a COMPLETE archive to its artifact on disk and counts the
    /// download.
    pub async fn open_download(&self, id: Uuid) -> Result<(Archive, PathBuf), ArchiveError> {
        let archive = self.get_completed_archive(id).await?;
        let filename = archive
            .object_id
            .clone()
            .unwrap_or_else(|| archive.filename());
        let path = self.download_dir.join(&filename);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::warn!(archive_id = %id, path = %path.display(), "artifact missing on disk");
            return Err(ArchiveError::NotFound(format!("artifact {filename}")));
        }
        self.ledger.record_download(id).await?;
        Ok((archive, path))
    }

    pub async fn check_ready(&self) -> Result<(), ArchiveError> {
        self.ledger.check_ready().await?;
        self.index.check_ready().await.map_err(ArchiveError::Index)
    }
}

fn is_within_window(now_seconds: i64, last_updated_millis: i64, window: Duration) -> bool {
    let window_millis = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    now_seconds.saturating_mul(1000) - last_updated_millis < window_millis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BuildRequestChannel;
    use crate::model::{ArchiveStatus, SetDocument};
    use crate::repository::MemoryArchiveRepository;
    use crate::test_support::FakeIndex;
    use serde_json::json;

    fn service(index: FakeIndex, repository: MemoryArchiveRepository) -> ArchiveService {
        let ledger = ArchiveLedger::new(Arc::new(repository), BuildRequestChannel::new(16));
        ArchiveService::new(
            Arc::new(index),
            ledger,
            service_config::static_handle(json!({})),
            std::env::temp_dir(),
        )
    }

    fn set(size: i64) -> SetDocument {
        SetDocument {
            set_id: Uuid::new_v4(),
            sqon: json!({"op": "and", "content": []}),
            size,
        }
    }

    #[tokio::test]
    async fn inconsistent_set_creates_no_archive() {
        let declared = set(10);
        let index = FakeIndex::with_objects(&["1", "2", "3", "4", "5", "6", "7"], "t1")
            .with_set(declared.clone());
        let repository = MemoryArchiveRepository::new();
        let service = service(index, repository.clone());

        let err = service
            .get_or_create_set_archive(declared.set_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::InconsistentSet {
                expected: 10,
                actual: 7
            }
        ));
        assert!(repository.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_set_is_not_found() {
        let service = service(FakeIndex::default(), MemoryArchiveRepository::new());
        let err = service
            .get_or_create_set_archive(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn same_set_content_reuses_archive() {
        let declared = set(2);
        let index = FakeIndex::with_objects(&["a", "b"], "t1").with_set(declared.clone());
        let service = service(index, MemoryArchiveRepository::new());

        let first = service.get_or_create_set_archive(declared.set_id).await.unwrap();
        let second = service.get_or_create_set_archive(declared.set_id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ArchiveStatus::Building);
        assert_eq!(first.set_id, Some(declared.set_id));
    }

    #[tokio::test]
    async fn all_archive_waits_for_index_to_settle() {
        let now_millis = now_seconds().unwrap() * 1000;
        let busy = FakeIndex::with_objects(&["a"], "t1").with_latest_update(now_millis - 60_000);
        let err = service(busy, MemoryArchiveRepository::new())
            .request_all_archive()
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::IndexUpdating { .. }));

        let quiet =
            FakeIndex::with_objects(&["a"], "t1").with_latest_update(now_millis - 3_600_000);
        let archive = service(quiet, MemoryArchiveRepository::new())
            .request_all_archive()
            .await
            .unwrap();
        assert_eq!(archive.archive_type, ArchiveType::All);
        assert_eq!(archive.set_id, None);
    }

    #[tokio::test]
    async fn download_requires_complete_archive() {
        let repository = MemoryArchiveRepository::new();
        let service = service(FakeIndex::with_objects(&["a"], "t1"), repository);
        let archive = service.request_all_archive().await.unwrap();

        assert!(matches!(
            service.open_download(archive.id).await,
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn window_is_measured_from_last_update() {
        let window = Duration::from_secs(600);
        assert!(is_within_window(1_000, 999_000, window));
        assert!(!is_within_window(1_000, 0, window));
    }
}
