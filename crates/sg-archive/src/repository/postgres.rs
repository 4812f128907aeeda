use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{ArchiveRepository, RepositoryResult};
use crate::error::RepositoryError;
use crate::model::{Archive, ArchiveFilter, ArchiveMeta, ArchiveStatus, ArchiveType, Page};

const HASH_CONSTRAINT: &str = "archives_hash_unique";
const ARCHIVE_COLUMNS: &str = "id, status, type, hash, hash_info, set_id, object_id, created_at, \
     build_attempts, offered_at, num_of_downloads, num_of_samples";

#[derive(Clone)]
pub struct PgArchiveRepository {
    pool: Pool<Postgres>,
}

impl PgArchiveRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn archive_from_row(row: &PgRow) -> RepositoryResult<Archive> {
    let status: String = row.try_get("status")?;
    let archive_type: String = row.try_get("type")?;
    Ok(Archive {
        id: row.try_get("id")?,
        status: status.parse().map_err(RepositoryError::InvalidRow)?,
        archive_type: archive_type.parse().map_err(RepositoryError::InvalidRow)?,
        hash: row.try_get("hash")?,
        hash_info: row.try_get("hash_info")?,
        set_id: row.try_get("set_id")?,
        object_id: row.try_get("object_id")?,
        created_at: row.try_get("created_at")?,
        build_attempts: row.try_get("build_attempts")?,
        offered_at: row.try_get("offered_at")?,
        meta: ArchiveMeta {
            num_of_downloads: row.try_get("num_of_downloads")?,
            num_of_samples: row.try_get("num_of_samples")?,
        },
    })
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &ArchiveFilter) {
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(archive_type) = filter.archive_type {
        builder.push(" AND type = ");
        builder.push_bind(archive_type.as_str());
    }
    if let Some(after) = filter.created_after {
        builder.push(" AND created_at >= ");
        builder.push_bind(after);
    }
    if let Some(before) = filter.created_before {
        builder.push(" AND created_at <= ");
        builder.push_bind(before);
    }
}

#[async_trait]
impl ArchiveRepository for PgArchiveRepository {
    async fn insert(&self, archive: &Archive) -> RepositoryResult<()> {
        let result = sqlx::query(
            "INSERT INTO singularity.archives \
             (id, status, type, hash, hash_info, set_id, object_id, created_at, build_attempts, \
              offered_at, num_of_downloads, num_of_samples) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(archive.id)
        .bind(archive.status.as_str())
        .bind(archive.archive_type.as_str())
        .bind(&archive.hash)
        .bind(&archive.hash_info)
        .bind(archive.set_id)
        .bind(&archive.object_id)
        .bind(archive.created_at)
        .bind(archive.build_attempts)
        .bind(archive.offered_at)
        .bind(archive.meta.num_of_downloads)
        .bind(archive.meta.num_of_samples)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation() && db_err.constraint() == Some(HASH_CONSTRAINT) =>
            {
                Err(RepositoryError::UniqueViolation(archive.hash.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Archive>> {
        let row = sqlx::query(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM singularity.archives WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(archive_from_row).transpose()
    }

    async fn find_by_hash(&self, hash: &str) -> RepositoryResult<Option<Archive>> {
        let row = sqlx::query(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM singularity.archives WHERE hash = $1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(archive_from_row).transpose()
    }

    async fn mark_complete(
        &self,
        id: Uuid,
        object_id: &str,
        num_of_samples: i32,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE singularity.archives \
             SET status = 'COMPLETE', object_id = $2, num_of_samples = $3 \
             WHERE id = $1 AND status <> 'COMPLETE'",
        )
        .bind(id)
        .bind(object_id)
        .bind(num_of_samples)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE singularity.archives SET status = 'FAILED' \
             WHERE id = $1 AND status = 'BUILDING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restart(&self, id: Uuid, created_at: i64) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE singularity.archives \
             SET status = 'BUILDING', build_attempts = 0, created_at = $2, offered_at = $2 \
             WHERE id = $1 AND status = 'FAILED'",
        )
        .bind(id)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_build_attempt(
        &self,
        id: Uuid,
        offered_at: i64,
    ) -> RepositoryResult<Option<i32>> {
        let attempts = sqlx::query_scalar::<_, i32>(
            "UPDATE singularity.archives \
             SET build_attempts = build_attempts + 1, offered_at = $2 \
             WHERE id = $1 AND status = 'BUILDING' \
             RETURNING build_attempts",
        )
        .bind(id)
        .bind(offered_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn increment_downloads(&self, id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE singularity.archives SET num_of_downloads = num_of_downloads + 1 \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: &ArchiveFilter) -> RepositoryResult<Page<Archive>> {
        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM singularity.archives WHERE 1=1",
        );
        push_filter(&mut count, filter);
        let total_elements: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ARCHIVE_COLUMNS} FROM singularity.archives WHERE 1=1"
        ));
        push_filter(&mut select, filter);
        select.push(format!(
            " ORDER BY {} {}, id",
            filter.sort_field.column(),
            filter.sort_direction.keyword()
        ));
        select.push(" LIMIT ");
        select.push_bind(i64::from(filter.size));
        select.push(" OFFSET ");
        select.push_bind(filter.offset());

        let rows = select.build().fetch_all(&self.pool).await?;
        let content = rows
            .iter()
            .map(archive_from_row)
            .collect::<RepositoryResult<Vec<_>>>()?;
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
        let rows = sqlx::query(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM singularity.archives \
             WHERE status = 'BUILDING' AND offered_at < $1 \
             ORDER BY offered_at ASC, id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(archive_from_row).collect()
    }

    async fn find_latest(
        &self,
        archive_type: ArchiveType,
        status: ArchiveStatus,
    ) -> RepositoryResult<Option<Archive>> {
        let row = sqlx::query(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM singularity.archives \
             WHERE type = $1 AND status = $2 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(archive_type.as_str())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(archive_from_row).transpose()
    }

    async fn check_ready(&self) -> RepositoryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::SetQueryArchiveHashInfo;
    use serde_json::json;

    async fn repository() -> PgArchiveRepository {
        let settings = sg_core::db::DbSettings::from_env(4).expect("DATABASE_URL");
        let pool = sg_core::db::connect(&settings).await.expect("db");
        sg_core::migrations::run(&pool).await.expect("migrations");
        PgArchiveRepository::new(pool)
    }

    fn archive(tag: &str) -> Archive {
        let info = SetQueryArchiveHashInfo {
            sqon: json!({ "tag": tag, "nonce": Uuid::new_v4().to_string() }),
            size: 1,
            last_updated: "t".to_string(),
        };
        Archive::building(&info, ArchiveType::Set, Some(Uuid::new_v4()), 100)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn duplicate_hash_is_reported_as_unique_violation() {
        let repo = repository().await;
        let first = archive("dup");
        repo.insert(&first).await.expect("insert");

        let mut second = archive("dup");
        second.hash = first.hash.clone();
        let err = repo.insert(&second).await.expect_err("duplicate");
        assert!(matches!(err, RepositoryError::UniqueViolation(_)));

        let found = repo.find_by_hash(&first.hash).await.expect("find").expect("row");
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn completion_is_applied_once() {
        let repo = repository().await;
        let row = archive("complete");
        repo.insert(&row).await.expect("insert");

        assert!(repo.mark_complete(row.id, "files.tar.gz", 3).await.expect("first"));
        assert!(!repo.mark_complete(row.id, "other.tar.gz", 9).await.expect("second"));

        let stored = repo.find_by_id(row.id).await.expect("find").expect("row");
        assert_eq!(stored.status, ArchiveStatus::Complete);
        assert_eq!(stored.object_id.as_deref(), Some("files.tar.gz"));
        assert_eq!(stored.meta.num_of_samples, 3);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn list_filters_by_status_and_window() {
        let repo = repository().await;
        let mut row = archive("list");
        row.created_at = 4_000_000_000;
        repo.insert(&row).await.expect("insert");

        let page = repo
            .list(&ArchiveFilter {
                status: Some(ArchiveStatus::Building),
                created_after: Some(4_000_000_000),
                created_before: Some(4_000_000_000),
                size: 10,
                ..ArchiveFilter::default()
            })
            .await
            .expect("list");
        assert!(page.content.iter().any(|archive| archive.id == row.id));
        assert!(page.total_elements >= 1);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn build_attempt_moves_offered_at() {
        let repo = repository().await;
        let mut row = archive("offer");
        row.created_at = 3_000_000_000;
        row.offered_at = 3_000_000_000;
        repo.insert(&row).await.expect("insert");

        let attempts = repo
            .record_build_attempt(row.id, 3_000_000_500)
            .await
            .expect("attempt");
        assert_eq!(attempts, Some(1));

        let stale = repo
            .find_building_offered_before(3_000_000_100)
            .await
            .expect("stale");
        assert!(stale.iter().all(|archive| archive.id != row.id));
        let stored = repo.find_by_id(row.id).await.expect("find").expect("row");
        assert_eq!(stored.offered_at, 3_000_000_500);
        assert_eq!(stored.created_at, 3_000_000_000);
    }
}
