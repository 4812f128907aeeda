use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, Pool, Postgres};

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Brings the schema up to date and returns the newest version it knows.
pub async fn run(pool: &Pool<Postgres>) -> Result<i64> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to apply database migrations")?;
    let version = latest_version().unwrap_or_default();
    tracing::info!(
        schema_version = version,
        migrations = MIGRATOR.iter().count(),
        "schema up to date"
    );
    Ok(version)
}

pub fn latest_version() -> Option<i64> {
    MIGRATOR.iter().map(|migration| migration.version).max()
}
