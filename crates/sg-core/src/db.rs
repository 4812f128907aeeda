use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::time::Duration;

use crate::config;

/// Connection settings for the archives database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSettings {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DbSettings {
    /// Reads `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS` and
    /// `DATABASE_ACQUIRE_TIMEOUT_SECONDS`. One-shot commands pass a small
    /// `default_max_connections`; the server a larger one.
    pub fn from_env(default_max_connections: u32) -> Result<Self> {
        let max_connections = config::u64_from_env(
            "DATABASE_MAX_CONNECTIONS",
            u64::from(default_max_connections),
        );
        Ok(Self {
            database_url: config::required_env("DATABASE_URL")?,
            max_connections: u32::try_from(max_connections).unwrap_or(u32::MAX).max(1),
            acquire_timeout: Duration::from_secs(
                config::u64_from_env("DATABASE_ACQUIRE_TIMEOUT_SECONDS", 10).max(1),
            ),
        })
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .acquire_timeout(self.acquire_timeout)
    }
}

pub async fn connect(settings: &DbSettings) -> Result<Pool<Postgres>> {
    let pool = settings
        .pool_options()
        .connect(&settings.database_url)
        .await
        .context("failed to connect to postgres")?;
    tracing::debug!(
        max_connections = settings.max_connections,
        acquire_timeout_secs = settings.acquire_timeout.as_secs(),
        "postgres pool ready"
    );
    Ok(pool)
}
