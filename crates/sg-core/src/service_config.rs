use anyhow::Result;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: String,
    pub version: i64,
    pub config_json: Value,
}

#[derive(Debug, Clone)]
pub struct ServiceConfigSnapshot {
    pub version: i64,
    pub config_json: Value,
}

/// Shared view of a service's runtime config; refreshed in the background by
/// [`watch_service_config`].
#[derive(Clone)]
pub struct ServiceConfigHandle {
    state: Arc<RwLock<ServiceConfigSnapshot>>,
}

impl ServiceConfigHandle {
    pub async fn get(&self) -> ServiceConfigSnapshot {
        self.state.read().await.clone()
    }
}

pub fn static_handle(config_json: Value) -> ServiceConfigHandle {
    let snapshot = ServiceConfigSnapshot {
        version: 0,
        config_json,
    };
    ServiceConfigHandle {
        state: Arc::new(RwLock::new(snapshot)),
    }
}

pub async fn load_service_config(
    pool: &Pool<Postgres>,
    service: &str,
) -> Result<Option<ServiceConfig>> {
    let row = sqlx::query(
        "SELECT service, version, config_json FROM singularity.service_configs WHERE service = $1",
    )
    .bind(service)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = row {
        Ok(Some(ServiceConfig {
            service: row.try_get("service")?,
            version: row.try_get("version")?,
            config_json: row.try_get("config_json")?,
        }))
    } else {
        Ok(None)
    }
}

/// Inserts `config_json` as version 1 unless the service already has a row.
/// Returns whether a row was written.
pub async fn seed_service_config(
    pool: &Pool<Postgres>,
    service: &str,
    config_json: Value,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO singularity.service_configs (service, version, config_json) \
         VALUES ($1, 1, $2) \
         ON CONFLICT (service) DO NOTHING",
    )
    .bind(service)
    .bind(Json(config_json))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn watch_service_config(
    pool: Pool<Postgres>,
    service: &'static str,
    default_config: Value,
    poll_interval: Duration,
) -> Result<ServiceConfigHandle> {
    let initial = load_service_config(&pool, service).await?;
    let snapshot = ServiceConfigSnapshot {
        version: initial.as_ref().map(|cfg| cfg.version).unwrap_or(0),
        config_json: initial
            .map(|cfg| cfg.config_json)
            .unwrap_or(default_config),
    };

    let state = Arc::new(RwLock::new(snapshot));
    let state_ref = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            time::sleep(poll_interval).await;
            match load_service_config(&pool, service).await {
                Ok(Some(cfg)) => {
                    let mut guard = state_ref.write().await;
                    if cfg.version != guard.version {
                        *guard = ServiceConfigSnapshot {
                            version: cfg.version,
                            config_json: cfg.config_json,
                        };
                        tracing::info!(service = service, version = guard.version, "service config updated");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(service = service, error = %err, "service config poll failed");
                }
            }
        }
    });

    Ok(ServiceConfigHandle { state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn static_handle_returns_seeded_snapshot() {
        let handle = static_handle(json!({ "reaper": { "enabled": false } }));
        let snapshot = handle.get().await;
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.config_json["reaper"]["enabled"], json!(false));
    }
}
