use anyhow::Result;
use sg_core::{
    config as env_config, db, elastic, http, logging, metrics, object_store, server,
    service_config,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

pub mod api;
pub mod builder;
pub mod channel;
pub mod config;
pub mod consistency;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod ledger;
pub mod metadata;
pub mod model;
pub mod reaper;
pub mod repository;
pub mod service;
pub mod store;
pub mod worker;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod test_support;

use builder::ArchiveBuilder;
use channel::BuildRequestChannel;
use config::{default_config_json, ArchiveRuntimeConfig};
use error::BuildError;
use index::ElasticIndex;
use ledger::ArchiveLedger;
use reaper::StaleBuildReaper;
use repository::PgArchiveRepository;
use service::ArchiveService;

pub const SERVICE_NAME: &str = "sg-archive";
pub const CONFIG_SERVICE: &str = "archive";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const INDEX_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ArchiveConfig {
    pub addr: SocketAddr,
    pub database: db::DbSettings,
    pub elasticsearch_url: String,
    pub elasticsearch_api_key: Option<String>,
    pub file_index: String,
    pub sets_index: String,
    pub object_store_url: String,
    pub object_store_bucket: String,
    pub object_store_key_prefix: String,
    pub object_store_token: Option<String>,
    pub download_dir: PathBuf,
    pub config_poll_seconds: u64,
}

pub fn load_config() -> Result<ArchiveConfig> {
    Ok(ArchiveConfig {
        addr: env_config::socket_addr_from_env("ARCHIVE_ADDR", "0.0.0.0:8086")?,
        database: db::DbSettings::from_env(10)?,
        elasticsearch_url: env_config::required_env("ELASTICSEARCH_URL")?,
        elasticsearch_api_key: env_config::optional_env("ELASTICSEARCH_API_KEY"),
        file_index: env_config::env_or("ELASTICSEARCH_FILE_INDEX", "file_centric"),
        sets_index: env_config::env_or("ELASTICSEARCH_SETS_INDEX", "arranger-sets"),
        object_store_url: env_config::required_env("OBJECT_STORE_URL")?,
        object_store_bucket: env_config::env_or("OBJECT_STORE_BUCKET", "object.bucket"),
        object_store_key_prefix: env_config::env_or("OBJECT_STORE_KEY_PREFIX", "data"),
        object_store_token: env_config::optional_env("OBJECT_STORE_TOKEN"),
        download_dir: env_config::dir_from_env("ARCHIVE_DOWNLOAD_DIR", "/tmp")?,
        config_poll_seconds: env_config::u64_from_env("ARCHIVE_CONFIG_POLL_SECONDS", 30),
    })
}

/// Everything a process needs to request and build archives.
struct Components {
    service: ArchiveService,
    builder: ArchiveBuilder,
    reaper: StaleBuildReaper,
    channel: BuildRequestChannel,
    config: service_config::ServiceConfigHandle,
    runtime: ArchiveRuntimeConfig,
}

async fn assemble(config: &ArchiveConfig) -> Result<Components> {
    let pool = db::connect(&config.database).await?;
    let config_handle = service_config::watch_service_config(
        pool.clone(),
        CONFIG_SERVICE,
        default_config_json(),
        Duration::from_secs(config.config_poll_seconds),
    )
    .await?;
    let runtime = ArchiveRuntimeConfig::from_json(&config_handle.get().await.config_json);

    let elastic = elastic::ElasticClient::new(
        config.elasticsearch_url.clone(),
        config.elasticsearch_api_key.clone(),
        INDEX_TIMEOUT,
    )?;
    let index: Arc<dyn index::IndexQuery> = Arc::new(ElasticIndex::new(
        elastic,
        config.file_index.clone(),
        config.sets_index.clone(),
    ));
    let store = object_store::S3LikeClient::new(
        config.object_store_url.clone(),
        config.object_store_bucket.clone(),
        config.object_store_key_prefix.clone(),
        config.object_store_token.clone(),
        Duration::from_secs(runtime.download_timeout_seconds),
    )?;

    let channel = BuildRequestChannel::new(runtime.channel_capacity);
    let ledger = ArchiveLedger::new(Arc::new(PgArchiveRepository::new(pool)), channel.clone());
    let builder = ArchiveBuilder::new(
        Arc::clone(&index),
        Arc::new(store),
        ledger.clone(),
        config.download_dir.clone(),
    );
    let service = ArchiveService::new(
        index,
        ledger.clone(),
        config_handle.clone(),
        config.download_dir.clone(),
    );
    Ok(Components {
        service,
        builder,
        reaper: StaleBuildReaper::new(ledger),
        channel,
        config: config_handle,
        runtime,
    })
}

pub async fn run(config: ArchiveConfig) -> Result<()> {
    logging::init(SERVICE_NAME);
    metrics::init(SERVICE_NAME);

    let components = assemble(&config).await?;
    worker::spawn_build_worker(
        components.builder.clone(),
        components.channel.subscribe(),
        components.config.clone(),
        components.runtime.max_concurrent_builds,
    );
    reaper::spawn_reaper(components.reaper.clone(), components.config.clone());

    let router = api::router(api::AppState {
        service: components.service,
    });
    let router = http::apply_standard_layers(router, SERVICE_NAME, REQUEST_TIMEOUT);
    server::serve(config.addr, router).await
}

/// One-off jobs for schedulers that run the binary instead of calling the API.
#[derive(Debug, Clone, Copy)]
pub enum Job {
    /// Re-offer and build stale BUILDING archives.
    Reap,
    /// Request an archive of the whole index and build it.
    BuildAll,
}

/// Runs `job` and then builds, in this process, every request it emitted.
pub async fn run_job(config: ArchiveConfig, job: Job) -> Result<()> {
    logging::init(SERVICE_NAME);
    metrics::init(SERVICE_NAME);

    let components = assemble(&config).await?;
    let mut receiver = components.channel.subscribe();
    match job {
        Job::Reap => {
            let now = sg_core::time::unix_seconds()? as i64;
            let summary = components
                .reaper
                .reap(
                    now,
                    Duration::from_secs(components.runtime.stale_after_seconds),
                    components.runtime.max_build_attempts,
                )
                .await?;
            tracing::info!(
                reoffered = summary.reoffered,
                failed = summary.failed,
                "reap finished"
            );
        }
        Job::BuildAll => {
            let archive = components.service.request_all_archive().await?;
            tracing::info!(archive_id = %archive.id, status = %archive.status, "all archive requested");
        }
    }

    let limits = components.runtime.build_limits();
    loop {
        let request = match receiver.try_recv() {
            Ok(request) => request,
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "build requests dropped before they could run");
                continue;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        };
        match components.builder.build(&request, limits).await {
            Ok(filename) => {
                tracing::info!(archive_id = %request.archive.id, filename = %filename, "archive built")
            }
            Err(BuildError::AlreadyBuilding(archive_id)) => {
                tracing::info!(archive_id = %archive_id, "archive is being built elsewhere, skipping")
            }
            Err(err) => {
                tracing::warn!(archive_id = %request.archive.id, error = %err, "archive build failed")
            }
        }
    }
    Ok(())
}
