use sg_core::{metrics, service_config, time};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::ArchiveRuntimeConfig;
use crate::error::ArchiveError;
use crate::ledger::ArchiveLedger;
use crate::model::BuildRequest;
use crate::SERVICE_NAME;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub reoffered: u64,
    pub failed: u64,
}

/// Re-offers archives stuck in BUILDING. An archive is stuck once it has gone
/// `timeout` without being offered, and gets `max_build_attempts` re-offers
/// before it is marked FAILED.
#[derive(Clone)]
pub struct StaleBuildReaper {
    ledger: ArchiveLedger,
}

impl StaleBuildReaper {
    pub fn new(ledger: ArchiveLedger) -> Self {
        Self { ledger }
    }

    pub async fn reap(
        &self,
        now: i64,
        timeout: Duration,
        max_build_attempts: i32,
    ) -> Result<ReapSummary, ArchiveError> {
        let cutoff = now - i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        let stale = self.ledger.find_stale_building(cutoff).await?;
        let mut summary = ReapSummary::default();

        for archive in stale {
            let membership_query = match archive.membership_query() {
                Some(query) if archive.build_attempts < max_build_attempts => query,
                _ => {
                    if self.ledger.mark_failed(archive.id).await? {
                        metrics::inc_archives_failed(SERVICE_NAME);
                        summary.failed += 1;
                    }
                    continue;
                }
            };
            let Some(attempts) = self.ledger.record_build_attempt(archive.id, now).await? else {
                // completed or failed since the query ran
                continue;
            };
            tracing::info!(archive_id = %archive.id, attempts, "re-offering stale archive");
            let mut archive = archive;
            archive.build_attempts = attempts;
            archive.offered_at = now;
            self.ledger.channel().emit(BuildRequest {
                archive,
                membership_query,
            });
            summary.reoffered += 1;
        }

        metrics::inc_stale_archives_reoffered(SERVICE_NAME, summary.reoffered);
        Ok(summary)
    }
}

pub fn spawn_reaper(
    reaper: StaleBuildReaper,
    config: service_config::ServiceConfigHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let runtime = ArchiveRuntimeConfig::from_json(&config.get().await.config_json);
            if runtime.reaper_enabled {
                match time::unix_seconds() {
                    Ok(now) => {
                        let result = reaper
                            .reap(
                                now as i64,
                                Duration::from_secs(runtime.stale_after_seconds),
                                runtime.max_build_attempts,
                            )
                            .await;
                        match result {
                            Ok(summary) if summary.reoffered > 0 || summary.failed > 0 => {
                                tracing::info!(
                                    reoffered = summary.reoffered,
                                    failed = summary.failed,
                                    "stale archives reaped"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "stale archive reap failed");
                            }
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "clock unavailable, reap skipped"),
                }
            }
            tokio::time::sleep(Duration::from_secs(runtime.reaper_interval_seconds)).await;
        }
    })
}
