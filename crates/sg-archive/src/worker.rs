use sg_core::{metrics, service_config};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::builder::ArchiveBuilder;
use crate::config::ArchiveRuntimeConfig;
use crate::error::BuildError;
use crate::model::BuildRequest;
use crate::SERVICE_NAME;

/// Archive ids with a build running in this process.
#[derive(Clone, Default)]
struct InFlight {
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlight {
    /// Returns `None` when a build for `id` is already running.
    fn claim(&self, id: Uuid) -> Option<InFlightClaim> {
        let inserted = match self.ids.lock() {
            Ok(mut ids) => ids.insert(id),
            Err(poisoned) => poisoned.into_inner().insert(id),
        };
        inserted.then(|| InFlightClaim {
            in_flight: self.clone(),
            id,
        })
    }

    fn release(&self, id: Uuid) {
        match self.ids.lock() {
            Ok(mut ids) => ids.remove(&id),
            Err(poisoned) => poisoned.into_inner().remove(&id),
        };
    }
}

/// Releases the archive id when dropped, so a build task that panics or is
/// aborted does not block later requests for the same archive.
struct InFlightClaim {
    in_flight: InFlight,
    id: Uuid,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.in_flight.release(self.id);
    }
}

/// Consumes build requests and runs at most `max_concurrent_builds` builds at
/// once. While all permits are taken the receiver is not polled, so a burst
/// overflows the channel and the reaper picks up what was dropped.
pub fn spawn_build_worker(
    builder: ArchiveBuilder,
    mut receiver: broadcast::Receiver<BuildRequest>,
    config: service_config::ServiceConfigHandle,
    max_concurrent_builds: usize,
) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(max_concurrent_builds.max(1)));
    let in_flight = InFlight::default();
    tokio::spawn(async move {
        loop {
            let request = match receiver.recv().await {
                Ok(request) => request,
                Err(RecvError::Lagged(skipped)) => {
                    metrics::inc_build_requests_dropped(SERVICE_NAME, "lagged", skipped);
                    tracing::warn!(skipped, "build worker lagged, requests dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let archive_id = request.archive.id;
            let Some(claim) = in_flight.claim(archive_id) else {
                tracing::debug!(archive_id = %archive_id, "build already running");
                continue;
            };
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let runtime = ArchiveRuntimeConfig::from_json(&config.get().await.config_json);
            let builder = builder.clone();
            tokio::spawn(async move {
                let _claim = claim;
                let _permit = permit;
                let started = Instant::now();
                let outcome = builder.build(&request, runtime.build_limits()).await;
                let elapsed = started.elapsed();
                match outcome {
                    Ok(filename) => {
                        metrics::record_archive_build(SERVICE_NAME, metrics::RESULT_SUCCESS, elapsed);
                        tracing::info!(
                            archive_id = %archive_id,
                            filename = %filename,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "archive build finished"
                        );
                    }
                    Err(BuildError::AlreadyBuilding(_)) => {
                        metrics::record_archive_build(SERVICE_NAME, metrics::RESULT_SKIPPED, elapsed);
                        tracing::info!(archive_id = %archive_id, "archive is being built elsewhere, skipping");
                    }
                    Err(err) => {
                        metrics::record_archive_build(SERVICE_NAME, metrics::RESULT_ERROR, elapsed);
                        tracing::warn!(archive_id = %archive_id, error = %err, "archive build failed");
                    }
                }
            });
        }
        tracing::info!("build request channel closed, worker stopping");
    })
}
