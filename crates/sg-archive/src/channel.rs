use sg_core::metrics;
use tokio::sync::broadcast;

use crate::model::BuildRequest;
use crate::SERVICE_NAME;

/// Best-effort fan-out of build requests. Nothing here is durable; archives
/// whose request is lost stay BUILDING until the reaper offers them again.
#[derive(Clone)]
pub struct BuildRequestChannel {
    sender: broadcast::Sender<BuildRequest>,
}

impl BuildRequestChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Never blocks. Returns the number of subscribers that will see the
    /// request; zero means it was dropped.
    pub fn emit(&self, request: BuildRequest) -> usize {
        let archive_id = request.archive.id;
        match self.sender.send(request) {
            Ok(receivers) => {
                tracing::debug!(archive_id = %archive_id, receivers, "build request emitted");
                receivers
            }
            Err(_) => {
                metrics::inc_build_requests_dropped(SERVICE_NAME, "no_consumer", 1);
                tracing::warn!(archive_id = %archive_id, "no build consumer attached, request dropped");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildRequest> {
        self.sender.subscribe()
    }
}
