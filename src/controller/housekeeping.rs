use crate::controller::ControllerInner;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

impl ControllerInner {
    /// Periodic pass publishing the retained server-status message when
    /// any tracked field changed. Runs until shutdown.
    pub(crate) async fn housekeeping_runner(
        inner: Arc<ControllerInner>,
        housekeeping_shutdown: CancellationToken,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(inner.config.status_interval_secs));

        loop {
            tokio::select! {
                biased;
                _ = housekeeping_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = inner.server_status_update().await {
                        error!("Error in status housekeeping: {e}");
                    }
                }
            }
        }
    }
}
