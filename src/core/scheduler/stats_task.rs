use crate::core::scheduler::PipelineShared;
use log::{debug, error};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Publishes a stats snapshot every `stats_interval` while running.
pub(crate) fn stats_init(shared: Arc<PipelineShared>) -> crate::error::Result<JoinHandle<()>> {
    let interval = shared.config.stats_interval;
    let result = std::thread::Builder::new()
        .name("stats".to_string())
        .spawn(move || {
            while shared.sleep_while_running(interval) {
                shared.publish_stats();
            }
            debug!("Stats publisher finished.");
        });
    result.map_err(|e| {
        error!("Stats thread exited with error: {e}");
        crate::error::Error::ThreadExited
    })
}
