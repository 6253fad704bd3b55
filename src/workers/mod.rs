//! Background workers
//!
//! Each worker is an infinite loop of: acquire batch, process, sleep. Workers
//! are mutually oblivious; all coordination happens through the store's row
//! locks and unique constraints. A shutdown signal is observed between
//! iterations; a claimed batch is always finished so nothing is left stuck in
//! an intermediate state on a clean exit.

pub mod cancellation;
pub mod execution;
pub mod splitting;
pub mod timeout_monitor;

pub use cancellation::{CancellationHandler, CancellationOutcome};
pub use execution::ExecutionWorker;
pub use splitting::SplittingWorker;
pub use timeout_monitor::TimeoutMonitor;

use std::time::Duration;

use tokio::sync::watch;

/// Sleep for `interval`, waking early when shutdown is signalled.
pub(crate) async fn idle(shutdown: &mut watch::Receiver<bool>, interval: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = shutdown.changed() => {}
    }
}

pub(crate) fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}
