//! Timeout monitor
//!
//! The only recovery path for crashed workers. UNIQUE(slice_id) means nobody
//! can re-claim a slice whose execution is stuck in CLAIMED/PLACED, so the
//! monitor terminates expired leases: execution goes to COMPLETED with
//! EXECUTOR_TIMEOUT, the slice to COMPLETED with whatever partial fill the
//! execution recorded. Orders stuck IN_PROGRESS (splitting worker died
//! mid-split) are failed over on the same interval.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::TimeoutMonitorConfig;
use crate::context::RequestContext;
use crate::db::Database;
use crate::store::{ExecutionStore, OrderStore};

const WORKER_NAME: &str = "timeout_monitor";

pub struct TimeoutMonitor {
    orders: OrderStore,
    executions: ExecutionStore,
    config: TimeoutMonitorConfig,
    /// Orders IN_PROGRESS longer than this are considered abandoned.
    stuck_order_timeout_minutes: i64,
}

impl TimeoutMonitor {
    pub fn new(
        db: &Database,
        config: TimeoutMonitorConfig,
        stuck_order_timeout_minutes: i64,
    ) -> Self {
        Self {
            orders: OrderStore::new(db.pool().clone()),
            executions: ExecutionStore::new(db.pool().clone()),
            config,
            stuck_order_timeout_minutes,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            check_interval_seconds = self.config.check_interval_seconds,
            stuck_order_timeout_minutes = self.stuck_order_timeout_minutes,
            "Timeout monitor started"
        );
        let interval = Duration::from_secs(self.config.check_interval_seconds);

        loop {
            if super::shutdown_requested(&shutdown) {
                break;
            }

            let ctx = RequestContext::for_worker(WORKER_NAME);
            if let Err(e) = self.check(&ctx).await {
                error!(error = %e, trace_id = %ctx.trace_id, "Timeout monitor error");
            }

            super::idle(&mut shutdown, interval).await;
        }

        info!("Timeout monitor stopped");
    }

    /// One monitor pass. Each expired execution is finalized in its own
    /// transaction with a guard on (status, lease), so running the pass twice
    /// finalizes each execution exactly once.
    pub async fn check(&self, ctx: &RequestContext) -> anyhow::Result<(u64, u64)> {
        let expired = self.executions.find_timed_out().await?;

        let mut failed_over = 0u64;
        for execution in &expired {
            if self.executions.fail_over_timed_out(execution, ctx).await? {
                failed_over += 1;
            }
        }

        let recovered_orders = self
            .orders
            .recover_stuck(self.stuck_order_timeout_minutes, ctx)
            .await?;

        if failed_over > 0 || recovered_orders > 0 {
            warn!(
                failed_over,
                recovered_orders,
                trace_id = %ctx.trace_id,
                "Timeout monitor recovered abandoned work"
            );
        }

        Ok((failed_over, recovered_orders))
    }
}
