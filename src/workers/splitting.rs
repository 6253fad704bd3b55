//! Splitting worker
//!
//! Drains PENDING orders into fully-materialized slice sets. Claiming flips
//! the order to IN_PROGRESS under a row lock; the slice insert and the
//! COMPLETED flip then commit together, so a COMPLETED order always has its
//! full slice set. Any failure in between marks the order FAILED with the
//! error summary as skip_reason.

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::SplittingWorkerConfig;
use crate::context::RequestContext;
use crate::core_types::{generate_request_id, generate_slice_id};
use crate::db::Database;
use crate::models::{Order, OrderType};
use crate::planner::calculate_split_schedule;
use crate::store::{NewSlice, OrderStore, SliceStore};

const WORKER_NAME: &str = "splitting_worker";

pub struct SplittingWorker {
    pool: PgPool,
    orders: OrderStore,
    config: SplittingWorkerConfig,
}

impl SplittingWorker {
    pub fn new(db: &Database, config: SplittingWorkerConfig) -> Self {
        Self {
            pool: db.pool().clone(),
            orders: OrderStore::new(db.pool().clone()),
            config,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            batch_size = self.config.batch_size,
            "Splitting worker started"
        );
        let interval = Duration::from_secs(self.config.poll_interval_seconds);

        loop {
            if super::shutdown_requested(&shutdown) {
                break;
            }

            let ctx = RequestContext::for_worker(WORKER_NAME);

            match self
                .orders
                .claim_pending_for_split(self.config.batch_size, &ctx)
                .await
            {
                Ok(orders) if orders.is_empty() => {
                    super::idle(&mut shutdown, interval).await;
                }
                Ok(orders) => {
                    info!(
                        count = orders.len(),
                        trace_id = %ctx.trace_id,
                        "Found pending orders"
                    );
                    // A claimed order is always driven to COMPLETED or FAILED,
                    // even when shutdown arrives mid-batch.
                    for order in &orders {
                        self.process_order(order).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, trace_id = %ctx.trace_id, "Splitting worker loop error");
                    super::idle(&mut shutdown, interval).await;
                }
            }
        }

        info!("Splitting worker stopped");
    }

    /// Split one claimed order; on failure mark it FAILED.
    pub async fn process_order(&self, order: &Order) -> bool {
        // Slices inherit the parent order's origin fields.
        let order_ctx = RequestContext::inherited(
            &order.origin.trace_id,
            &order.origin.trace_source,
            &order.origin.request_id,
            &order.origin.request_source,
            &format!("PULSE_BACKGROUND:{}", WORKER_NAME),
        );

        info!(
            order_id = %order.id,
            total_quantity = order.total_quantity,
            num_splits = order.num_splits,
            trace_id = %order_ctx.trace_id,
            "Processing order for splitting"
        );

        match self.split_order(order, &order_ctx).await {
            Ok(created) => {
                info!(
                    order_id = %order.id,
                    slices_created = created,
                    trace_id = %order_ctx.trace_id,
                    "Order splitting completed"
                );
                true
            }
            Err(e) => {
                error!(
                    order_id = %order.id,
                    error = %e,
                    trace_id = %order_ctx.trace_id,
                    "Order splitting failed"
                );
                if let Err(update_err) = self
                    .orders
                    .mark_failed(&order.id, &format!("Splitting error: {}", e), &order_ctx)
                    .await
                {
                    error!(
                        order_id = %order.id,
                        error = %update_err,
                        "Failed to mark order as FAILED"
                    );
                }
                false
            }
        }
    }

    async fn split_order(&self, order: &Order, ctx: &RequestContext) -> anyhow::Result<u64> {
        let plan = calculate_split_schedule(
            order.created_at,
            order.total_quantity,
            order.num_splits,
            order.duration_minutes,
            order.randomize,
        )?;

        let slices: Vec<NewSlice> = plan
            .iter()
            .map(|s| NewSlice {
                id: generate_slice_id(),
                order_id: order.id.clone(),
                instrument: order.instrument.clone(),
                side: order.side,
                quantity: s.quantity,
                sequence_number: s.sequence_number,
                scheduled_at: s.scheduled_at,
                order_type: OrderType::Market,
                limit_price: None,
                product_type: "CNC".to_string(),
                validity: "DAY".to_string(),
                // fresh per slice, for async-worker traces
                request_id: generate_request_id(),
            })
            .collect();

        let mut tx = self.pool.begin().await?;
        let created = SliceStore::insert_batch(&mut tx, &slices).await?;
        if created != order.num_splits as u64 {
            anyhow::bail!("expected {} slices, created {}", order.num_splits, created);
        }
        OrderStore::mark_split_complete_in(&mut tx, &order.id, ctx).await?;
        tx.commit().await?;

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSettings;
    use crate::models::{NewOrder, QueueStatus, Side, SliceStatus};

    async fn test_db() -> Database {
        let db = Database::connect(&StoreSettings {
            host: "localhost".to_string(),
            port: 5432,
            user: "pulse".to_string(),
            password: "pulse123".to_string(),
            name: "pulse_db".to_string(),
            pool_size: 4,
        })
        .await
        .expect("requires PostgreSQL");
        db.ensure_schema().await.expect("schema");
        db
    }

    fn worker_config() -> SplittingWorkerConfig {
        SplittingWorkerConfig {
            poll_interval_seconds: 1,
            batch_size: 10,
        }
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_split_produces_full_slice_set() {
        let db = test_db().await;
        let orders = OrderStore::new(db.pool().clone());
        let slices = SliceStore::new(db.pool().clone());
        let ctx = RequestContext::for_worker("test");

        let order = orders
            .create(
                &NewOrder {
                    instrument: "NSE:RELIANCE".to_string(),
                    side: Side::Buy,
                    total_quantity: 100,
                    num_splits: 5,
                    duration_minutes: 60,
                    randomize: false,
                    order_unique_key: format!("split-{}", generate_request_id()),
                },
                &ctx,
            )
            .await
            .unwrap();

        let worker = SplittingWorker::new(&db, worker_config());
        let claimed = orders.claim_pending_for_split(10, &ctx).await.unwrap();
        let target = claimed.iter().find(|o| o.id == order.id).expect("claimed");
        assert!(worker.process_order(target).await);

        let refreshed = orders.get_by_id(&order.id).await.unwrap().unwrap();
        assert_eq!(refreshed.queue_status, QueueStatus::Completed);
        assert!(refreshed.split_completed_at.is_some());

        let created = slices.list_by_order(&order.id).await.unwrap();
        assert_eq!(created.len(), 5);
        assert_eq!(created.iter().map(|s| s.quantity).sum::<i32>(), 100);
        for (i, s) in created.iter().enumerate() {
            assert_eq!(s.sequence_number as usize, i + 1);
            assert_eq!(s.status, SliceStatus::Pending);
            assert!(s.scheduled_at >= refreshed.created_at);
        }
    }
}
