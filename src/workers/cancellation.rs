//! Parent-order cancellation
//!
//! Invoked externally when an order is cancelled. PENDING slices are skipped
//! outright; EXECUTING slices get a best-effort broker cancel (recorded as a
//! CANCEL_REQUEST event whether it succeeds or not) before execution and
//! slice are marked SKIPPED. The PENDING/EXECUTING filter makes repeated
//! invocations no-ops.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::context::RequestContext;
use crate::db::Database;
use crate::models::{BrokerEventType, NewBrokerEvent, SliceStatus};
use crate::store::{BrokerEventStore, ExecutionStore, SliceStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CancellationOutcome {
    pub skipped_slices: u32,
    pub cancelled_executions: u32,
}

pub struct CancellationHandler {
    slices: SliceStore,
    executions: ExecutionStore,
    events: BrokerEventStore,
    broker: Arc<dyn BrokerAdapter>,
}

impl CancellationHandler {
    pub fn new(db: &Database, broker: Arc<dyn BrokerAdapter>) -> Self {
        Self {
            slices: SliceStore::new(db.pool().clone()),
            executions: ExecutionStore::new(db.pool().clone()),
            events: BrokerEventStore::new(db.pool().clone()),
            broker,
        }
    }

    pub async fn cancel_order(
        &self,
        order_id: &str,
        ctx: &RequestContext,
    ) -> anyhow::Result<CancellationOutcome> {
        let targets = self.slices.cancellable_by_order(order_id).await?;

        if targets.is_empty() {
            info!(order_id, trace_id = %ctx.trace_id, "No slices to cancel");
            return Ok(CancellationOutcome::default());
        }

        info!(
            order_id,
            count = targets.len(),
            trace_id = %ctx.trace_id,
            "Found slices to cancel"
        );

        let mut outcome = CancellationOutcome::default();

        for slice in &targets {
            match slice.status {
                SliceStatus::Pending => {
                    if self.slices.skip(&slice.id, ctx).await? {
                        outcome.skipped_slices += 1;
                    }
                }
                SliceStatus::Executing => {
                    let Some(execution) = self.executions.get_by_slice_id(&slice.id).await? else {
                        // Claim raced with cancellation; the slice alone is skipped.
                        if self.slices.skip(&slice.id, ctx).await? {
                            outcome.skipped_slices += 1;
                        }
                        continue;
                    };

                    if let Some(broker_order_id) = execution.broker_order_id.clone() {
                        let started = Instant::now();
                        let result = self.broker.cancel(&broker_order_id, ctx).await;
                        let elapsed_ms = started.elapsed().as_millis() as i32;

                        let mut event = NewBrokerEvent::attempt(
                            BrokerEventType::CancelRequest,
                            1,
                            &execution.attempt_id,
                            &execution.executor_id,
                            self.broker.name(),
                        );
                        event.broker_order_id = Some(broker_order_id.clone());
                        event.response_time_ms = Some(elapsed_ms);

                        match &result {
                            Ok(reply) => {
                                event.is_success = true;
                                event.broker_status = Some(reply.status);
                                event.broker_message = reply.message.clone();
                                event.filled_quantity = Some(reply.filled_quantity);
                                info!(
                                    slice_id = %slice.id,
                                    broker_order_id = %broker_order_id,
                                    status = %reply.status,
                                    trace_id = %ctx.trace_id,
                                    "Cancelled order at broker"
                                );
                                outcome.cancelled_executions += 1;
                            }
                            Err(e) => {
                                event.error_code = Some("CANCEL_FAILED".to_string());
                                event.error_message = Some(e.to_string());
                                warn!(
                                    slice_id = %slice.id,
                                    broker_order_id = %broker_order_id,
                                    error = %e,
                                    trace_id = %ctx.trace_id,
                                    "Failed to cancel order at broker"
                                );
                            }
                        }

                        self.events
                            .append(&execution.id, &slice.id, &event, ctx)
                            .await?;
                    }

                    // Skipped regardless of broker cancel outcome.
                    self.executions.mark_skipped(&execution.id).await?;
                    if self.slices.skip(&slice.id, ctx).await? {
                        outcome.skipped_slices += 1;
                    }
                }
                _ => {}
            }
        }

        info!(
            order_id,
            skipped_slices = outcome.skipped_slices,
            cancelled_executions = outcome.cancelled_executions,
            trace_id = %ctx.trace_id,
            "Order cancellation handled"
        );

        Ok(outcome)
    }
}
