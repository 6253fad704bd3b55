//! Execution worker
//!
//! Drives each due slice from PENDING to COMPLETED exactly once across a
//! fleet of workers, any of which may crash at any instant. The claim is an
//! atomic lease (row lock + UNIQUE(slice_id) execution insert); before every
//! broker call the worker re-verifies ownership with a conditional UPDATE
//! that also extends the lease. A worker that loses its lease abandons
//! silently: the timeout monitor owns recovery, workers never steal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{BrokerAdapter, BrokerError, BrokerOrderReply, PlaceOrderRequest};
use crate::config::ExecutionWorkerConfig;
use crate::context::RequestContext;
use crate::core_types::generate_trace_id;
use crate::db::Database;
use crate::models::{
    BrokerEventType, BrokerOrderStatus, Execution, ExecutionResult, NewBrokerEvent, OrderSlice,
    OrderType,
};
use crate::store::{BrokerEventStore, ClaimedSlice, ExecutionStore, FinalState, StoreError};

const WORKER_NAME: &str = "execution_worker";
const PLACEMENT_RETRY_DELAY: Duration = Duration::from_secs(5);

enum PlaceOutcome {
    Placed(BrokerOrderReply),
    LostOwnership,
    Failed(BrokerError),
}

enum MonitorOutcome {
    Terminal(BrokerOrderReply),
    /// Monitoring wall clock expired; carries the last known broker state.
    TimedOut(BrokerOrderReply),
    LostOwnership,
}

pub struct ExecutionWorker {
    executions: ExecutionStore,
    events: BrokerEventStore,
    broker: Arc<dyn BrokerAdapter>,
    executor_id: String,
    config: ExecutionWorkerConfig,
}

impl ExecutionWorker {
    pub fn new(
        db: &Database,
        broker: Arc<dyn BrokerAdapter>,
        config: ExecutionWorkerConfig,
        worker_index: usize,
    ) -> Self {
        Self {
            executions: ExecutionStore::new(db.pool().clone()),
            events: BrokerEventStore::new(db.pool().clone()),
            broker,
            executor_id: generate_executor_id(worker_index),
            config,
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            executor_id = %self.executor_id,
            poll_interval_seconds = self.config.poll_interval_seconds,
            batch_size = self.config.batch_size,
            executor_timeout_minutes = self.config.executor_timeout_minutes,
            execution_timeout_minutes = self.config.execution_timeout_minutes,
            max_placement_attempts = self.config.max_placement_attempts,
            "Execution worker started"
        );
        let interval = Duration::from_secs(self.config.poll_interval_seconds);

        loop {
            if super::shutdown_requested(&shutdown) {
                break;
            }

            let ctx = RequestContext::for_worker(WORKER_NAME);

            match self
                .executions
                .claim_due_slices(
                    self.config.batch_size,
                    &self.executor_id,
                    self.config.executor_timeout_minutes,
                    &ctx,
                )
                .await
            {
                Ok(claimed) if claimed.is_empty() => {
                    super::idle(&mut shutdown, interval).await;
                }
                Ok(claimed) => {
                    info!(
                        count = claimed.len(),
                        executor_id = %self.executor_id,
                        trace_id = %ctx.trace_id,
                        "Claimed due slices"
                    );
                    for item in &claimed {
                        self.process_slice(item).await;
                    }
                }
                Err(e) => {
                    error!(
                        error = %e,
                        executor_id = %self.executor_id,
                        "Execution worker loop error"
                    );
                    super::idle(&mut shutdown, interval).await;
                }
            }
        }

        info!(executor_id = %self.executor_id, "Execution worker stopped");
    }

    /// Process one claimed slice to a terminal state (or silent abandonment).
    pub async fn process_slice(&self, claimed: &ClaimedSlice) {
        let source = format!("PULSE_BACKGROUND:{}", WORKER_NAME);
        // The slice's request_id threads the order's audit trail through the
        // async worker; the trace is fresh per execution.
        let exec_ctx = RequestContext::new(
            generate_trace_id(),
            source.clone(),
            claimed.slice.request_id.clone(),
            source.clone(),
            source,
        );

        info!(
            execution_id = %claimed.execution.id,
            slice_id = %claimed.slice.id,
            attempt_id = %claimed.execution.attempt_id,
            executor_id = %self.executor_id,
            trace_id = %exec_ctx.trace_id,
            "Execution claimed"
        );

        if let Err(e) = self.execute_slice(claimed, &exec_ctx).await {
            error!(
                execution_id = %claimed.execution.id,
                slice_id = %claimed.slice.id,
                error = %e,
                trace_id = %exec_ctx.trace_id,
                "Slice execution failed"
            );

            let result = classify_unexpected(&e);
            let state = FinalState {
                broker_order_status: None,
                filled_quantity: None,
                average_price: None,
                execution_result: result,
                error_code: Some("EXECUTION_FAILED".to_string()),
                error_message: Some(e.to_string()),
            };
            if let Err(update_err) = self
                .executions
                .finalize_with_slice(&claimed.execution.id, &claimed.slice.id, &state)
                .await
            {
                error!(
                    execution_id = %claimed.execution.id,
                    error = %update_err,
                    "Failed to finalize execution after error"
                );
            }
        }
    }

    async fn execute_slice(
        &self,
        claimed: &ClaimedSlice,
        ctx: &RequestContext,
    ) -> anyhow::Result<()> {
        let slice = &claimed.slice;
        let execution = &claimed.execution;

        if let Err(reason) = validate_slice(slice) {
            warn!(
                slice_id = %slice.id,
                reason = %reason,
                trace_id = %ctx.trace_id,
                "Slice failed validation"
            );
            let state = FinalState {
                broker_order_status: None,
                filled_quantity: None,
                average_price: None,
                execution_result: ExecutionResult::ValidationFailed,
                error_code: Some("VALIDATION_FAILED".to_string()),
                error_message: Some(reason),
            };
            self.executions
                .finalize_with_slice(&execution.id, &slice.id, &state)
                .await?;
            return Ok(());
        }

        let request = PlaceOrderRequest::from_slice(slice);

        let reply = match self.place_with_retry(execution, slice, &request, ctx).await? {
            PlaceOutcome::Placed(reply) => reply,
            PlaceOutcome::LostOwnership => {
                warn!(
                    execution_id = %execution.id,
                    slice_id = %slice.id,
                    trace_id = %ctx.trace_id,
                    "Lost ownership during placement"
                );
                return Ok(());
            }
            PlaceOutcome::Failed(e) => {
                let state = FinalState {
                    broker_order_status: None,
                    filled_quantity: None,
                    average_price: None,
                    execution_result: ExecutionResult::BrokerRejected,
                    error_code: Some(e.error_code().to_string()),
                    error_message: Some(e.to_string()),
                };
                self.executions
                    .finalize_with_slice(&execution.id, &slice.id, &state)
                    .await?;
                return Ok(());
            }
        };

        self.executions
            .mark_placed(
                &execution.id,
                &reply.broker_order_id,
                reply.status,
                reply.filled_quantity,
                reply.average_price,
            )
            .await?;

        info!(
            execution_id = %execution.id,
            broker_order_id = %reply.broker_order_id,
            status = %reply.status,
            trace_id = %ctx.trace_id,
            "Order placed with broker"
        );

        let (final_reply, timed_out) = if reply.status.is_terminal() {
            (reply, false)
        } else {
            match self.monitor(execution, slice, reply, ctx).await? {
                MonitorOutcome::Terminal(r) => (r, false),
                MonitorOutcome::TimedOut(r) => (r, true),
                MonitorOutcome::LostOwnership => {
                    // No terminal write: the timeout monitor will recover.
                    warn!(
                        execution_id = %execution.id,
                        slice_id = %slice.id,
                        trace_id = %ctx.trace_id,
                        "Lost ownership during monitoring"
                    );
                    return Ok(());
                }
            }
        };

        let result = map_execution_result(
            final_reply.status,
            final_reply.filled_quantity,
            slice.quantity,
            timed_out,
        );
        let state = FinalState {
            broker_order_status: Some(final_reply.status),
            filled_quantity: Some(final_reply.filled_quantity),
            average_price: final_reply.average_price,
            execution_result: result,
            error_code: None,
            error_message: None,
        };
        self.executions
            .finalize_with_slice(&execution.id, &slice.id, &state)
            .await?;

        info!(
            execution_id = %execution.id,
            slice_id = %slice.id,
            execution_result = %result,
            filled_quantity = final_reply.filled_quantity,
            trace_id = %ctx.trace_id,
            "Slice execution completed"
        );

        Ok(())
    }

    /// Place the order, retrying network-shaped failures with a fixed delay.
    /// Broker rejections stop immediately. Ownership is re-verified before
    /// every attempt.
    async fn place_with_retry(
        &self,
        execution: &Execution,
        slice: &OrderSlice,
        request: &PlaceOrderRequest,
        ctx: &RequestContext,
    ) -> Result<PlaceOutcome, StoreError> {
        let max_attempts = self.config.max_placement_attempts.max(1);

        for attempt in 1..=max_attempts {
            if !self
                .executions
                .verify_and_extend(
                    &execution.id,
                    &self.executor_id,
                    self.config.executor_timeout_minutes,
                )
                .await?
            {
                return Ok(PlaceOutcome::LostOwnership);
            }

            let started = Instant::now();
            let result = self.broker.place(request, ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as i32;

            let mut event = NewBrokerEvent::attempt(
                BrokerEventType::PlaceOrder,
                attempt as i32,
                &execution.attempt_id,
                &self.executor_id,
                self.broker.name(),
            );
            event.request_payload = serde_json::to_value(request).ok();
            event.response_time_ms = Some(elapsed_ms);
            match &result {
                Ok(reply) => {
                    event.is_success = true;
                    event.broker_order_id = Some(reply.broker_order_id.clone());
                    event.broker_status = Some(reply.status);
                    event.broker_message = reply.message.clone();
                    event.filled_quantity = Some(reply.filled_quantity);
                    event.pending_quantity = Some(reply.pending_quantity);
                    event.average_price = reply.average_price;
                }
                Err(e) => {
                    event.error_code = Some(e.error_code().to_string());
                    event.error_message = Some(e.to_string());
                }
            }
            self.events
                .append(&execution.id, &slice.id, &event, ctx)
                .await?;

            let attempt_error = result.as_ref().err().map(|e| e.error_code().to_string());
            self.executions
                .record_placement_attempt(&execution.id, attempt as i32, attempt_error.as_deref())
                .await?;

            match result {
                Ok(reply) => return Ok(PlaceOutcome::Placed(reply)),
                Err(e) if !e.is_network() => {
                    error!(
                        execution_id = %execution.id,
                        error = %e,
                        trace_id = %ctx.trace_id,
                        "Broker rejected order"
                    );
                    return Ok(PlaceOutcome::Failed(e));
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        execution_id = %execution.id,
                        max_attempts,
                        error = %e,
                        trace_id = %ctx.trace_id,
                        "Max placement attempts reached"
                    );
                    return Ok(PlaceOutcome::Failed(e));
                }
                Err(e) => {
                    warn!(
                        execution_id = %execution.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        trace_id = %ctx.trace_id,
                        "Placement failed, retrying"
                    );
                    tokio::time::sleep(PLACEMENT_RETRY_DELAY).await;
                }
            }
        }

        Ok(PlaceOutcome::LostOwnership)
    }

    /// Poll the broker until a terminal status or the monitoring wall clock
    /// expires. Single poll failures are recorded and retried next interval.
    async fn monitor(
        &self,
        execution: &Execution,
        slice: &OrderSlice,
        placement: BrokerOrderReply,
        ctx: &RequestContext,
    ) -> Result<MonitorOutcome, StoreError> {
        let broker_order_id = placement.broker_order_id.clone();
        let deadline =
            Utc::now() + chrono::Duration::minutes(self.config.execution_timeout_minutes);
        let poll_interval = Duration::from_secs(self.config.poll_interval_seconds);
        let mut last = placement;

        loop {
            if Utc::now() >= deadline {
                warn!(
                    execution_id = %execution.id,
                    broker_order_id = %broker_order_id,
                    timeout_minutes = self.config.execution_timeout_minutes,
                    trace_id = %ctx.trace_id,
                    "Monitoring timeout reached, cancelling at broker"
                );
                self.cancel_on_timeout(execution, slice, &broker_order_id, &mut last, ctx)
                    .await?;
                return Ok(MonitorOutcome::TimedOut(last));
            }

            if !self
                .executions
                .verify_and_extend(
                    &execution.id,
                    &self.executor_id,
                    self.config.executor_timeout_minutes,
                )
                .await?
            {
                return Ok(MonitorOutcome::LostOwnership);
            }

            let started = Instant::now();
            let result = self.broker.poll(&broker_order_id, ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as i32;

            let mut event = NewBrokerEvent::attempt(
                BrokerEventType::StatusPoll,
                1,
                &execution.attempt_id,
                &self.executor_id,
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
                    event.pending_quantity = Some(reply.pending_quantity);
                    event.average_price = reply.average_price;
                }
                Err(e) => {
                    event.error_code = Some("POLL_FAILED".to_string());
                    event.error_message = Some(e.to_string());
                }
            }
            self.events
                .append(&execution.id, &slice.id, &event, ctx)
                .await?;

            match result {
                Ok(reply) => {
                    self.executions
                        .record_poll(
                            &execution.id,
                            reply.status,
                            reply.filled_quantity,
                            reply.average_price,
                        )
                        .await?;

                    let terminal = reply.status.is_terminal();
                    if reply.filled_quantity > 0 && !terminal {
                        info!(
                            execution_id = %execution.id,
                            broker_order_id = %broker_order_id,
                            filled_quantity = reply.filled_quantity,
                            pending_quantity = reply.pending_quantity,
                            trace_id = %ctx.trace_id,
                            "Order partially filled"
                        );
                    }

                    last = reply;
                    if terminal {
                        info!(
                            execution_id = %execution.id,
                            broker_order_id = %broker_order_id,
                            status = %last.status,
                            filled_quantity = last.filled_quantity,
                            trace_id = %ctx.trace_id,
                            "Order reached terminal status"
                        );
                        return Ok(MonitorOutcome::Terminal(last));
                    }
                }
                Err(e) => {
                    warn!(
                        execution_id = %execution.id,
                        broker_order_id = %broker_order_id,
                        error = %e,
                        trace_id = %ctx.trace_id,
                        "Failed to poll order status"
                    );
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Best-effort broker cancel when the monitoring wall clock expires.
    /// Folds any acknowledged state into `last`; failures leave the last
    /// known status in place.
    async fn cancel_on_timeout(
        &self,
        execution: &Execution,
        slice: &OrderSlice,
        broker_order_id: &str,
        last: &mut BrokerOrderReply,
        ctx: &RequestContext,
    ) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = self.broker.cancel(broker_order_id, ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as i32;

        let mut event = NewBrokerEvent::attempt(
            BrokerEventType::CancelRequest,
            1,
            &execution.attempt_id,
            &self.executor_id,
            self.broker.name(),
        );
        event.broker_order_id = Some(broker_order_id.to_string());
        event.response_time_ms = Some(elapsed_ms);
        match &result {
            Ok(reply) => {
                event.is_success = true;
                event.broker_status = Some(reply.status);
                event.broker_message = reply.message.clone();
                event.filled_quantity = Some(reply.filled_quantity);
            }
            Err(e) => {
                event.error_code = Some("CANCEL_FAILED".to_string());
                event.error_message = Some(e.to_string());
            }
        }
        self.events
            .append(&execution.id, &slice.id, &event, ctx)
            .await?;

        match result {
            Ok(reply) => {
                last.status = reply.status;
                // Cancel acknowledgements may omit fills; never regress them.
                if reply.filled_quantity >= last.filled_quantity {
                    last.filled_quantity = reply.filled_quantity;
                    last.average_price = reply.average_price.or(last.average_price);
                }
            }
            Err(e) => {
                error!(
                    execution_id = %execution.id,
                    broker_order_id = %broker_order_id,
                    error = %e,
                    trace_id = %ctx.trace_id,
                    "Failed to cancel order on monitoring timeout"
                );
            }
        }

        Ok(())
    }
}

fn generate_executor_id(worker_index: usize) -> String {
    match std::env::var("POD_NAME") {
        Ok(pod) => format!("{}-worker-{}", pod, worker_index),
        Err(_) => {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("exec-worker-{}", &suffix[..8])
        }
    }
}

fn validate_slice(slice: &OrderSlice) -> Result<(), String> {
    if slice.quantity <= 0 {
        return Err("Invalid quantity".to_string());
    }
    if slice.order_type == OrderType::Limit && slice.limit_price.is_none() {
        return Err("Limit price required for LIMIT orders".to_string());
    }
    Ok(())
}

/// Map the final broker status to an execution result.
///
/// A monitoring timeout always yields PARTIAL_SUCCESS regardless of the last
/// known broker status; otherwise COMPLETE distinguishes full from partial
/// fills, REJECTED maps to BROKER_REJECTED, and CANCELLED/EXPIRED both map to
/// PARTIAL_SUCCESS.
fn map_execution_result(
    status: BrokerOrderStatus,
    filled_quantity: i32,
    requested_quantity: i32,
    monitoring_timed_out: bool,
) -> ExecutionResult {
    if monitoring_timed_out {
        return ExecutionResult::PartialSuccess;
    }
    match status {
        BrokerOrderStatus::Complete => {
            if filled_quantity == requested_quantity {
                ExecutionResult::Success
            } else {
                ExecutionResult::PartialSuccess
            }
        }
        BrokerOrderStatus::Rejected => ExecutionResult::BrokerRejected,
        BrokerOrderStatus::Cancelled
        | BrokerOrderStatus::Expired
        | BrokerOrderStatus::Pending
        | BrokerOrderStatus::Open
        | BrokerOrderStatus::PartiallyFilled => ExecutionResult::PartialSuccess,
    }
}

fn classify_unexpected(e: &anyhow::Error) -> ExecutionResult {
    let msg = e.to_string().to_lowercase();
    if msg.contains("validation") || msg.contains("invalid") {
        ExecutionResult::ValidationFailed
    } else {
        ExecutionResult::BrokerRejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn slice_with(order_type: OrderType, limit_price: Option<Decimal>) -> OrderSlice {
        OrderSlice {
            id: "os1".to_string(),
            order_id: "ord1".to_string(),
            instrument: "NSE:RELIANCE".to_string(),
            side: crate::models::Side::Buy,
            quantity: 100,
            sequence_number: 1,
            status: crate::models::SliceStatus::Executing,
            scheduled_at: Utc::now(),
            order_type,
            limit_price,
            product_type: "CNC".to_string(),
            validity: "DAY".to_string(),
            filled_quantity: 0,
            average_price: None,
            request_id: "r1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_limit_requires_price() {
        assert!(validate_slice(&slice_with(OrderType::Market, None)).is_ok());
        assert!(validate_slice(&slice_with(OrderType::Limit, None)).is_err());
        assert!(
            validate_slice(&slice_with(OrderType::Limit, Some(Decimal::new(12400, 1)))).is_ok()
        );
    }

    #[test]
    fn test_validate_rejects_bad_quantity() {
        let mut slice = slice_with(OrderType::Market, None);
        slice.quantity = 0;
        assert!(validate_slice(&slice).is_err());
    }

    // One test per row of the result-mapping table.

    #[test]
    fn test_map_complete_full_fill() {
        assert_eq!(
            map_execution_result(BrokerOrderStatus::Complete, 100, 100, false),
            ExecutionResult::Success
        );
    }

    #[test]
    fn test_map_complete_partial_fill() {
        assert_eq!(
            map_execution_result(BrokerOrderStatus::Complete, 50, 100, false),
            ExecutionResult::PartialSuccess
        );
    }

    #[test]
    fn test_map_rejected() {
        assert_eq!(
            map_execution_result(BrokerOrderStatus::Rejected, 0, 100, false),
            ExecutionResult::BrokerRejected
        );
    }

    #[test]
    fn test_map_cancelled() {
        assert_eq!(
            map_execution_result(BrokerOrderStatus::Cancelled, 0, 100, false),
            ExecutionResult::PartialSuccess
        );
    }

    #[test]
    fn test_map_expired() {
        assert_eq!(
            map_execution_result(BrokerOrderStatus::Expired, 50, 100, false),
            ExecutionResult::PartialSuccess
        );
    }

    #[test]
    fn test_map_monitoring_timeout_wins() {
        for status in [
            BrokerOrderStatus::Open,
            BrokerOrderStatus::Complete,
            BrokerOrderStatus::Cancelled,
        ] {
            assert_eq!(
                map_execution_result(status, 100, 100, true),
                ExecutionResult::PartialSuccess
            );
        }
    }

    #[test]
    fn test_classify_unexpected() {
        assert_eq!(
            classify_unexpected(&anyhow::anyhow!("Invalid quantity")),
            ExecutionResult::ValidationFailed
        );
        assert_eq!(
            classify_unexpected(&anyhow::anyhow!("connection reset by broker")),
            ExecutionResult::BrokerRejected
        );
    }

    #[test]
    fn test_executor_id_fallback_format() {
        let id = generate_executor_id(0);
        assert!(id.contains("worker"));
    }
}
