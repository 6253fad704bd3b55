//! Execution persistence: leases, heartbeats, terminal writes
//!
//! UNIQUE(slice_id) is the hard interlock for exactly-once execution: a
//! second claim on the same slice fails at insert and the losing worker
//! abandons. Ownership checks are single conditional UPDATEs so there is no
//! window between verification and lease extension.

use rust_decimal::Decimal;
use sqlx::{Acquire, PgPool, Row, postgres::PgRow};

use super::StoreError;
use super::slices::row_to_slice;
use crate::context::RequestContext;
use crate::core_types::{generate_attempt_id, generate_execution_id};
use crate::models::{
    BrokerOrderStatus, Execution, ExecutionResult, ExecutionStatus, OrderSlice,
};

/// A slice claimed for execution together with its freshly inserted
/// execution record.
#[derive(Debug, Clone)]
pub struct ClaimedSlice {
    pub slice: OrderSlice,
    pub execution: Execution,
}

/// Terminal fields written when an execution completes.
#[derive(Debug, Clone)]
pub struct FinalState {
    pub broker_order_status: Option<BrokerOrderStatus>,
    pub filled_quantity: Option<i32>,
    pub average_price: Option<Decimal>,
    pub execution_result: ExecutionResult,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

pub struct ExecutionStore {
    pool: PgPool,
}

impl ExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim up to `batch_size` due slices atomically.
    ///
    /// One transaction selects PENDING slices whose `scheduled_at` has
    /// passed, with exclusive row locks (skipping rows held by peers). Each
    /// slice is then flipped to EXECUTING and given an execution row inside a
    /// savepoint, so a UNIQUE(slice_id) violation abandons only that slice.
    pub async fn claim_due_slices(
        &self,
        batch_size: i64,
        executor_id: &str,
        lease_minutes: i64,
        ctx: &RequestContext,
    ) -> Result<Vec<ClaimedSlice>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM order_slices
            WHERE status = 'PENDING' AND scheduled_at <= NOW()
            ORDER BY scheduled_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());

        for row in &rows {
            let mut slice = row_to_slice(row)?;
            let mut sp = tx.begin().await?;

            let flipped = sqlx::query(
                r#"
                UPDATE order_slices
                SET status = 'EXECUTING', updated_at = NOW()
                WHERE id = $1 AND status = 'PENDING'
                "#,
            )
            .bind(&slice.id)
            .execute(&mut *sp)
            .await?;

            if flipped.rows_affected() == 0 {
                sp.rollback().await?;
                continue;
            }

            let execution_id = generate_execution_id();
            let attempt_id = generate_attempt_id();

            let inserted = sqlx::query(
                r#"
                INSERT INTO order_slice_executions (
                    id, slice_id, attempt_id, executor_id,
                    executor_claimed_at, executor_timeout_at, last_heartbeat_at,
                    execution_status, request_id
                )
                VALUES ($1, $2, $3, $4, NOW(), NOW() + INTERVAL '1 minute' * $5,
                        NOW(), 'CLAIMED', $6)
                RETURNING *
                "#,
            )
            .bind(&execution_id)
            .bind(&slice.id)
            .bind(&attempt_id)
            .bind(executor_id)
            .bind(lease_minutes as f64)
            .bind(&slice.request_id)
            .fetch_one(&mut *sp)
            .await;

            match inserted {
                Ok(exec_row) => {
                    let execution = row_to_execution(&exec_row)?;
                    sp.commit().await?;
                    slice.status = crate::models::SliceStatus::Executing;
                    claimed.push(ClaimedSlice { slice, execution });
                }
                Err(e) if StoreError::is_unique_violation(&e) => {
                    // Another worker is mid-claim; abandon this slice only.
                    sp.rollback().await?;
                    tracing::debug!(
                        slice_id = %slice.id,
                        trace_id = %ctx.trace_id,
                        "Slice already has an execution, abandoning claim"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    /// Atomically verify ownership and extend the lease.
    ///
    /// Succeeds only while this worker holds a live lease on a non-terminal
    /// execution; on success `last_heartbeat_at` is stamped and the lease
    /// extended by `lease_minutes`. A `false` return means ownership is lost
    /// and the caller must abandon without further writes.
    pub async fn verify_and_extend(
        &self,
        execution_id: &str,
        executor_id: &str,
        lease_minutes: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE order_slice_executions
            SET last_heartbeat_at = NOW(),
                executor_timeout_at = NOW() + INTERVAL '1 minute' * $3,
                updated_at = NOW()
            WHERE id = $1
              AND executor_id = $2
              AND executor_timeout_at > NOW()
              AND execution_status IN ('CLAIMED', 'PLACED')
            "#,
        )
        .bind(execution_id)
        .bind(executor_id)
        .bind(lease_minutes as f64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_by_slice_id(&self, slice_id: &str) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query("SELECT * FROM order_slice_executions WHERE slice_id = $1")
            .bind(slice_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_execution(&r)).transpose()
    }

    /// Record a successful placement: PLACED plus the broker's view.
    pub async fn mark_placed(
        &self,
        execution_id: &str,
        broker_order_id: &str,
        broker_order_status: BrokerOrderStatus,
        filled_quantity: i32,
        average_price: Option<Decimal>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE order_slice_executions
            SET execution_status = 'PLACED',
                broker_order_id = $2,
                broker_order_status = $3,
                filled_quantity = $4,
                average_price = COALESCE($5, average_price),
                placement_confirmed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND execution_status = 'CLAIMED'
            "#,
        )
        .bind(execution_id)
        .bind(broker_order_id)
        .bind(broker_order_status.as_str())
        .bind(filled_quantity)
        .bind(average_price)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Refresh broker-visible state after a status poll.
    pub async fn record_poll(
        &self,
        execution_id: &str,
        broker_order_status: BrokerOrderStatus,
        filled_quantity: i32,
        average_price: Option<Decimal>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE order_slice_executions
            SET broker_order_status = $2,
                filled_quantity = $3,
                average_price = COALESCE($4, average_price),
                last_broker_poll_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND execution_status = 'PLACED'
            "#,
        )
        .bind(execution_id)
        .bind(broker_order_status.as_str())
        .bind(filled_quantity)
        .bind(average_price)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Track one placement attempt (success or failure).
    pub async fn record_placement_attempt(
        &self,
        execution_id: &str,
        attempt_number: i32,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE order_slice_executions
            SET placement_attempts = $2, last_attempt_at = NOW(),
                last_attempt_error = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(attempt_number)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write the terminal COMPLETED state on the execution and finalize its
    /// slice in the same transaction, copying the final fill onto the slice.
    /// The status guard makes terminal executions immutable: repeated
    /// finalization is a no-op and leaves the slice untouched.
    pub async fn finalize_with_slice(
        &self,
        execution_id: &str,
        slice_id: &str,
        state: &FinalState,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE order_slice_executions
            SET execution_status = 'COMPLETED',
                execution_result = $2,
                broker_order_status = COALESCE($3, broker_order_status),
                filled_quantity = COALESCE($4, filled_quantity),
                average_price = COALESCE($5, average_price),
                error_code = $6,
                error_message = $7,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND execution_status IN ('CLAIMED', 'PLACED')
            "#,
        )
        .bind(execution_id)
        .bind(state.execution_result.as_str())
        .bind(state.broker_order_status.map(|s| s.as_str()))
        .bind(state.filled_quantity)
        .bind(state.average_price)
        .bind(&state.error_code)
        .bind(&state.error_message)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        super::slices::SliceStore::complete_from_execution(&mut tx, slice_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Mark SKIPPED during cancellation; no-op for terminal executions.
    pub async fn mark_skipped(&self, execution_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE order_slice_executions
            SET execution_status = 'SKIPPED', updated_at = NOW()
            WHERE id = $1 AND execution_status IN ('CLAIMED', 'PLACED')
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Executions whose lease has expired, oldest first.
    pub async fn find_timed_out(&self) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM order_slice_executions
            WHERE execution_status IN ('CLAIMED', 'PLACED')
              AND executor_timeout_at < NOW()
            ORDER BY executor_timeout_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    /// Fail over one expired execution: terminal EXECUTOR_TIMEOUT on the
    /// execution and COMPLETED on the slice (copying any partial fill), in
    /// one transaction. Returns false when another monitor run (or the
    /// returning worker's own heartbeat) got there first.
    pub async fn fail_over_timed_out(
        &self,
        execution: &Execution,
        ctx: &RequestContext,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE order_slice_executions
            SET execution_status = 'COMPLETED',
                execution_result = 'EXECUTOR_TIMEOUT',
                error_code = 'EXECUTOR_TIMEOUT',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND execution_status IN ('CLAIMED', 'PLACED')
              AND executor_timeout_at < NOW()
            "#,
        )
        .bind(&execution.id)
        .bind(format!("Executor {} timed out", execution.executor_id))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        super::slices::SliceStore::complete_from_execution(&mut tx, &execution.slice_id).await?;
        tx.commit().await?;

        tracing::warn!(
            execution_id = %execution.id,
            slice_id = %execution.slice_id,
            executor_id = %execution.executor_id,
            trace_id = %ctx.trace_id,
            "Execution failed over after lease expiry"
        );
        Ok(true)
    }
}

fn row_to_execution(row: &PgRow) -> Result<Execution, StoreError> {
    let status_raw: String = row.get("execution_status");
    let execution_status =
        ExecutionStatus::parse(&status_raw).ok_or(StoreError::InvalidColumn {
            column: "execution_status",
            value: status_raw,
        })?;

    let broker_order_status = match row.get::<Option<String>, _>("broker_order_status") {
        Some(raw) => Some(BrokerOrderStatus::parse(&raw).ok_or(StoreError::InvalidColumn {
            column: "broker_order_status",
            value: raw,
        })?),
        None => None,
    };

    let execution_result = match row.get::<Option<String>, _>("execution_result") {
        Some(raw) => Some(ExecutionResult::parse(&raw).ok_or(StoreError::InvalidColumn {
            column: "execution_result",
            value: raw,
        })?),
        None => None,
    };

    Ok(Execution {
        id: row.get("id"),
        slice_id: row.get("slice_id"),
        attempt_id: row.get("attempt_id"),
        executor_id: row.get("executor_id"),
        executor_claimed_at: row.get("executor_claimed_at"),
        executor_timeout_at: row.get("executor_timeout_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        execution_status,
        broker_order_id: row.get("broker_order_id"),
        broker_order_status,
        filled_quantity: row.get("filled_quantity"),
        average_price: row.get("average_price"),
        execution_result,
        placement_attempts: row.get("placement_attempts"),
        last_attempt_at: row.get("last_attempt_at"),
        last_attempt_error: row.get("last_attempt_error"),
        placement_confirmed_at: row.get("placement_confirmed_at"),
        last_broker_poll_at: row.get("last_broker_poll_at"),
        completed_at: row.get("completed_at"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        request_id: row.get("request_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
