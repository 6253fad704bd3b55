//! Append-only broker-event audit

use sqlx::{PgPool, Row, postgres::PgRow};

use super::StoreError;
use crate::context::RequestContext;
use crate::core_types::generate_event_id;
use crate::models::{BrokerEvent, BrokerEventType, BrokerOrderStatus, NewBrokerEvent};

pub struct BrokerEventStore {
    pool: PgPool,
}

impl BrokerEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Next gap-free sequence number for an execution's event stream.
    pub async fn next_sequence(&self, execution_id: &str) -> Result<i32, StoreError> {
        let seq: i32 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(event_sequence), 0) + 1
            FROM order_slice_broker_events
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(seq)
    }

    /// Append one wire-call record. The sequence is assigned at insert from
    /// the store's current maximum; UNIQUE(execution_id, event_sequence)
    /// keeps the stream gap-free under concurrent writers.
    pub async fn append(
        &self,
        execution_id: &str,
        slice_id: &str,
        event: &NewBrokerEvent,
        ctx: &RequestContext,
    ) -> Result<String, StoreError> {
        let event_id = generate_event_id();
        let sequence = self.next_sequence(execution_id).await?;

        sqlx::query(
            r#"
            INSERT INTO order_slice_broker_events (
                id, execution_id, slice_id, event_sequence, event_type,
                event_timestamp, attempt_number, attempt_id, executor_id,
                broker_name, broker_order_id,
                request_method, request_endpoint, request_payload,
                response_status_code, response_body, response_time_ms,
                broker_status, broker_message,
                filled_quantity, pending_quantity, average_price,
                is_success, error_code, error_message, request_id
            )
            VALUES ($1, $2, $3, $4, $5, NOW(), $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21,
                    $22, $23, $24, $25)
            "#,
        )
        .bind(&event_id)
        .bind(execution_id)
        .bind(slice_id)
        .bind(sequence)
        .bind(event.event_type.as_str())
        .bind(event.attempt_number)
        .bind(&event.attempt_id)
        .bind(&event.executor_id)
        .bind(&event.broker_name)
        .bind(&event.broker_order_id)
        .bind(&event.request_method)
        .bind(&event.request_endpoint)
        .bind(&event.request_payload)
        .bind(event.response_status_code)
        .bind(&event.response_body)
        .bind(event.response_time_ms)
        .bind(event.broker_status.map(|s| s.as_str()))
        .bind(&event.broker_message)
        .bind(event.filled_quantity)
        .bind(event.pending_quantity)
        .bind(event.average_price)
        .bind(event.is_success)
        .bind(&event.error_code)
        .bind(&event.error_message)
        .bind(&ctx.request_id)
        .execute(&self.pool)
        .await?;

        Ok(event_id)
    }

    /// Events for one execution in sequence order.
    pub async fn list_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<BrokerEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM order_slice_broker_events
            WHERE execution_id = $1
            ORDER BY event_sequence ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &PgRow) -> Result<BrokerEvent, StoreError> {
    let type_raw: String = row.get("event_type");
    let event_type = BrokerEventType::parse(&type_raw).ok_or(StoreError::InvalidColumn {
        column: "event_type",
        value: type_raw,
    })?;

    let broker_status = match row.get::<Option<String>, _>("broker_status") {
        Some(raw) => Some(BrokerOrderStatus::parse(&raw).ok_or(StoreError::InvalidColumn {
            column: "broker_status",
            value: raw,
        })?),
        None => None,
    };

    Ok(BrokerEvent {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        slice_id: row.get("slice_id"),
        event_sequence: row.get("event_sequence"),
        event_type,
        event_timestamp: row.get("event_timestamp"),
        attempt_number: row.get("attempt_number"),
        attempt_id: row.get("attempt_id"),
        executor_id: row.get("executor_id"),
        broker_name: row.get("broker_name"),
        broker_order_id: row.get("broker_order_id"),
        request_method: row.get("request_method"),
        request_endpoint: row.get("request_endpoint"),
        request_payload: row.get("request_payload"),
        response_status_code: row.get("response_status_code"),
        response_body: row.get("response_body"),
        response_time_ms: row.get("response_time_ms"),
        broker_status,
        broker_message: row.get("broker_message"),
        filled_quantity: row.get("filled_quantity"),
        pending_quantity: row.get("pending_quantity"),
        average_price: row.get("average_price"),
        is_success: row.get("is_success"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        request_id: row.get("request_id"),
    })
}
