//! Order-slice persistence

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use super::StoreError;
use crate::context::RequestContext;
use crate::models::{OrderSlice, OrderType, Side, SliceStatus};

/// Insert shape for one slice of a split plan.
#[derive(Debug, Clone)]
pub struct NewSlice {
    pub id: String,
    pub order_id: String,
    pub instrument: String,
    pub side: Side,
    pub quantity: i32,
    pub sequence_number: i32,
    pub scheduled_at: DateTime<Utc>,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub product_type: String,
    pub validity: String,
    pub request_id: String,
}

pub struct SliceStore {
    pool: PgPool,
}

impl SliceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a full slice set in one statement inside the caller's
    /// transaction. The UNIQUE(order_id, sequence_number) constraint rejects
    /// concurrent duplicate splitting.
    pub async fn insert_batch(
        tx: &mut Transaction<'_, Postgres>,
        slices: &[NewSlice],
    ) -> Result<u64, StoreError> {
        if slices.is_empty() {
            return Ok(0);
        }

        let mut qb = sqlx::QueryBuilder::<Postgres>::new(
            "INSERT INTO order_slices (id, order_id, instrument, side, quantity, \
             sequence_number, status, scheduled_at, order_type, limit_price, \
             product_type, validity, request_id) ",
        );
        qb.push_values(slices, |mut b, s| {
            b.push_bind(&s.id)
                .push_bind(&s.order_id)
                .push_bind(&s.instrument)
                .push_bind(s.side.as_str())
                .push_bind(s.quantity)
                .push_bind(s.sequence_number)
                .push_bind("PENDING")
                .push_bind(s.scheduled_at)
                .push_bind(s.order_type.as_str())
                .push_bind(s.limit_price)
                .push_bind(&s.product_type)
                .push_bind(&s.validity)
                .push_bind(&s.request_id);
        });

        let result = qb.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    pub async fn get_by_id(&self, slice_id: &str) -> Result<Option<OrderSlice>, StoreError> {
        let row = sqlx::query("SELECT * FROM order_slices WHERE id = $1")
            .bind(slice_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_slice(&r)).transpose()
    }

    pub async fn list_by_order(&self, order_id: &str) -> Result<Vec<OrderSlice>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM order_slices WHERE order_id = $1 ORDER BY sequence_number ASC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_slice).collect()
    }

    /// Slices a cancellation must act on, in plan order.
    pub async fn cancellable_by_order(
        &self,
        order_id: &str,
    ) -> Result<Vec<OrderSlice>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM order_slices
            WHERE order_id = $1 AND status IN ('PENDING', 'EXECUTING')
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_slice).collect()
    }

    /// Skip a slice during cancellation. The status guard keeps this
    /// idempotent: a slice that already reached a terminal state is left
    /// alone.
    pub async fn skip(&self, slice_id: &str, ctx: &RequestContext) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE order_slices
            SET status = 'SKIPPED', updated_at = NOW()
            WHERE id = $1 AND status IN ('PENDING', 'EXECUTING')
            "#,
        )
        .bind(slice_id)
        .execute(&self.pool)
        .await?;

        let skipped = result.rows_affected() > 0;
        if skipped {
            tracing::info!(slice_id, request_id = %ctx.request_id, "Slice skipped");
        }
        Ok(skipped)
    }

    /// Finalize a slice copying whatever fill its execution recorded. The
    /// execution row always holds the last broker-reported state, so this is
    /// the single completion path for success, error, and timeout failover.
    pub async fn complete_from_execution(
        tx: &mut Transaction<'_, Postgres>,
        slice_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE order_slices s
            SET status = 'COMPLETED',
                filled_quantity = e.filled_quantity,
                average_price = e.average_price,
                updated_at = NOW()
            FROM order_slice_executions e
            WHERE e.slice_id = s.id AND s.id = $1
            "#,
        )
        .bind(slice_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub(crate) fn row_to_slice(row: &PgRow) -> Result<OrderSlice, StoreError> {
    let side_raw: String = row.get("side");
    let side = Side::parse(&side_raw).ok_or(StoreError::InvalidColumn {
        column: "side",
        value: side_raw,
    })?;

    let status_raw: String = row.get("status");
    let status = SliceStatus::parse(&status_raw).ok_or(StoreError::InvalidColumn {
        column: "status",
        value: status_raw,
    })?;

    let order_type_raw: String = row.get("order_type");
    let order_type = OrderType::parse(&order_type_raw).ok_or(StoreError::InvalidColumn {
        column: "order_type",
        value: order_type_raw,
    })?;

    Ok(OrderSlice {
        id: row.get("id"),
        order_id: row.get("order_id"),
        instrument: row.get("instrument"),
        side,
        quantity: row.get("quantity"),
        sequence_number: row.get("sequence_number"),
        status,
        scheduled_at: row.get("scheduled_at"),
        order_type,
        limit_price: row.get("limit_price"),
        product_type: row.get("product_type"),
        validity: row.get("validity"),
        filled_quantity: row.get("filled_quantity"),
        average_price: row.get("average_price"),
        request_id: row.get("request_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
