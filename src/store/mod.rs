//! Transactional persistence layer
//!
//! One store struct per table, each holding a clone of the shared [`PgPool`].
//! All claim paths use `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent
//! workers never pick the same row; state transitions that must be safe under
//! races use conditional UPDATEs and report `rows_affected`.

pub mod broker_events;
pub mod executions;
pub mod orders;
pub mod slices;

pub use broker_events::BrokerEventStore;
pub use executions::{ClaimedSlice, ExecutionStore, FinalState};
pub use orders::OrderStore;
pub use slices::{NewSlice, SliceStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Client-visible idempotency failure on order submission.
    #[error("order_unique_key already exists: {0}")]
    DuplicateOrderUniqueKey(String),

    /// Another worker claimed the slice first; callers abandon silently.
    #[error("slice already has an execution: {0}")]
    DuplicateExecution(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A persisted enum column held a value outside the documented set.
    #[error("invalid {column} value in store: {value}")]
    InvalidColumn { column: &'static str, value: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// True when the underlying error is a unique-constraint violation.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
    }
}
