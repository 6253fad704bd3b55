//! Domain model: orders, slices, executions, broker events
//!
//! Enum columns are persisted as their upper-case string form; every enum
//! carries an `as_str`/`parse` pair so the store can round-trip them without
//! an ORM layer.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Slice order type at the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            _ => None,
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parent-order splitting queue status.
///
/// PENDING -> IN_PROGRESS -> {COMPLETED | FAILED | SKIPPED}; terminal states
/// are never left except through cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::InProgress => "IN_PROGRESS",
            QueueStatus::Completed => "COMPLETED",
            QueueStatus::Failed => "FAILED",
            QueueStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(QueueStatus::Pending),
            "IN_PROGRESS" => Some(QueueStatus::InProgress),
            "COMPLETED" => Some(QueueStatus::Completed),
            "FAILED" => Some(QueueStatus::Failed),
            "SKIPPED" => Some(QueueStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Skipped
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    Pending,
    Executing,
    Completed,
    Cancelled,
    Skipped,
}

impl SliceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceStatus::Pending => "PENDING",
            SliceStatus::Executing => "EXECUTING",
            SliceStatus::Completed => "COMPLETED",
            SliceStatus::Cancelled => "CANCELLED",
            SliceStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SliceStatus::Pending),
            "EXECUTING" => Some(SliceStatus::Executing),
            "COMPLETED" => Some(SliceStatus::Completed),
            "CANCELLED" => Some(SliceStatus::Cancelled),
            "SKIPPED" => Some(SliceStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for SliceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one execution attempt.
///
/// CLAIMED -> PLACED -> COMPLETED, or CLAIMED/PLACED -> SKIPPED via
/// cancellation. COMPLETED and SKIPPED are immutable except for the timeout
/// monitor's terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Claimed,
    Placed,
    Completed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Claimed => "CLAIMED",
            ExecutionStatus::Placed => "PLACED",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CLAIMED" => Some(ExecutionStatus::Claimed),
            "PLACED" => Some(ExecutionStatus::Placed),
            "COMPLETED" => Some(ExecutionStatus::Completed),
            "SKIPPED" => Some(ExecutionStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Skipped)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order status as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Complete,
    Cancelled,
    Rejected,
    Expired,
}

impl BrokerOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerOrderStatus::Pending => "PENDING",
            BrokerOrderStatus::Open => "OPEN",
            BrokerOrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            BrokerOrderStatus::Complete => "COMPLETE",
            BrokerOrderStatus::Cancelled => "CANCELLED",
            BrokerOrderStatus::Rejected => "REJECTED",
            BrokerOrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BrokerOrderStatus::Pending),
            "OPEN" => Some(BrokerOrderStatus::Open),
            "PARTIALLY_FILLED" => Some(BrokerOrderStatus::PartiallyFilled),
            "COMPLETE" => Some(BrokerOrderStatus::Complete),
            "CANCELLED" => Some(BrokerOrderStatus::Cancelled),
            "REJECTED" => Some(BrokerOrderStatus::Rejected),
            "EXPIRED" => Some(BrokerOrderStatus::Expired),
            _ => None,
        }
    }

    /// Terminal statuses end the monitoring loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BrokerOrderStatus::Complete
                | BrokerOrderStatus::Cancelled
                | BrokerOrderStatus::Rejected
                | BrokerOrderStatus::Expired
        )
    }
}

impl fmt::Display for BrokerOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome recorded on an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Success,
    PartialSuccess,
    BrokerRejected,
    ValidationFailed,
    ExecutorTimeout,
}

impl ExecutionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionResult::Success => "SUCCESS",
            ExecutionResult::PartialSuccess => "PARTIAL_SUCCESS",
            ExecutionResult::BrokerRejected => "BROKER_REJECTED",
            ExecutionResult::ValidationFailed => "VALIDATION_FAILED",
            ExecutionResult::ExecutorTimeout => "EXECUTOR_TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(ExecutionResult::Success),
            "PARTIAL_SUCCESS" => Some(ExecutionResult::PartialSuccess),
            "BROKER_REJECTED" => Some(ExecutionResult::BrokerRejected),
            "VALIDATION_FAILED" => Some(ExecutionResult::ValidationFailed),
            "EXECUTOR_TIMEOUT" => Some(ExecutionResult::ExecutorTimeout),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of wire call recorded in the broker-event audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEventType {
    PlaceOrder,
    StatusPoll,
    CancelRequest,
}

impl BrokerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerEventType::PlaceOrder => "PLACE_ORDER",
            BrokerEventType::StatusPoll => "STATUS_POLL",
            BrokerEventType::CancelRequest => "CANCEL_REQUEST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PLACE_ORDER" => Some(BrokerEventType::PlaceOrder),
            "STATUS_POLL" => Some(BrokerEventType::StatusPoll),
            "CANCEL_REQUEST" => Some(BrokerEventType::CancelRequest),
            _ => None,
        }
    }
}

impl fmt::Display for BrokerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Origin tracing quadruple copied from ingress onto the order row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub trace_id: String,
    pub trace_source: String,
    pub request_id: String,
    pub request_source: String,
}

/// Parent trading intent.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub instrument: String,
    pub side: Side,
    pub total_quantity: i32,
    pub num_splits: i32,
    pub duration_minutes: i32,
    pub randomize: bool,
    pub order_unique_key: String,
    pub queue_status: QueueStatus,
    pub skip_reason: Option<String>,
    pub split_completed_at: Option<DateTime<Utc>>,
    pub origin: Origin,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated submission accepted from ingress.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub instrument: String,
    pub side: Side,
    pub total_quantity: i32,
    pub num_splits: i32,
    pub duration_minutes: i32,
    pub randomize: bool,
    pub order_unique_key: String,
}

/// One child of the time-staggered plan.
#[derive(Debug, Clone)]
pub struct OrderSlice {
    pub id: String,
    pub order_id: String,
    pub instrument: String,
    pub side: Side,
    pub quantity: i32,
    pub sequence_number: i32,
    pub status: SliceStatus,
    pub scheduled_at: DateTime<Utc>,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub product_type: String,
    pub validity: String,
    pub filled_quantity: i32,
    pub average_price: Option<Decimal>,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt to execute a slice; exactly one per slice, enforced by
/// UNIQUE(slice_id) in the store.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: String,
    pub slice_id: String,
    pub attempt_id: String,
    pub executor_id: String,
    pub executor_claimed_at: DateTime<Utc>,
    pub executor_timeout_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub execution_status: ExecutionStatus,
    pub broker_order_id: Option<String>,
    pub broker_order_status: Option<BrokerOrderStatus>,
    pub filled_quantity: i32,
    pub average_price: Option<Decimal>,
    pub execution_result: Option<ExecutionResult>,
    pub placement_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_error: Option<String>,
    pub placement_confirmed_at: Option<DateTime<Utc>>,
    pub last_broker_poll_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record of one wire call to the broker.
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub id: String,
    pub execution_id: String,
    pub slice_id: String,
    pub event_sequence: i32,
    pub event_type: BrokerEventType,
    pub event_timestamp: DateTime<Utc>,
    pub attempt_number: i32,
    pub attempt_id: String,
    pub executor_id: String,
    pub broker_name: String,
    pub broker_order_id: Option<String>,
    pub request_method: Option<String>,
    pub request_endpoint: Option<String>,
    pub request_payload: Option<serde_json::Value>,
    pub response_status_code: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub response_time_ms: Option<i32>,
    pub broker_status: Option<BrokerOrderStatus>,
    pub broker_message: Option<String>,
    pub filled_quantity: Option<i32>,
    pub pending_quantity: Option<i32>,
    pub average_price: Option<Decimal>,
    pub is_success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub request_id: String,
}

/// Insert shape for a broker event; the store assigns id and sequence.
#[derive(Debug, Clone)]
pub struct NewBrokerEvent {
    pub event_type: BrokerEventType,
    pub attempt_number: i32,
    pub attempt_id: String,
    pub executor_id: String,
    pub broker_name: String,
    pub broker_order_id: Option<String>,
    pub request_method: Option<String>,
    pub request_endpoint: Option<String>,
    pub request_payload: Option<serde_json::Value>,
    pub response_status_code: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub response_time_ms: Option<i32>,
    pub broker_status: Option<BrokerOrderStatus>,
    pub broker_message: Option<String>,
    pub filled_quantity: Option<i32>,
    pub pending_quantity: Option<i32>,
    pub average_price: Option<Decimal>,
    pub is_success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl NewBrokerEvent {
    /// Start an event record for one wire call; callers fill in the outcome
    /// fields before handing it to the store.
    pub fn attempt(
        event_type: BrokerEventType,
        attempt_number: i32,
        attempt_id: &str,
        executor_id: &str,
        broker_name: &str,
    ) -> Self {
        Self {
            event_type,
            attempt_number,
            attempt_id: attempt_id.to_string(),
            executor_id: executor_id.to_string(),
            broker_name: broker_name.to_string(),
            broker_order_id: None,
            request_method: None,
            request_endpoint: None,
            request_payload: None,
            response_status_code: None,
            response_body: None,
            response_time_ms: None,
            broker_status: None,
            broker_message: None,
            filled_quantity: None,
            pending_quantity: None,
            average_price: None,
            is_success: false,
            error_code: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_roundtrip() {
        assert_eq!(Side::parse("BUY"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("HOLD"), None);
        assert_eq!(Side::Buy.as_str(), "BUY");
    }

    #[test]
    fn test_queue_status_terminal() {
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::InProgress.is_terminal());
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(QueueStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_broker_status_terminal() {
        assert!(BrokerOrderStatus::Complete.is_terminal());
        assert!(BrokerOrderStatus::Cancelled.is_terminal());
        assert!(BrokerOrderStatus::Rejected.is_terminal());
        assert!(BrokerOrderStatus::Expired.is_terminal());
        assert!(!BrokerOrderStatus::Pending.is_terminal());
        assert!(!BrokerOrderStatus::Open.is_terminal());
        assert!(!BrokerOrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_execution_status_roundtrip() {
        for s in ["CLAIMED", "PLACED", "COMPLETED", "SKIPPED"] {
            let parsed = ExecutionStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert_eq!(ExecutionStatus::parse("RUNNING"), None);
    }

    #[test]
    fn test_execution_result_roundtrip() {
        for s in [
            "SUCCESS",
            "PARTIAL_SUCCESS",
            "BROKER_REJECTED",
            "VALIDATION_FAILED",
            "EXECUTOR_TIMEOUT",
        ] {
            let parsed = ExecutionResult::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn test_event_type_roundtrip() {
        for s in ["PLACE_ORDER", "STATUS_POLL", "CANCEL_REQUEST"] {
            let parsed = BrokerEventType::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn test_new_broker_event_defaults() {
        let ev = NewBrokerEvent::attempt(
            BrokerEventType::PlaceOrder,
            1,
            "attempt-x",
            "worker-1",
            "mock",
        );
        assert!(!ev.is_success);
        assert!(ev.broker_order_id.is_none());
        assert_eq!(ev.attempt_number, 1);
    }
}
