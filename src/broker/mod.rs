//! Broker adapter contract
//!
//! Polling is the only state-acquisition mechanism: the core never depends on
//! webhooks or push updates. Any operation may fail; callers classify the
//! error (network-shaped failures are retryable, everything else is a
//! rejection). `poll` and `cancel` must be idempotent for a given
//! `broker_order_id`.

pub mod mock;
pub mod zerodha;

pub use mock::MockBroker;
pub use zerodha::ZerodhaBroker;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::context::RequestContext;
use crate::models::{BrokerOrderStatus, OrderSlice, OrderType, Side};

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Timeout, connection refused, unreachable host. Retryable.
    #[error("network failure: {0}")]
    Network(String),

    /// The broker understood the request and said no. Not retryable.
    #[error("broker rejected: {code}: {message}")]
    Rejected { code: String, message: String },

    /// The broker answered with something the adapter could not interpret.
    #[error("unexpected broker response: {0}")]
    InvalidResponse(String),
}

impl BrokerError {
    pub fn is_network(&self) -> bool {
        matches!(self, BrokerError::Network(_))
    }

    /// Error code recorded on the audit event for this failure.
    pub fn error_code(&self) -> &str {
        match self {
            BrokerError::Network(_) => "NETWORK_FAILURE",
            BrokerError::Rejected { code, .. } => code,
            BrokerError::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }
}

/// Request to place one slice at the broker.
#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub instrument: String,
    pub side: Side,
    pub quantity: i32,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub product_type: String,
    pub validity: String,
}

impl PlaceOrderRequest {
    pub fn from_slice(slice: &OrderSlice) -> Self {
        Self {
            instrument: slice.instrument.clone(),
            side: slice.side,
            quantity: slice.quantity,
            order_type: slice.order_type,
            limit_price: slice.limit_price,
            product_type: slice.product_type.clone(),
            validity: slice.validity.clone(),
        }
    }
}

/// The broker's view of an order after any operation.
#[derive(Debug, Clone)]
pub struct BrokerOrderReply {
    pub broker_order_id: String,
    pub status: BrokerOrderStatus,
    pub filled_quantity: i32,
    pub pending_quantity: i32,
    pub average_price: Option<Decimal>,
    pub message: Option<String>,
}

/// Contract over an external order router.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Short broker name recorded on audit events.
    fn name(&self) -> &'static str;

    async fn place(
        &self,
        request: &PlaceOrderRequest,
        ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError>;

    async fn poll(
        &self,
        broker_order_id: &str,
        ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError>;

    async fn cancel(
        &self,
        broker_order_id: &str,
        ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BrokerError::Network("timed out".into()).is_network());
        assert!(
            !BrokerError::Rejected {
                code: "INSUFFICIENT_FUNDS".into(),
                message: "no funds".into()
            }
            .is_network()
        );
        assert!(!BrokerError::InvalidResponse("garbage".into()).is_network());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BrokerError::Network("x".into()).error_code(),
            "NETWORK_FAILURE"
        );
        assert_eq!(
            BrokerError::Rejected {
                code: "INSUFFICIENT_FUNDS".into(),
                message: "no".into()
            }
            .error_code(),
            "INSUFFICIENT_FUNDS"
        );
    }
}
