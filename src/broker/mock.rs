//! Deterministic mock broker
//!
//! Driven by a [`MockScenario`]; each scenario plays out the same way every
//! run so tests and local environments are reproducible:
//!
//! - `success`: market orders fill immediately; limit orders go OPEN, show a
//!   half fill on the first poll and complete on the second.
//! - `partial_fill`: orders go OPEN, fill half on the first poll, then expire
//!   with the other half unfilled.
//! - `rejection`: placement fails with INSUFFICIENT_FUNDS (non-network).
//! - `network_error`: the first two placement calls fail with a
//!   network-shaped error, after which the order behaves like `success`.
//! - `timeout`: orders go OPEN and never progress; only a cancel ends them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{BrokerAdapter, BrokerError, BrokerOrderReply, PlaceOrderRequest};
use crate::config::MockScenario;
use crate::context::RequestContext;
use crate::models::{BrokerOrderStatus, OrderType};

fn mock_fill_price(limit_price: Option<Decimal>) -> Decimal {
    // 1249.80, in range for the usual test instruments
    limit_price.unwrap_or_else(|| Decimal::new(124_980, 2))
}

struct MockOrder {
    quantity: i32,
    limit_price: Option<Decimal>,
    status: BrokerOrderStatus,
    filled_quantity: i32,
    polls: u32,
    cancelled: bool,
}

pub struct MockBroker {
    scenario: MockScenario,
    orders: Mutex<HashMap<String, MockOrder>>,
    place_calls: AtomicU64,
    next_order: AtomicU64,
}

impl MockBroker {
    pub fn new(scenario: MockScenario) -> Self {
        Self {
            scenario,
            orders: Mutex::new(HashMap::new()),
            place_calls: AtomicU64::new(0),
            next_order: AtomicU64::new(1),
        }
    }

    pub fn scenario(&self) -> MockScenario {
        self.scenario
    }

    fn reply(order_id: &str, order: &MockOrder, message: &str) -> BrokerOrderReply {
        let average_price = if order.filled_quantity > 0 {
            Some(mock_fill_price(order.limit_price))
        } else {
            None
        };
        BrokerOrderReply {
            broker_order_id: order_id.to_string(),
            status: order.status,
            filled_quantity: order.filled_quantity,
            pending_quantity: order.quantity - order.filled_quantity,
            average_price,
            message: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl BrokerAdapter for MockBroker {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn place(
        &self,
        request: &PlaceOrderRequest,
        ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError> {
        let call = self.place_calls.fetch_add(1, Ordering::SeqCst);

        match self.scenario {
            MockScenario::Rejection => {
                return Err(BrokerError::Rejected {
                    code: "INSUFFICIENT_FUNDS".to_string(),
                    message: "Insufficient funds for order".to_string(),
                });
            }
            MockScenario::NetworkError if call < 2 => {
                return Err(BrokerError::Network("connection timed out".to_string()));
            }
            _ => {}
        }

        let order_id = format!("MOCK{:08}", self.next_order.fetch_add(1, Ordering::SeqCst));

        let fills_immediately = matches!(
            self.scenario,
            MockScenario::Success | MockScenario::NetworkError
        ) && request.order_type == OrderType::Market;

        let order = if fills_immediately {
            MockOrder {
                quantity: request.quantity,
                limit_price: request.limit_price,
                status: BrokerOrderStatus::Complete,
                filled_quantity: request.quantity,
                polls: 0,
                cancelled: false,
            }
        } else {
            MockOrder {
                quantity: request.quantity,
                limit_price: request.limit_price,
                status: BrokerOrderStatus::Open,
                filled_quantity: 0,
                polls: 0,
                cancelled: false,
            }
        };

        tracing::debug!(
            broker_order_id = %order_id,
            status = %order.status,
            trace_id = %ctx.trace_id,
            "Mock broker accepted order"
        );

        let reply = Self::reply(&order_id, &order, "Order placed");
        self.orders
            .lock()
            .map_err(|_| BrokerError::InvalidResponse("mock state poisoned".to_string()))?
            .insert(order_id, order);
        Ok(reply)
    }

    async fn poll(
        &self,
        broker_order_id: &str,
        _ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError> {
        let mut orders = self
            .orders
            .lock()
            .map_err(|_| BrokerError::InvalidResponse("mock state poisoned".to_string()))?;
        let order = orders.get_mut(broker_order_id).ok_or_else(|| {
            BrokerError::InvalidResponse(format!("unknown order: {}", broker_order_id))
        })?;

        if order.cancelled || order.status.is_terminal() {
            return Ok(Self::reply(broker_order_id, order, "Order status"));
        }

        order.polls += 1;
        match self.scenario {
            MockScenario::Success | MockScenario::NetworkError => {
                if order.polls == 1 {
                    order.status = BrokerOrderStatus::PartiallyFilled;
                    order.filled_quantity = order.quantity / 2;
                } else {
                    order.status = BrokerOrderStatus::Complete;
                    order.filled_quantity = order.quantity;
                }
            }
            MockScenario::PartialFill => {
                if order.polls == 1 {
                    order.status = BrokerOrderStatus::PartiallyFilled;
                    order.filled_quantity = order.quantity / 2;
                } else {
                    order.status = BrokerOrderStatus::Expired;
                }
            }
            MockScenario::Timeout => {
                // never progresses
            }
            MockScenario::Rejection => {}
        }

        Ok(Self::reply(broker_order_id, order, "Order status"))
    }

    async fn cancel(
        &self,
        broker_order_id: &str,
        _ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError> {
        let mut orders = self
            .orders
            .lock()
            .map_err(|_| BrokerError::InvalidResponse("mock state poisoned".to_string()))?;
        let order = orders.get_mut(broker_order_id).ok_or_else(|| {
            BrokerError::InvalidResponse(format!("unknown order: {}", broker_order_id))
        })?;

        if !order.status.is_terminal() {
            order.status = BrokerOrderStatus::Cancelled;
        }
        order.cancelled = true;

        Ok(Self::reply(broker_order_id, order, "Order cancelled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn market_request(quantity: i32) -> PlaceOrderRequest {
        PlaceOrderRequest {
            instrument: "NSE:RELIANCE".to_string(),
            side: Side::Buy,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            product_type: "CNC".to_string(),
            validity: "DAY".to_string(),
        }
    }

    fn limit_request(quantity: i32, price: Decimal) -> PlaceOrderRequest {
        PlaceOrderRequest {
            order_type: OrderType::Limit,
            limit_price: Some(price),
            ..market_request(quantity)
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::for_worker("test")
    }

    #[tokio::test]
    async fn test_success_market_fills_immediately() {
        let broker = MockBroker::new(MockScenario::Success);
        let reply = broker.place(&market_request(20), &ctx()).await.unwrap();

        assert_eq!(reply.status, BrokerOrderStatus::Complete);
        assert_eq!(reply.filled_quantity, 20);
        assert_eq!(reply.pending_quantity, 0);
        assert!(reply.average_price.is_some());
    }

    #[tokio::test]
    async fn test_success_limit_completes_after_polls() {
        let broker = MockBroker::new(MockScenario::Success);
        let price = Decimal::new(12_400_000, 4);
        let placed = broker
            .place(&limit_request(100, price), &ctx())
            .await
            .unwrap();
        assert_eq!(placed.status, BrokerOrderStatus::Open);

        let first = broker.poll(&placed.broker_order_id, &ctx()).await.unwrap();
        assert_eq!(first.status, BrokerOrderStatus::PartiallyFilled);
        assert_eq!(first.filled_quantity, 50);

        let second = broker.poll(&placed.broker_order_id, &ctx()).await.unwrap();
        assert_eq!(second.status, BrokerOrderStatus::Complete);
        assert_eq!(second.filled_quantity, 100);
        assert_eq!(second.average_price, Some(price));
    }

    #[tokio::test]
    async fn test_partial_fill_expires_half_filled() {
        let broker = MockBroker::new(MockScenario::PartialFill);
        let placed = broker
            .place(&limit_request(100, Decimal::new(12_400_000, 4)), &ctx())
            .await
            .unwrap();

        broker.poll(&placed.broker_order_id, &ctx()).await.unwrap();
        let terminal = broker.poll(&placed.broker_order_id, &ctx()).await.unwrap();

        assert_eq!(terminal.status, BrokerOrderStatus::Expired);
        assert_eq!(terminal.filled_quantity, 50);
        assert_eq!(terminal.pending_quantity, 50);
    }

    #[tokio::test]
    async fn test_rejection_is_not_network_shaped() {
        let broker = MockBroker::new(MockScenario::Rejection);
        let err = broker.place(&market_request(10), &ctx()).await.unwrap_err();
        assert!(!err.is_network());
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
    }

    #[tokio::test]
    async fn test_network_error_recovers_on_third_attempt() {
        let broker = MockBroker::new(MockScenario::NetworkError);

        for _ in 0..2 {
            let err = broker.place(&market_request(10), &ctx()).await.unwrap_err();
            assert!(err.is_network());
        }

        let reply = broker.place(&market_request(10), &ctx()).await.unwrap();
        assert_eq!(reply.status, BrokerOrderStatus::Complete);
    }

    #[tokio::test]
    async fn test_timeout_never_progresses() {
        let broker = MockBroker::new(MockScenario::Timeout);
        let placed = broker.place(&market_request(10), &ctx()).await.unwrap();
        assert_eq!(placed.status, BrokerOrderStatus::Open);

        for _ in 0..5 {
            let polled = broker.poll(&placed.broker_order_id, &ctx()).await.unwrap();
            assert_eq!(polled.status, BrokerOrderStatus::Open);
        }

        let cancelled = broker
            .cancel(&placed.broker_order_id, &ctx())
            .await
            .unwrap();
        assert_eq!(cancelled.status, BrokerOrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let broker = MockBroker::new(MockScenario::Timeout);
        let placed = broker.place(&market_request(10), &ctx()).await.unwrap();

        let first = broker
            .cancel(&placed.broker_order_id, &ctx())
            .await
            .unwrap();
        let second = broker
            .cancel(&placed.broker_order_id, &ctx())
            .await
            .unwrap();
        assert_eq!(first.status, second.status);

        // polling after cancel keeps reporting CANCELLED
        let polled = broker.poll(&placed.broker_order_id, &ctx()).await.unwrap();
        assert_eq!(polled.status, BrokerOrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_poll_unknown_order_fails() {
        let broker = MockBroker::new(MockScenario::Success);
        assert!(broker.poll("MOCK_NOPE", &ctx()).await.is_err());
    }
}
