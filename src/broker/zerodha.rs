//! Zerodha (Kite Connect) broker adapter
//!
//! Real-vendor variant of the [`BrokerAdapter`] contract. Authentication is
//! header-based (`token api_key:access_token`); the access-token lifecycle is
//! managed outside the core. Vendor statuses are folded into the internal
//! status set; an OPEN order with a non-zero fill reports PARTIALLY_FILLED.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::Value;

use super::{BrokerAdapter, BrokerError, BrokerOrderReply, PlaceOrderRequest};
use crate::context::RequestContext;
use crate::models::{BrokerOrderStatus, OrderType};

const DEFAULT_BASE_URL: &str = "https://api.kite.trade";
const KITE_VERSION: &str = "3";

pub struct ZerodhaBroker {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: String,
}

impl ZerodhaBroker {
    pub fn new(api_key: String, access_token: String) -> Result<Self, BrokerError> {
        Self::with_base_url(api_key, access_token, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(
        api_key: String,
        access_token: String,
        base_url: String,
    ) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BrokerError::InvalidResponse(format!("client build failed: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            access_token,
        })
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    /// Split `NSE:RELIANCE` into (exchange, tradingsymbol).
    fn split_instrument(instrument: &str) -> Result<(&str, &str), BrokerError> {
        instrument.split_once(':').ok_or_else(|| {
            BrokerError::InvalidResponse(format!("malformed instrument: {}", instrument))
        })
    }

    fn classify_transport(err: reqwest::Error) -> BrokerError {
        if err.is_timeout() || err.is_connect() {
            BrokerError::Network(err.to_string())
        } else {
            BrokerError::Rejected {
                code: "BROKER_ERROR".to_string(),
                message: err.to_string(),
            }
        }
    }

    async fn read_body(response: reqwest::Response) -> Result<Value, BrokerError> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(format!("non-JSON body: {}", e)))?;

        if !status.is_success() {
            let code = body
                .get("error_type")
                .and_then(Value::as_str)
                .unwrap_or("BROKER_REJECTED")
                .to_string();
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("broker returned an error")
                .to_string();
            return Err(BrokerError::Rejected { code, message });
        }

        Ok(body)
    }

    fn parse_status(raw: &str, filled_quantity: i32) -> BrokerOrderStatus {
        match raw {
            "COMPLETE" => BrokerOrderStatus::Complete,
            "CANCELLED" => BrokerOrderStatus::Cancelled,
            "REJECTED" => BrokerOrderStatus::Rejected,
            "EXPIRED" => BrokerOrderStatus::Expired,
            "OPEN" | "TRIGGER PENDING" => {
                if filled_quantity > 0 {
                    BrokerOrderStatus::PartiallyFilled
                } else {
                    BrokerOrderStatus::Open
                }
            }
            _ => BrokerOrderStatus::Pending,
        }
    }

    fn parse_order_entry(entry: &Value) -> Result<BrokerOrderReply, BrokerError> {
        let broker_order_id = entry
            .get("order_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::InvalidResponse("missing order_id".to_string()))?
            .to_string();

        let filled_quantity = entry
            .get("filled_quantity")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        let pending_quantity = entry
            .get("pending_quantity")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        let average_price = entry
            .get("average_price")
            .and_then(Value::as_f64)
            .filter(|p| *p > 0.0)
            .and_then(Decimal::from_f64);
        let status_raw = entry.get("status").and_then(Value::as_str).unwrap_or("");
        let message = entry
            .get("status_message")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(BrokerOrderReply {
            broker_order_id,
            status: Self::parse_status(status_raw, filled_quantity),
            filled_quantity,
            pending_quantity,
            average_price,
            message,
        })
    }
}

#[async_trait]
impl BrokerAdapter for ZerodhaBroker {
    fn name(&self) -> &'static str {
        "zerodha"
    }

    async fn place(
        &self,
        request: &PlaceOrderRequest,
        ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError> {
        let (exchange, tradingsymbol) = Self::split_instrument(&request.instrument)?;

        let mut form = vec![
            ("exchange", exchange.to_string()),
            ("tradingsymbol", tradingsymbol.to_string()),
            ("transaction_type", request.side.as_str().to_string()),
            ("quantity", request.quantity.to_string()),
            ("order_type", request.order_type.as_str().to_string()),
            ("product", request.product_type.clone()),
            ("validity", request.validity.clone()),
        ];
        if request.order_type == OrderType::Limit {
            if let Some(price) = request.limit_price {
                form.push(("price", price.to_string()));
            }
        }

        tracing::info!(
            instrument = %request.instrument,
            side = %request.side,
            quantity = request.quantity,
            trace_id = %ctx.trace_id,
            "Placing order with Zerodha"
        );

        let response = self
            .client
            .post(format!("{}/orders/regular", self.base_url))
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .form(&form)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let body = Self::read_body(response).await?;
        let broker_order_id = body
            .get("data")
            .and_then(|d| d.get("order_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::InvalidResponse("missing data.order_id".to_string()))?
            .to_string();

        // Placement acknowledges receipt only; fills arrive via polling.
        Ok(BrokerOrderReply {
            broker_order_id,
            status: BrokerOrderStatus::Pending,
            filled_quantity: 0,
            pending_quantity: request.quantity,
            average_price: None,
            message: body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn poll(
        &self,
        broker_order_id: &str,
        ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError> {
        tracing::debug!(
            broker_order_id,
            trace_id = %ctx.trace_id,
            "Polling order status from Zerodha"
        );

        let response = self
            .client
            .get(format!("{}/orders/{}", self.base_url, broker_order_id))
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let body = Self::read_body(response).await?;
        let history = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| BrokerError::InvalidResponse("missing data array".to_string()))?;
        let latest = history
            .last()
            .ok_or_else(|| BrokerError::InvalidResponse("empty order history".to_string()))?;

        Self::parse_order_entry(latest)
    }

    async fn cancel(
        &self,
        broker_order_id: &str,
        ctx: &RequestContext,
    ) -> Result<BrokerOrderReply, BrokerError> {
        tracing::info!(
            broker_order_id,
            trace_id = %ctx.trace_id,
            "Cancelling order with Zerodha"
        );

        let response = self
            .client
            .delete(format!(
                "{}/orders/regular/{}",
                self.base_url, broker_order_id
            ))
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let body = Self::read_body(response).await?;
        let order_id = body
            .get("data")
            .and_then(|d| d.get("order_id"))
            .and_then(Value::as_str)
            .unwrap_or(broker_order_id)
            .to_string();

        // The cancel acknowledgement carries no fill data; callers that need
        // the final fill poll once more.
        Ok(BrokerOrderReply {
            broker_order_id: order_id,
            status: BrokerOrderStatus::Cancelled,
            filled_quantity: 0,
            pending_quantity: 0,
            average_price: None,
            message: Some("Cancel requested".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_instrument() {
        let (exchange, symbol) = ZerodhaBroker::split_instrument("NSE:RELIANCE").unwrap();
        assert_eq!(exchange, "NSE");
        assert_eq!(symbol, "RELIANCE");
        assert!(ZerodhaBroker::split_instrument("RELIANCE").is_err());
    }

    #[test]
    fn test_parse_status_mapping() {
        assert_eq!(
            ZerodhaBroker::parse_status("COMPLETE", 100),
            BrokerOrderStatus::Complete
        );
        assert_eq!(
            ZerodhaBroker::parse_status("OPEN", 0),
            BrokerOrderStatus::Open
        );
        assert_eq!(
            ZerodhaBroker::parse_status("OPEN", 30),
            BrokerOrderStatus::PartiallyFilled
        );
        assert_eq!(
            ZerodhaBroker::parse_status("CANCELLED", 0),
            BrokerOrderStatus::Cancelled
        );
        assert_eq!(
            ZerodhaBroker::parse_status("REJECTED", 0),
            BrokerOrderStatus::Rejected
        );
        assert_eq!(
            ZerodhaBroker::parse_status("VALIDATION PENDING", 0),
            BrokerOrderStatus::Pending
        );
    }

    #[test]
    fn test_parse_order_entry() {
        let entry = serde_json::json!({
            "order_id": "230124000000001",
            "status": "OPEN",
            "filled_quantity": 40,
            "pending_quantity": 60,
            "average_price": 1249.8,
            "status_message": null
        });
        let reply = ZerodhaBroker::parse_order_entry(&entry).unwrap();
        assert_eq!(reply.broker_order_id, "230124000000001");
        assert_eq!(reply.status, BrokerOrderStatus::PartiallyFilled);
        assert_eq!(reply.filled_quantity, 40);
        assert!(reply.average_price.is_some());
    }

    #[test]
    fn test_parse_order_entry_missing_id() {
        let entry = serde_json::json!({ "status": "OPEN" });
        assert!(ZerodhaBroker::parse_order_entry(&entry).is_err());
    }
}
