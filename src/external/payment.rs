//! Payment gateway client — synchronous request/response over HTTP.
//!
//! Provider-specific error payloads are passed through unmodified; the
//! payment widget only cares whether an order reaches terminal success.

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PaymentError;

/// Terminal and non-terminal payment states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Success,
    Pending,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Customer details attached to an order.
#[derive(Debug, Clone, Serialize)]
pub struct CustomerRef {
    pub customer_id: String,
    pub phone: String,
}

/// The two calls the intake core depends on.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount: Decimal,
        customer: &CustomerRef,
    ) -> Result<String, PaymentError>;

    async fn fetch_payment_status(&self, order_id: &str) -> Result<PaymentStatus, PaymentError>;
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    order_amount: Decimal,
    order_currency: &'a str,
    customer_details: &'a CustomerRef,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    order_status: String,
}

/// HTTP gateway client. Auth headers per provider convention; responses
/// outside 2xx surface the raw payload.
pub struct HttpPaymentGateway {
    base_url: Url,
    client: reqwest::Client,
    api_key: SecretString,
    currency: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: Url, api_key: SecretString, currency: impl Into<String>) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            api_key,
            currency: currency.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, PaymentError> {
        self.base_url
            .join(path)
            .map_err(|e| PaymentError::Http(format!("bad endpoint {path}: {e}")))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, PaymentError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        // Pass the provider's payload through unmodified.
        let payload = resp.text().await.unwrap_or_default();
        Err(PaymentError::Provider {
            status: status.as_u16(),
            payload,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_order(
        &self,
        amount: Decimal,
        customer: &CustomerRef,
    ) -> Result<String, PaymentError> {
        let body = CreateOrderRequest {
            order_amount: amount,
            order_currency: &self.currency,
            customer_details: customer,
        };
        let resp = self
            .client
            .post(self.endpoint("orders")?)
            .header("x-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;
        let parsed: CreateOrderResponse = resp
            .json()
            .await
            .map_err(|e| PaymentError::InvalidResponse(e.to_string()))?;
        Ok(parsed.order_id)
    }

    async fn fetch_payment_status(&self, order_id: &str) -> Result<PaymentStatus, PaymentError> {
        let resp = self
            .client
            .get(self.endpoint(&format!("orders/{order_id}"))?)
            .header("x-api-key", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| PaymentError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;
        let parsed: OrderStatusResponse = resp
            .json()
            .await
            .map_err(|e| PaymentError::InvalidResponse(e.to_string()))?;
        Ok(parse_order_status(&parsed.order_status))
    }
}

/// Map a provider status string onto the closed status set. Anything not
/// recognizably terminal counts as pending, never as success.
fn parse_order_status(s: &str) -> PaymentStatus {
    match s {
        "PAID" | "SUCCESS" => PaymentStatus::Success,
        "FAILED" | "CANCELLED" | "EXPIRED" | "VOID" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_request_serializes_amount_as_string() {
        let customer = CustomerRef {
            customer_id: "p1".into(),
            phone: "+15550100".into(),
        };
        let body = CreateOrderRequest {
            order_amount: dec!(2999.00),
            order_currency: "INR",
            customer_details: &customer,
        };
        let json = serde_json::to_value(&body).unwrap();
        // serde-with-str keeps decimal amounts exact on the wire.
        assert_eq!(json["order_amount"], "2999.00");
        assert_eq!(json["customer_details"]["customer_id"], "p1");
    }

    #[test]
    fn status_mapping_is_conservative() {
        assert_eq!(parse_order_status("PAID"), PaymentStatus::Success);
        assert_eq!(parse_order_status("FAILED"), PaymentStatus::Failed);
        assert_eq!(parse_order_status("ACTIVE"), PaymentStatus::Pending);
        // Unknown states never count as success.
        assert_eq!(parse_order_status("SOMETHING_NEW"), PaymentStatus::Pending);
    }

    #[test]
    fn only_success_is_terminal() {
        assert!(PaymentStatus::Success.is_terminal_success());
        assert!(!PaymentStatus::Pending.is_terminal_success());
        assert!(!PaymentStatus::Failed.is_terminal_success());
    }

    #[test]
    fn status_response_parses() {
        let parsed: OrderStatusResponse =
            serde_json::from_str(r#"{"order_status":"PAID","cf_order_id":123}"#).unwrap();
        assert_eq!(parse_order_status(&parsed.order_status), PaymentStatus::Success);
    }
}
