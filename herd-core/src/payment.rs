use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Gateway-side status of a payment intent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    /// Authorised and held, waiting for capture
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::RequiresPaymentMethod => "requires_payment_method",
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::Processing => "processing",
            IntentStatus::RequiresCapture => "requires_capture",
            IntentStatus::Canceled => "canceled",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Unknown => "unknown",
        }
    }

    /// Funds have not moved yet, so cancelling releases them
    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            IntentStatus::RequiresPaymentMethod
                | IntentStatus::RequiresConfirmation
                | IntentStatus::RequiresAction
                | IntentStatus::Processing
                | IntentStatus::RequiresCapture
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    Automatic,
    /// Authorisation hold only; captured on host approval
    Manual,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Automatic => "automatic",
            CaptureMethod::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentIntent {
    pub id: String,
    pub status: IntentStatus,
    pub amount: i64,
    pub amount_received: i64,
    pub latest_charge: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub customer_email: Option<String>,
    pub amount_total: Option<i64>,
    pub payment_intent_id: Option<String>,
    /// Present when the intent was expanded in the response
    pub payment_intent: Option<PaymentIntent>,
    pub metadata: HashMap<String, String>,
}

/// Everything needed to open a hosted checkout page for one booking
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckoutSessionRequest {
    pub product_name: String,
    pub unit_amount: i64,
    pub quantity: i64,
    pub currency: String,
    pub capture_method: CaptureMethod,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub transfer_group: String,
    /// Written to both the session and its payment intent
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Refund {
    pub id: String,
    pub status: Option<String>,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransferRequest {
    pub amount: i64,
    pub currency: String,
    pub destination: String,
    /// Charge the transfer is funded from, when known
    pub source_transaction: Option<String>,
    pub transfer_group: Option<String>,
    pub idempotency_key: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transfer {
    pub id: String,
    pub amount: i64,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectedAccountRequest {
    pub email: Option<String>,
    pub country: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectedAccount {
    pub id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway rejected request ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("gateway unreachable: {0}")]
    Transport(String),
    #[error("unexpected gateway response: {0}")]
    Decode(String),
    #[error("webhook signature invalid: {0}")]
    Signature(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Capabilities of the remote payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(&self, request: &CheckoutSessionRequest) -> GatewayResult<CheckoutSession>;

    /// Retrieve a session with its payment intent and customer expanded
    async fn retrieve_checkout_session(&self, session_id: &str) -> GatewayResult<CheckoutSession>;

    async fn retrieve_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent>;

    /// Capture a previously authorised payment
    async fn capture_payment_intent(&self, intent_id: &str, idempotency_key: &str) -> GatewayResult<PaymentIntent>;

    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent>;

    async fn create_refund(&self, intent_id: &str, idempotency_key: &str) -> GatewayResult<Refund>;

    async fn create_transfer(&self, request: &TransferRequest) -> GatewayResult<Transfer>;

    async fn create_connected_account(&self, request: &ConnectedAccountRequest) -> GatewayResult<ConnectedAccount>;

    async fn retrieve_connected_account(&self, account_id: &str) -> GatewayResult<ConnectedAccount>;

    /// Hosted onboarding link for a connected account
    async fn create_account_link(&self, account_id: &str, refresh_url: &str, return_url: &str) -> GatewayResult<String>;
}

/// A verified, parsed webhook delivery
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    pub id: String,
    pub kind: GatewayEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEventKind {
    CheckoutCompleted(CheckoutSession),
    CheckoutExpired(CheckoutSession),
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_status_deserializes_unknown_values() {
        let s: IntentStatus = serde_json::from_str("\"requires_capture\"").unwrap();
        assert_eq!(s, IntentStatus::RequiresCapture);
        let s: IntentStatus = serde_json::from_str("\"some_future_state\"").unwrap();
        assert_eq!(s, IntentStatus::Unknown);
    }

    #[test]
    fn test_cancelable_states() {
        assert!(IntentStatus::RequiresCapture.is_cancelable());
        assert!(!IntentStatus::Succeeded.is_cancelable());
        assert!(!IntentStatus::Canceled.is_cancelable());
    }
}
