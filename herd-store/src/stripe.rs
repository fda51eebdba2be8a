use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};
use herd_core::payment::{
    CheckoutSession, CheckoutSessionRequest, ConnectedAccount, ConnectedAccountRequest, GatewayEvent,
    GatewayEventKind, IntentStatus, PaymentIntent, Refund, Transfer, TransferRequest,
};
use herd_core::{GatewayError, GatewayResult, PaymentGateway};
use crate::app_config::StripeConfig;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook delivery
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// A field Stripe returns either as an id or, when expanded, as the object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

impl Expandable<IdOnly> {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(obj) => obj.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    id: String,
    status: IntentStatus,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    amount_received: i64,
    latest_charge: Option<Expandable<IdOnly>>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<RawIntent> for PaymentIntent {
    fn from(raw: RawIntent) -> Self {
        PaymentIntent {
            id: raw.id,
            status: raw.status,
            amount: raw.amount,
            amount_received: raw.amount_received,
            latest_charge: raw.latest_charge.map(Expandable::into_id),
            metadata: raw.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CustomerDetails {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSession {
    id: String,
    url: Option<String>,
    status: Option<String>,
    payment_status: Option<String>,
    customer_email: Option<String>,
    customer_details: Option<CustomerDetails>,
    amount_total: Option<i64>,
    payment_intent: Option<Expandable<RawIntent>>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<RawSession> for CheckoutSession {
    fn from(raw: RawSession) -> Self {
        let (payment_intent_id, payment_intent) = match raw.payment_intent {
            Some(Expandable::Id(id)) => (Some(id), None),
            Some(Expandable::Object(intent)) => (Some(intent.id.clone()), Some(PaymentIntent::from(*intent))),
            None => (None, None),
        };
        let customer_email = raw
            .customer_email
            .or_else(|| raw.customer_details.and_then(|d| d.email));

        CheckoutSession {
            id: raw.id,
            url: raw.url,
            status: raw.status,
            payment_status: raw.payment_status,
            customer_email,
            amount_total: raw.amount_total,
            payment_intent_id,
            payment_intent,
            metadata: raw.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAccountLink {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Stripe REST client bound to one secret key
pub struct StripeGateway {
    http: reqwest::Client,
    api_base: String,
    api_version: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(http: reqwest::Client, config: &StripeConfig) -> Self {
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> GatewayResult<T> {
        let request = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .query(query);
        self.send(request).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> GatewayResult<T> {
        let mut request = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> GatewayResult<T> {
        let response = request
            .header("Stripe-Version", &self.api_version)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(env) => (env.error.code, env.error.message.unwrap_or_else(|| status.to_string())),
                Err(_) => (None, status.to_string()),
            };
            warn!(status = status.as_u16(), code = ?code, "Stripe request failed: {}", message);
            return Err(GatewayError::Api { status: status.as_u16(), code, message });
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

fn pair(key: impl Into<String>, value: impl ToString) -> (String, String) {
    (key.into(), value.to_string())
}

fn metadata_pairs(prefix: &str, metadata: &HashMap<String, String>) -> Vec<(String, String)> {
    metadata
        .iter()
        .map(|(k, v)| (format!("{}[{}]", prefix, k), v.clone()))
        .collect()
}

/// Form body for `POST /v1/checkout/sessions`
fn checkout_form(req: &CheckoutSessionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        pair("mode", "payment"),
        pair("success_url", &req.success_url),
        pair("cancel_url", &req.cancel_url),
        pair("line_items[0][quantity]", req.quantity),
        pair("line_items[0][price_data][currency]", &req.currency),
        pair("line_items[0][price_data][unit_amount]", req.unit_amount),
        pair("line_items[0][price_data][product_data][name]", &req.product_name),
        pair("payment_intent_data[capture_method]", req.capture_method.as_str()),
        pair("payment_intent_data[transfer_group]", &req.transfer_group),
    ];
    if let Some(email) = &req.customer_email {
        form.push(pair("customer_email", email));
    }
    form.extend(metadata_pairs("metadata", &req.metadata));
    form.extend(metadata_pairs("payment_intent_data[metadata]", &req.metadata));
    form
}

fn transfer_form(req: &TransferRequest) -> Vec<(String, String)> {
    let mut form = vec![
        pair("amount", req.amount),
        pair("currency", &req.currency),
        pair("destination", &req.destination),
    ];
    if let Some(charge) = &req.source_transaction {
        form.push(pair("source_transaction", charge));
    }
    if let Some(group) = &req.transfer_group {
        form.push(pair("transfer_group", group));
    }
    form.extend(metadata_pairs("metadata", &req.metadata));
    form
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(&self, request: &CheckoutSessionRequest) -> GatewayResult<CheckoutSession> {
        let raw: RawSession = self.post("/v1/checkout/sessions", &checkout_form(request), None).await?;
        debug!(session_id = %raw.id, "Checkout session created");
        Ok(raw.into())
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> GatewayResult<CheckoutSession> {
        let raw: RawSession = self
            .get(
                &format!("/v1/checkout/sessions/{}", session_id),
                &[("expand[]", "payment_intent"), ("expand[]", "customer")],
            )
            .await?;
        Ok(raw.into())
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let raw: RawIntent = self.get(&format!("/v1/payment_intents/{}", intent_id), &[]).await?;
        Ok(raw.into())
    }

    async fn capture_payment_intent(&self, intent_id: &str, idempotency_key: &str) -> GatewayResult<PaymentIntent> {
        let raw: RawIntent = self
            .post(&format!("/v1/payment_intents/{}/capture", intent_id), &[], Some(idempotency_key))
            .await?;
        Ok(raw.into())
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let raw: RawIntent = self
            .post(&format!("/v1/payment_intents/{}/cancel", intent_id), &[], None)
            .await?;
        Ok(raw.into())
    }

    async fn create_refund(&self, intent_id: &str, idempotency_key: &str) -> GatewayResult<Refund> {
        self.post("/v1/refunds", &[pair("payment_intent", intent_id)], Some(idempotency_key))
            .await
    }

    async fn create_transfer(&self, request: &TransferRequest) -> GatewayResult<Transfer> {
        self.post("/v1/transfers", &transfer_form(request), Some(&request.idempotency_key))
            .await
    }

    async fn create_connected_account(&self, request: &ConnectedAccountRequest) -> GatewayResult<ConnectedAccount> {
        let mut form = vec![
            pair("type", "express"),
            pair("country", &request.country),
            pair("capabilities[card_payments][requested]", "true"),
            pair("capabilities[transfers][requested]", "true"),
        ];
        if let Some(email) = &request.email {
            form.push(pair("email", email));
        }
        form.extend(metadata_pairs("metadata", &request.metadata));
        self.post("/v1/accounts", &form, None).await
    }

    async fn retrieve_connected_account(&self, account_id: &str) -> GatewayResult<ConnectedAccount> {
        self.get(&format!("/v1/accounts/{}", account_id), &[]).await
    }

    async fn create_account_link(&self, account_id: &str, refresh_url: &str, return_url: &str) -> GatewayResult<String> {
        let form = [
            pair("account", account_id),
            pair("refresh_url", refresh_url),
            pair("return_url", return_url),
            pair("type", "account_onboarding"),
        ];
        let link: RawAccountLink = self.post("/v1/account_links", &form, None).await?;
        Ok(link.url)
    }
}

/// Gateway clients keyed by secret key. Built once at startup and shared;
/// never mutated per request.
#[derive(Clone)]
pub struct GatewayRegistry {
    default_key: String,
    clients: HashMap<String, Arc<StripeGateway>>,
}

impl GatewayRegistry {
    pub fn new(config: &StripeConfig, extra: &[StripeConfig]) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let mut clients = HashMap::new();
        for cfg in std::iter::once(config).chain(extra) {
            clients
                .entry(cfg.secret_key.clone())
                .or_insert_with(|| Arc::new(StripeGateway::new(http.clone(), cfg)));
        }

        Ok(Self { default_key: config.secret_key.clone(), clients })
    }

    pub fn client(&self, secret_key: &str) -> Option<Arc<StripeGateway>> {
        self.clients.get(secret_key).cloned()
    }

    pub fn default_client(&self) -> GatewayResult<Arc<StripeGateway>> {
        self.client(&self.default_key)
            .ok_or_else(|| GatewayError::Transport("no gateway client configured".to_string()))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against the raw body
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> GatewayResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| GatewayError::Signature("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(GatewayError::Signature("missing v1 signature".to_string()));
    }
    if (now - timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        return Err(GatewayError::Signature("timestamp outside tolerance".to_string()));
    }

    for candidate in signatures {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Signature(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(GatewayError::Signature("no matching signature".to_string()))
}

/// Verify and decode a webhook delivery
pub fn parse_webhook(payload: &str, header: &str, secret: &str, now: i64) -> GatewayResult<GatewayEvent> {
    verify_signature(payload, header, secret, now)?;

    let raw: RawEvent = serde_json::from_str(payload).map_err(|e| GatewayError::Decode(e.to_string()))?;
    let session = |object: serde_json::Value| -> GatewayResult<CheckoutSession> {
        let raw: RawSession = serde_json::from_value(object).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(raw.into())
    };

    let kind = match raw.kind.as_str() {
        "checkout.session.completed" => GatewayEventKind::CheckoutCompleted(session(raw.data.object)?),
        "checkout.session.expired" => GatewayEventKind::CheckoutExpired(session(raw.data.object)?),
        _ => GatewayEventKind::Other(raw.kind),
    };

    Ok(GatewayEvent { id: raw.id, kind })
}
