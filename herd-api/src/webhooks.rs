use axum::{
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use herd_store::stripe::parse_webhook;

use crate::error::AppError;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

pub fn routes() -> Router<AppState> {
    Router::new().route("/functions/v1/stripe-webhook", post(handle_stripe_webhook))
}

/// POST /functions/v1/stripe-webhook
/// The body is taken raw: the signature covers the exact bytes sent.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::ValidationError("Missing Stripe-Signature header".to_string()))?;

    let event = parse_webhook(&body, signature, &state.webhook_secret, Utc::now().timestamp())
        .map_err(|e| {
            tracing::warn!("Rejected webhook delivery: {}", e);
            state.metrics.record("stripe_webhook", "rejected");
            AppError::ValidationError(e.to_string())
        })?;

    tracing::info!(event = %event.id, "Received gateway webhook");

    let result = state
        .orchestrator
        .handle_gateway_event(event)
        .await
        .map_err(AppError::from);
    let outcome = state.metrics.observe("stripe_webhook", result)?;

    Ok(Json(json!({ "received": true, "outcome": outcome })))
}
