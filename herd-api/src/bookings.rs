use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;
use tracing::info;
use herd_booking::{ApproveOutcome, CheckoutOutcome, CheckoutRequest, ConnectOutcome};

use crate::error::AppError;
use crate::middleware::UserClaims;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BookingActionRequest {
    pub booking_id: Uuid,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default, rename = "sessionId", alias = "session_id")]
    pub session_id: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/functions/v1/create-checkout-session", post(create_checkout_session))
        .route("/functions/v1/approve-booking", post(approve_booking))
        .route("/functions/v1/deny-booking", post(deny_booking))
        .route("/functions/v1/confirm-booking", post(confirm_booking))
        .route("/functions/v1/stripe-connect", post(stripe_connect))
}

/// Malformed bodies are client errors with the usual `{"error"}` shape
pub(crate) fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| AppError::ValidationError(e.body_text()))
}

/// POST /functions/v1/create-checkout-session
async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Json<CheckoutOutcome>, AppError> {
    let req = parse_body(payload)?;
    let result = state
        .orchestrator
        .create_checkout_session(claims.sub, claims.email.clone(), req)
        .await
        .map_err(AppError::from);
    let outcome = state.metrics.observe("create_checkout_session", result)?;

    info!(booking_id = %outcome.booking_id, session_id = %outcome.session_id, "Checkout session created");
    Ok(Json(outcome))
}

/// POST /functions/v1/approve-booking
async fn approve_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    payload: Result<Json<BookingActionRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let req = parse_body(payload)?;
    let result = state
        .orchestrator
        .approve_booking(req.booking_id, claims.sub)
        .await
        .map_err(AppError::from);

    let body = match state.metrics.observe("approve_booking", result)? {
        ApproveOutcome::Captured => json!({ "ok": true }),
        ApproveOutcome::AlreadyCaptured => json!({ "ok": true, "already_captured": true }),
    };
    Ok(Json(body))
}

/// POST /functions/v1/deny-booking
async fn deny_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    payload: Result<Json<BookingActionRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let req = parse_body(payload)?;
    let result = state
        .orchestrator
        .deny_booking(req.booking_id, claims.sub, req.message)
        .await
        .map_err(AppError::from);
    let outcome = state.metrics.observe("deny_booking", result)?;

    Ok(Json(json!({
        "ok": true,
        "payment_status": outcome.payment_status,
        "refund_id": outcome.refund_id,
    })))
}

/// POST /functions/v1/confirm-booking
async fn confirm_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    payload: Result<Json<ConfirmRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let req = parse_body(payload)?;
    let result = state
        .orchestrator
        .confirm_booking(claims.sub, &req.session_id)
        .await
        .map_err(AppError::from);
    let view = state.metrics.observe("confirm_booking", result)?;

    Ok(Json(json!({
        "ok": true,
        "session": view.session,
        "booking": view.booking,
    })))
}

/// POST /functions/v1/stripe-connect
async fn stripe_connect(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
) -> Result<Json<ConnectOutcome>, AppError> {
    let result = state
        .orchestrator
        .connect_host_account(claims.sub, claims.email.clone())
        .await
        .map_err(AppError::from);
    let outcome = state.metrics.observe("stripe_connect", result)?;
    Ok(Json(outcome))
}
