use axum::{
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use herd_booking::{PayoutSummary, PendingSweepSummary, ReconcileSummary};

use crate::error::AppError;
use crate::state::AppState;

/// Sweep summary with the `ok` flag schedulers look for
#[derive(Debug, Serialize)]
pub struct SweepResponse<T> {
    pub ok: bool,
    #[serde(flatten)]
    pub summary: T,
}

impl<T> From<T> for SweepResponse<T> {
    fn from(summary: T) -> Self {
        Self { ok: true, summary }
    }
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    pub limit: Option<i64>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/functions/v1/expire-booking-holds", post(expire_booking_holds))
        .route("/functions/v1/expire-pending-bookings", post(expire_pending_bookings))
        .route("/functions/v1/reconcile-payments", post(reconcile_payments))
        .route("/functions/v1/release-held-payments", post(release_held_payments))
}

async fn expire_booking_holds(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let result = state
        .orchestrator
        .expire_booking_holds(Utc::now())
        .await
        .map_err(AppError::from);
    let expired = state.metrics.observe("expire_booking_holds", result)?;
    Ok(Json(json!({ "ok": true, "expired": expired })))
}

async fn expire_pending_bookings(
    State(state): State<AppState>,
    Query(query): Query<SweepQuery>,
) -> Result<Json<SweepResponse<PendingSweepSummary>>, AppError> {
    let result = state
        .orchestrator
        .expire_pending_bookings(Utc::now(), query.limit)
        .await
        .map_err(AppError::from);
    let summary = state.metrics.observe("expire_pending_bookings", result)?;
    Ok(Json(summary.into()))
}

async fn reconcile_payments(
    State(state): State<AppState>,
) -> Result<Json<SweepResponse<ReconcileSummary>>, AppError> {
    let result = state
        .orchestrator
        .reconcile_payments(Utc::now())
        .await
        .map_err(AppError::from);
    let summary = state.metrics.observe("reconcile_payments", result)?;
    Ok(Json(summary.into()))
}

async fn release_held_payments(
    State(state): State<AppState>,
) -> Result<Json<SweepResponse<PayoutSummary>>, AppError> {
    let result = state
        .orchestrator
        .release_held_payments(Utc::now())
        .await
        .map_err(AppError::from);
    let summary = state.metrics.observe("release_held_payments", result)?;
    Ok(Json(summary.into()))
}
