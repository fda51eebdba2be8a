use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
    http::StatusCode,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

// ============================================================================
// JWT Claims
// ============================================================================

/// Authenticated end user. Hosts and guests share one token shape; ownership
/// checks happen against the booking, not the role.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserClaims {
    pub sub: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: usize,
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

// ============================================================================
// User Authentication Middleware
// ============================================================================

pub async fn user_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(&req).ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<UserClaims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    ).map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(token_data.claims);

    Ok(next.run(req).await)
}

// ============================================================================
// Internal (scheduler / service) Authentication Middleware
// ============================================================================

/// Accepts either the cron secret header or the service-role key as a bearer token
pub async fn internal_auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if is_internal_caller(&state, &req) {
        Ok(next.run(req).await)
    } else {
        tracing::warn!(path = %req.uri().path(), "Rejected internal call without valid secret");
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn is_internal_caller(state: &AppState, req: &Request) -> bool {
    let cron_ok = req
        .headers()
        .get(CRON_SECRET_HEADER)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|v| !state.internal.cron_secret.is_empty() && v == state.internal.cron_secret);

    let service_ok = bearer_token(req)
        .is_some_and(|t| !state.internal.service_role_key.is_empty() && t == state.internal.service_role_key);

    cron_ok || service_ok
}
