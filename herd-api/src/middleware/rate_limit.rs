use std::net::SocketAddr;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    http::StatusCode,
};

use crate::state::AppState;

const REQUESTS_PER_WINDOW: i64 = 100;
const WINDOW_SECONDS: i64 = 60;

/// Fixed-window limiter keyed by client IP. Fails open when Redis is
/// unreachable or not configured.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let addr = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let (Some(redis), Some(addr)) = (state.redis.clone(), addr) else {
        return next.run(req).await;
    };

    let key = format!("ratelimit:{}", addr.ip());

    match redis.check_rate_limit(&key, REQUESTS_PER_WINDOW, WINDOW_SECONDS).await {
        Ok(true) => next.run(req).await,
        Ok(false) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response(),
        Err(e) => {
            tracing::warn!("Rate limiter unavailable, allowing request: {}", e);
            next.run(req).await
        }
    }
}
