use axum::{
    routing::get,
    Router,
    http::Method,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod bookings;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod middleware;
pub mod state;
pub mod webhooks;
pub mod worker;

pub use state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let user_routes = bookings::routes()
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::user_auth_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit_middleware));

    let internal_routes = jobs::routes()
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::internal_auth_middleware));

    Router::new()
        .merge(user_routes)
        .merge(internal_routes)
        .merge(webhooks::routes())
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
