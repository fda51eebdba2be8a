use std::sync::Arc;
use herd_booking::BookingOrchestrator;
use herd_store::RedisClient;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

/// Shared secrets accepted on scheduler-only endpoints
#[derive(Clone)]
pub struct InternalAuth {
    pub cron_secret: String,
    pub service_role_key: String,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: BookingOrchestrator,
    /// Rate limiting is skipped when unset
    pub redis: Option<Arc<RedisClient>>,
    pub metrics: Arc<Metrics>,
    pub auth: AuthConfig,
    pub internal: InternalAuth,
    pub webhook_secret: String,
}
