use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::AppError;
use crate::state::AppState;

pub struct Metrics {
    registry: Registry,
    operations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let operations = IntCounterVec::new(
            Opts::new("herd_payment_operations_total", "Payment lifecycle operations by outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations.clone()))?;
        Ok(Self { registry, operations })
    }

    pub fn record(&self, operation: &str, outcome: &str) {
        self.operations.with_label_values(&[operation, outcome]).inc();
    }

    /// Count the result of one handler call and pass it through
    pub fn observe<T>(&self, operation: &str, result: Result<T, AppError>) -> Result<T, AppError> {
        match &result {
            Ok(_) => self.record(operation, "ok"),
            Err(e) => self.record(operation, e.kind()),
        }
        result
    }

    pub fn count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations.with_label_values(&[operation, outcome]).get()
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        ).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
