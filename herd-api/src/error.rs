use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use herd_booking::BookingError;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    /// Surfaced to the caller with its message
    PaymentError(String),
    InternalServerError(String),
    Anyhow(anyhow::Error),
}

impl AppError {
    /// Short label used as the `outcome` metric value
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::AuthenticationError(_) => "unauthorized",
            AppError::AuthorizationError(_) => "forbidden",
            AppError::ValidationError(_) => "invalid",
            AppError::NotFoundError(_) => "not_found",
            AppError::ConflictError(_) => "conflict",
            AppError::PaymentError(_) => "payment_error",
            AppError::InternalServerError(_) | AppError::Anyhow(_) => "error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::PaymentError(msg) => {
                tracing::error!("Payment operation failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::Invalid(msg) => AppError::ValidationError(msg),
            BookingError::Forbidden(msg) => AppError::AuthorizationError(msg),
            BookingError::NotFound(msg) => AppError::NotFoundError(msg),
            BookingError::Conflict(msg) => AppError::ConflictError(msg),
            BookingError::Gateway(e) => AppError::PaymentError(e.to_string()),
            BookingError::Reconciliation(msg) => AppError::PaymentError(msg),
            BookingError::Ledger(e) => AppError::InternalServerError(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Anyhow(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_core::{GatewayError, LedgerError};

    fn status_of(err: BookingError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_booking_errors_map_to_http_status() {
        assert_eq!(status_of(BookingError::Invalid("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(BookingError::Forbidden("no".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_of(BookingError::NotFound("gone".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(BookingError::Conflict("busy".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(BookingError::Gateway(GatewayError::Transport("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(BookingError::Ledger(LedgerError::Unavailable("db".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_ledger_details_are_not_leaked() {
        let response = AppError::from(BookingError::Ledger(LedgerError::Unavailable("password=hunter2".into())))
            .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Internal Server Error");
    }

    #[tokio::test]
    async fn test_gateway_message_reaches_caller() {
        let response = AppError::from(BookingError::Gateway(GatewayError::Transport("card declined".into())))
            .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().unwrap().contains("card declined"));
    }
}
