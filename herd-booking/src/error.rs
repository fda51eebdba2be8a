use herd_core::{GatewayError, LedgerError};

/// Failures surfaced by lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Another invocation owns the transition; safe to retry later
    #[error("{0}")]
    Conflict(String),

    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Funds moved at the gateway but the ledger could not record it
    #[error("{0}")]
    Reconciliation(String),
}

pub type BookingResult<T> = Result<T, BookingError>;

impl BookingError {
    /// Client errors are never retried automatically
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BookingError::Invalid(_) | BookingError::Forbidden(_) | BookingError::NotFound(_)
        )
    }
}
