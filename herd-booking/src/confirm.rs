use serde::Serialize;
use uuid::Uuid;
use tracing::warn;
use herd_core::Booking;
use crate::error::{BookingError, BookingResult};
use crate::orchestrator::BookingOrchestrator;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub customer_email: Option<String>,
    pub amount_total: Option<i64>,
}

/// Authoritative state for a guest returning from checkout
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConfirmationView {
    pub session: SessionSummary,
    /// May be absent, or still PENDING, if the webhook has not landed yet
    pub booking: Option<Booking>,
}

impl BookingOrchestrator {
    /// Read-only: fetches the gateway session and the matching ledger row.
    /// Never transitions the ledger.
    pub async fn confirm_booking(&self, caller: Uuid, session_id: &str) -> BookingResult<ConfirmationView> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(BookingError::Invalid("Missing sessionId".to_string()));
        }

        let session = self.gateway.retrieve_checkout_session(session_id).await?;
        let booking = self.ledger.find_booking_by_session(session_id).await?;

        if booking.as_ref().is_some_and(|b| b.user_id != caller) {
            warn!(session_id = %session_id, caller = %caller, "Booking owner mismatch on confirmation");
            return Err(BookingError::Forbidden("This checkout session belongs to another user".to_string()));
        }

        let session_owner = session.metadata.get("user_id");
        if session_owner.is_some_and(|owner| owner != &caller.to_string()) {
            warn!(session_id = %session_id, caller = %caller, "Session metadata owner mismatch on confirmation");
            return Err(BookingError::Forbidden("This checkout session belongs to another user".to_string()));
        }

        Ok(ConfirmationView {
            session: SessionSummary {
                id: session.id,
                status: session.status,
                payment_status: session.payment_status,
                customer_email: session.customer_email,
                amount_total: session.amount_total,
            },
            booking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fixture;
    use herd_core::LifecycleStatus;

    #[tokio::test]
    async fn test_guest_sees_session_and_booking() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        let session_id = booking.checkout_session_id.clone().unwrap();

        let view = fx.orchestrator.confirm_booking(booking.user_id, &session_id).await.unwrap();

        assert_eq!(view.session.id, session_id);
        assert_eq!(view.session.payment_status.as_deref(), Some("unpaid"));
        let row = view.booking.unwrap();
        assert_eq!(row.id, booking.id);
        assert_eq!(row.status, LifecycleStatus::Pending);
        assert_eq!(fx.store.booking(booking.id).unwrap(), row);
    }

    #[tokio::test]
    async fn test_other_guest_is_forbidden() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        let session_id = booking.checkout_session_id.clone().unwrap();

        let err = fx.orchestrator.confirm_booking(Uuid::new_v4(), &session_id).await.unwrap_err();
        assert!(matches!(err, BookingError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_session_metadata_owner_is_checked_without_booking() {
        let fx = fixture();
        let owner = Uuid::new_v4();
        let session_id = fx.gateway.add_orphan_session(owner).await;

        let err = fx.orchestrator.confirm_booking(Uuid::new_v4(), &session_id).await.unwrap_err();
        assert!(matches!(err, BookingError::Forbidden(_)));

        let view = fx.orchestrator.confirm_booking(owner, &session_id).await.unwrap();
        assert!(view.booking.is_none());
    }

    #[tokio::test]
    async fn test_missing_session_id() {
        let fx = fixture();
        let err = fx.orchestrator.confirm_booking(Uuid::new_v4(), "  ").await.unwrap_err();
        assert!(matches!(err, BookingError::Invalid(_)));
    }
}
