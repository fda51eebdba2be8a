use chrono::Utc;
use uuid::Uuid;
use tracing::{error, info, warn};
use herd_core::payment::IntentStatus;
use herd_core::{
    Booking, BookingPatch, CaptureStatus, LifecycleStatus, Notification, PaymentStatus, TransitionGuard,
};
use crate::error::{BookingError, BookingResult};
use crate::orchestrator::BookingOrchestrator;

/// Deterministic refund key so retried denials never refund twice
pub fn deny_idempotency_key(booking_id: Uuid) -> String {
    format!("deny_{}", booking_id)
}

/// Denial never races an in-flight capture
const DENIABLE_CAPTURE: &[CaptureStatus] = &[
    CaptureStatus::None,
    CaptureStatus::CaptureFailed,
    CaptureStatus::NeedsReconcile,
];

#[derive(Debug, Clone, PartialEq)]
pub struct DenyOutcome {
    pub payment_status: PaymentStatus,
    pub refund_id: Option<String>,
}

impl BookingOrchestrator {
    /// Host denial: release the authorisation, or refund if funds were already taken
    pub async fn deny_booking(&self, booking_id: Uuid, caller: Uuid, message: Option<String>) -> BookingResult<DenyOutcome> {
        let (booking, class) = self.load_for_host(booking_id, caller).await?;

        if booking.status != LifecycleStatus::Pending {
            return Err(BookingError::Invalid(format!(
                "Booking cannot be denied from status {}",
                booking.status
            )));
        }
        if booking.capture_status == CaptureStatus::CaptureInProgress {
            return Err(BookingError::Conflict("Capture in progress, booking is being approved".to_string()));
        }

        // Claim the row first; approval can no longer begin a capture
        let guard = TransitionGuard::any()
            .lifecycle(&[LifecycleStatus::Pending])
            .capture(DENIABLE_CAPTURE);
        let claim = BookingPatch {
            status: Some(LifecycleStatus::Denied),
            host_message: message.clone(),
            denied_at: Some(Utc::now()),
            ..BookingPatch::default()
        };
        if self.ledger.transition(booking_id, &guard, &claim).await?.is_none() {
            return Err(BookingError::Conflict("Booking is no longer pending or a capture started".to_string()));
        }

        let outcome = self.release_funds(&booking).await;

        let settle = BookingPatch {
            payment_status: Some(outcome.payment_status),
            refund_id: outcome.refund_id.clone(),
            ..BookingPatch::default()
        };
        let denied = TransitionGuard::any().lifecycle(&[LifecycleStatus::Denied]);
        if let Err(e) = self.ledger.transition(booking_id, &denied, &settle).await {
            error!(
                booking_id = %booking_id,
                payment_status = %outcome.payment_status,
                "Booking denied but funds outcome not recorded: {}",
                e
            );
            return Err(e.into());
        }

        self.notify_all(vec![Notification::GuestBookingDenied {
            booking_id,
            guest_id: booking.user_id,
            class_id: class.id,
            message,
        }])
        .await;

        info!(
            booking_id = %booking_id,
            payment_status = %outcome.payment_status,
            refunded = outcome.refund_id.is_some(),
            "Booking denied"
        );
        Ok(outcome)
    }

    /// Decide the funds outcome of a denial. Any gateway error resolves to
    /// FAILED so a denied booking is never left looking paid.
    async fn release_funds(&self, booking: &Booking) -> DenyOutcome {
        let failed = DenyOutcome { payment_status: PaymentStatus::Failed, refund_id: None };

        if booking.payment_status == PaymentStatus::Refunded {
            return DenyOutcome {
                payment_status: PaymentStatus::Refunded,
                refund_id: booking.refund_id.clone(),
            };
        }

        let intent_id = match self.resolve_payment_intent(booking).await {
            Ok(Some(id)) => id,
            Ok(None) => return failed,
            Err(e) => {
                warn!(booking_id = %booking.id, "Could not resolve payment intent for denial: {}", e);
                return failed;
            }
        };

        let intent = match self.gateway.retrieve_payment_intent(&intent_id).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(booking_id = %booking.id, "Could not retrieve intent {}: {}", intent_id, e);
                return failed;
            }
        };

        match intent.status {
            IntentStatus::Succeeded => {
                let key = deny_idempotency_key(booking.id);
                match self.gateway.create_refund(&intent_id, &key).await {
                    Ok(refund) => DenyOutcome {
                        payment_status: PaymentStatus::Refunded,
                        refund_id: Some(refund.id),
                    },
                    Err(e) => {
                        error!(booking_id = %booking.id, "Refund of captured denial failed: {}", e);
                        failed
                    }
                }
            }
            status if status.is_cancelable() => {
                if let Err(e) = self.gateway.cancel_payment_intent(&intent_id).await {
                    warn!(booking_id = %booking.id, "Cancel of intent {} failed: {}", intent_id, e);
                }
                failed
            }
            _ => failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approve::ApproveOutcome;
    use crate::mock::{fixture, GatewayCall};
    use std::time::Duration;

    #[tokio::test]
    async fn test_deny_before_capture_cancels_authorisation() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;

        let outcome = fx.orchestrator
            .deny_booking(booking.id, class.host_id, Some("Class is full".to_string()))
            .await
            .unwrap();

        assert_eq!(outcome.payment_status, PaymentStatus::Failed);
        assert_eq!(outcome.refund_id, None);
        assert_eq!(fx.gateway.count(GatewayCall::Cancel).await, 1);
        assert_eq!(fx.gateway.count(GatewayCall::Refund).await, 0);

        let row = fx.store.booking(booking.id).unwrap();
        assert_eq!(row.status, LifecycleStatus::Denied);
        assert_eq!(row.payment_status, PaymentStatus::Failed);
        assert_eq!(row.host_message.as_deref(), Some("Class is full"));
        assert!(row.denied_at.is_some());
    }

    #[tokio::test]
    async fn test_deny_after_capture_refunds_with_booking_key() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.gateway.force_capture(booking.payment_intent_id.as_deref().unwrap()).await;

        let outcome = fx.orchestrator.deny_booking(booking.id, class.host_id, None).await.unwrap();

        assert_eq!(outcome.payment_status, PaymentStatus::Refunded);
        assert!(outcome.refund_id.is_some());
        assert_eq!(fx.gateway.refund_keys().await, vec![format!("deny_{}", booking.id)]);

        let row = fx.store.booking(booking.id).unwrap();
        assert_eq!(row.payment_status, PaymentStatus::Refunded);
        assert_eq!(row.refund_id, outcome.refund_id);

        // A retried denial is refused before it can reach the gateway again
        let again = fx.orchestrator.deny_booking(booking.id, class.host_id, None).await;
        assert!(matches!(again, Err(BookingError::Invalid(_))));
        assert_eq!(fx.gateway.count(GatewayCall::Refund).await, 1);
    }

    #[tokio::test]
    async fn test_repeated_refund_key_returns_same_refund() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        let intent = booking.payment_intent_id.clone().unwrap();
        fx.gateway.force_capture(&intent).await;

        // Simulate a denial whose ledger write never landed, then a retry
        let key = deny_idempotency_key(booking.id);
        let first = fx.gateway.refund_directly(&intent, &key).await;

        let outcome = fx.orchestrator.deny_booking(booking.id, class.host_id, None).await.unwrap();
        assert_eq!(outcome.refund_id, Some(first));
        assert_eq!(fx.gateway.distinct_refunds().await, 1);
    }

    #[tokio::test]
    async fn test_gateway_error_resolves_to_failed() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.gateway.fail_next(GatewayCall::RetrievePaymentIntent).await;

        let outcome = fx.orchestrator.deny_booking(booking.id, class.host_id, None).await.unwrap();
        assert_eq!(outcome.payment_status, PaymentStatus::Failed);
        assert_eq!(fx.store.booking(booking.id).unwrap().status, LifecycleStatus::Denied);
    }

    #[tokio::test]
    async fn test_approved_booking_cannot_be_denied() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.orchestrator.approve_booking(booking.id, class.host_id).await.unwrap();

        let err = fx.orchestrator.deny_booking(booking.id, class.host_id, None).await.unwrap_err();
        assert!(matches!(err, BookingError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_deny_during_capture_is_refused_and_nothing_is_refunded() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.gateway.set_capture_delay(Duration::from_millis(100)).await;

        let approve = fx.orchestrator.approve_booking(booking.id, class.host_id);
        let deny = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fx.orchestrator.deny_booking(booking.id, class.host_id, None).await
        };
        let (approved, denied) = tokio::join!(approve, deny);

        assert_eq!(approved.unwrap(), ApproveOutcome::Captured);
        assert!(matches!(denied, Err(BookingError::Conflict(_))));
        assert_eq!(fx.gateway.count(GatewayCall::Refund).await, 0);
        assert!(fx.gateway.refund_keys().await.is_empty());

        let row = fx.store.booking(booking.id).unwrap();
        assert_eq!(row.status, LifecycleStatus::Approved);
        assert_eq!(row.payment_status, PaymentStatus::Held);
        assert_eq!(row.capture_status, CaptureStatus::Captured);
        assert_eq!(row.refund_id, None);
    }

    #[tokio::test]
    async fn test_capture_cannot_overwrite_a_denial() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.gateway.set_capture_delay(Duration::from_millis(100)).await;

        // The row is denied behind the capture's back, as a stale writer would
        let approve = fx.orchestrator.approve_booking(booking.id, class.host_id);
        let deny_behind = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fx.store.update(booking.id, |b| {
                b.status = LifecycleStatus::Denied;
                b.payment_status = PaymentStatus::Refunded;
            });
        };
        let (approved, _) = tokio::join!(approve, deny_behind);

        assert!(matches!(approved, Err(BookingError::Reconciliation(_))));
        let row = fx.store.booking(booking.id).unwrap();
        assert_eq!(row.status, LifecycleStatus::Denied);
        assert_eq!(row.payment_status, PaymentStatus::Refunded);
        assert_ne!(row.capture_status, CaptureStatus::Captured);
        assert_eq!(fx.store.reconciliations().len(), 1);
    }
}
