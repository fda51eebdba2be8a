use serde::Serialize;
use uuid::Uuid;
use tracing::{info, warn};
use herd_core::payment::{CheckoutSession, GatewayEvent, GatewayEventKind, IntentStatus};
use herd_core::{
    Booking, BookingPatch, CaptureStatus, CaptureTransition, LifecycleStatus, Notification,
    PaymentStatus, TransitionGuard,
};
use crate::error::BookingResult;
use crate::orchestrator::BookingOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Funds were captured at checkout and the booking is now approved
    Captured,
    /// Authorisation recorded; waits for host approval
    Authorised,
    Expired,
    Ignored,
}

impl BookingOrchestrator {
    /// Apply a verified gateway event to the ledger. Unknown bookings and
    /// event types are acknowledged so the gateway stops redelivering them.
    pub async fn handle_gateway_event(&self, event: GatewayEvent) -> BookingResult<WebhookOutcome> {
        match event.kind {
            GatewayEventKind::CheckoutCompleted(session) => self.on_checkout_completed(&event.id, session).await,
            GatewayEventKind::CheckoutExpired(session) => self.on_checkout_expired(&event.id, session).await,
            GatewayEventKind::Other(kind) => {
                info!(event = %event.id, kind = %kind, "Ignoring gateway event");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn booking_for_session(&self, session: &CheckoutSession) -> BookingResult<Option<Booking>> {
        if let Some(booking) = self.ledger.find_booking_by_session(&session.id).await? {
            return Ok(Some(booking));
        }
        let Some(id) = session.metadata.get("booking_id").and_then(|v| v.parse::<Uuid>().ok()) else {
            return Ok(None);
        };
        Ok(self.ledger.get_booking(id).await?)
    }

    async fn on_checkout_completed(&self, event_id: &str, session: CheckoutSession) -> BookingResult<WebhookOutcome> {
        let Some(booking) = self.booking_for_session(&session).await? else {
            warn!(event = %event_id, session_id = %session.id, "Completed session has no booking");
            return Ok(WebhookOutcome::Ignored);
        };

        let intent_id = session
            .payment_intent_id
            .clone()
            .or_else(|| session.payment_intent.as_ref().map(|pi| pi.id.clone()));

        if booking.payment_intent_id.is_none() || booking.checkout_session_id.is_none() {
            let patch = BookingPatch {
                payment_intent_id: if booking.payment_intent_id.is_none() { intent_id.clone() } else { None },
                checkout_session_id: if booking.checkout_session_id.is_none() { Some(session.id.clone()) } else { None },
                ..BookingPatch::default()
            };
            self.ledger.transition(booking.id, &TransitionGuard::any(), &patch).await?;
        }

        let captured_intent = session
            .payment_intent
            .as_ref()
            .filter(|pi| pi.status == IntentStatus::Succeeded);
        let Some(intent) = captured_intent else {
            info!(booking_id = %booking.id, session_id = %session.id, "Checkout authorised, awaiting host approval");
            return Ok(WebhookOutcome::Authorised);
        };

        // Automatic capture: the gateway already took the funds
        let transition = CaptureTransition::ReconcileCaptured;
        let guard = TransitionGuard::for_capture(transition)
            .lifecycle(&[LifecycleStatus::Pending])
            .capture(&[CaptureStatus::None]);
        let patch = self.captured_patch(&booking, intent, transition);

        if self.ledger.transition(booking.id, &guard, &patch).await?.is_none() {
            info!(booking_id = %booking.id, "Booking already moved on, webhook capture is a no-op");
            return Ok(WebhookOutcome::Ignored);
        }

        let class = self.load_class(booking.class_id).await?;
        self.notify_all(vec![
            Notification::HostBookingConfirmed {
                booking_id: booking.id,
                host_id: class.host_id,
                class_id: class.id,
            },
            Notification::GuestBookingConfirmed {
                booking_id: booking.id,
                guest_id: booking.user_id,
                class_id: class.id,
            },
        ])
        .await;

        info!(booking_id = %booking.id, intent = %intent.id, "Booking captured at checkout");
        Ok(WebhookOutcome::Captured)
    }

    async fn on_checkout_expired(&self, event_id: &str, session: CheckoutSession) -> BookingResult<WebhookOutcome> {
        let Some(booking) = self.booking_for_session(&session).await? else {
            warn!(event = %event_id, session_id = %session.id, "Expired session has no booking");
            return Ok(WebhookOutcome::Ignored);
        };

        let guard = TransitionGuard::any()
            .lifecycle(&[LifecycleStatus::Pending])
            .payment(&[PaymentStatus::Unpaid])
            .capture(&[CaptureStatus::None]);
        let patch = BookingPatch {
            status: Some(LifecycleStatus::Cancelled),
            payment_status: Some(PaymentStatus::Failed),
            ..BookingPatch::default()
        };

        if self.ledger.transition(booking.id, &guard, &patch).await?.is_none() {
            return Ok(WebhookOutcome::Ignored);
        }
        if let Err(e) = self.ledger.release_hold(booking.id).await {
            warn!(booking_id = %booking.id, "Failed to release hold for expired session: {}", e);
        }

        info!(booking_id = %booking.id, session_id = %session.id, "Checkout session expired, booking cancelled");
        Ok(WebhookOutcome::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fixture;
    use herd_core::{HoldStatus, PaymentGateway};

    fn event(kind: GatewayEventKind) -> GatewayEvent {
        GatewayEvent { id: "evt_1".to_string(), kind }
    }

    #[tokio::test]
    async fn test_completed_manual_session_only_backfills() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.store.update(booking.id, |b| b.payment_intent_id = None);
        let session = fx.gateway
            .retrieve_checkout_session(booking.checkout_session_id.as_deref().unwrap())
            .await
            .unwrap();

        let outcome = fx.orchestrator
            .handle_gateway_event(event(GatewayEventKind::CheckoutCompleted(session)))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Authorised);
        let row = fx.store.booking(booking.id).unwrap();
        assert_eq!(row.payment_intent_id, booking.payment_intent_id);
        assert_eq!(row.status, LifecycleStatus::Pending);
        assert!(fx.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_completed_automatic_session_approves_booking() {
        let fx = fixture();
        let class = fx.store.add_class(true, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.gateway.force_capture(booking.payment_intent_id.as_deref().unwrap()).await;
        let session = fx.gateway
            .retrieve_checkout_session(booking.checkout_session_id.as_deref().unwrap())
            .await
            .unwrap();

        let outcome = fx.orchestrator
            .handle_gateway_event(event(GatewayEventKind::CheckoutCompleted(session.clone())))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Captured);

        let row = fx.store.booking(booking.id).unwrap();
        assert_eq!(row.status, LifecycleStatus::Approved);
        assert_eq!(row.payment_status, PaymentStatus::Held);
        assert_eq!(row.capture_status, CaptureStatus::Captured);
        assert_eq!(row.platform_fee, Some(1500));
        assert_eq!(fx.notifier.sent().len(), 2);

        // Redelivery changes nothing
        let again = fx.orchestrator
            .handle_gateway_event(event(GatewayEventKind::CheckoutCompleted(session)))
            .await
            .unwrap();
        assert_eq!(again, WebhookOutcome::Ignored);
        assert_eq!(fx.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_session_cancels_and_releases_hold() {
        let fx = fixture();
        let class = fx.store.add_class(false, 2, Some(5000));
        let outcome = fx.orchestrator
            .create_checkout_session(
                Uuid::new_v4(),
                None,
                crate::checkout::CheckoutRequest {
                    class_id: class.id,
                    quantity: 2,
                    student_names: Vec::new(),
                    user_id: None,
                },
            )
            .await
            .unwrap();
        fx.store.update(outcome.booking_id, |b| b.payment_intent_id = None);
        let session = fx.gateway.retrieve_checkout_session(&outcome.session_id).await.unwrap();

        let result = fx.orchestrator
            .handle_gateway_event(event(GatewayEventKind::CheckoutExpired(session)))
            .await
            .unwrap();
        assert_eq!(result, WebhookOutcome::Expired);

        let row = fx.store.booking(outcome.booking_id).unwrap();
        assert_eq!(row.status, LifecycleStatus::Cancelled);
        assert_eq!(row.payment_status, PaymentStatus::Failed);
        assert!(fx.store.holds_for(outcome.booking_id).iter().all(|h| h.status == HoldStatus::Expired));
        assert_eq!(fx.store.available(class.id), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_and_event_are_ignored() {
        let fx = fixture();
        let session_id = fx.gateway.add_orphan_session(Uuid::new_v4()).await;
        let session = fx.gateway.retrieve_checkout_session(&session_id).await.unwrap();

        let outcome = fx.orchestrator
            .handle_gateway_event(event(GatewayEventKind::CheckoutCompleted(session)))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);

        let outcome = fx.orchestrator
            .handle_gateway_event(event(GatewayEventKind::Other("charge.refunded".to_string())))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
    }
}
