use std::collections::HashMap;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use tracing::{error, info, warn};
use herd_core::fees::{base_price_cents, per_seat_price};
use herd_core::payment::{CaptureMethod, CheckoutSessionRequest};
use herd_core::{Booking, BookingHold};
use crate::error::{BookingError, BookingResult};
use crate::orchestrator::BookingOrchestrator;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub class_id: Uuid,
    #[serde(alias = "qty")]
    pub quantity: i64,
    #[serde(default)]
    pub student_names: Vec<String>,
    /// Must match the authenticated caller when present
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckoutOutcome {
    pub booking_id: Uuid,
    pub session_id: String,
    pub url: String,
    pub total_amount: i64,
    pub capture_method: CaptureMethod,
}

/// "Only 1 seat remaining" / "Only 3 seats remaining"
pub fn remaining_seats_message(remaining: i64) -> String {
    let remaining = remaining.max(0);
    let noun = if remaining == 1 { "seat" } else { "seats" };
    format!("Only {} {} remaining", remaining, noun)
}

impl BookingOrchestrator {
    /// Reserve seats and open a gateway checkout session for a new booking
    pub async fn create_checkout_session(
        &self,
        caller: Uuid,
        caller_email: Option<String>,
        req: CheckoutRequest,
    ) -> BookingResult<CheckoutOutcome> {
        if req.user_id.is_some_and(|id| id != caller) {
            return Err(BookingError::Forbidden("Cannot book on behalf of another user".to_string()));
        }
        if req.quantity <= 0 {
            return Err(BookingError::Invalid("Quantity must be a positive integer".to_string()));
        }
        let quantity = i32::try_from(req.quantity)
            .map_err(|_| BookingError::Invalid("Quantity is too large".to_string()))?;
        if !req.student_names.is_empty() && req.student_names.len() != quantity as usize {
            return Err(BookingError::Invalid(format!(
                "Expected {} student names, got {}",
                quantity,
                req.student_names.len()
            )));
        }

        let class = self.load_class(req.class_id).await?;

        let now = Utc::now();
        let available = self.catalog.available_seats(class.id, now).await?;
        if available < req.quantity {
            return Err(BookingError::Invalid(remaining_seats_message(available)));
        }

        let base = base_price_cents(&class)
            .ok_or_else(|| BookingError::Invalid("Class has no price".to_string()))?;
        let unit_amount = per_seat_price(base, self.rules.platform_fee_rate);
        let total = unit_amount * req.quantity;
        if total <= 0 {
            return Err(BookingError::Invalid("Invalid class price".to_string()));
        }

        let capture_method = if class.auto_approve {
            CaptureMethod::Automatic
        } else {
            CaptureMethod::Manual
        };

        let mut booking = Booking::new(caller, class.id, quantity, total);
        booking.student_names = req.student_names.clone();
        let transfer_group = format!("booking_{}", booking.id);

        let hold = BookingHold::new(
            booking.id,
            class.id,
            caller,
            quantity,
            Duration::minutes(self.rules.hold_minutes),
        );
        self.ledger.insert_hold(&hold).await?;

        let mut metadata = HashMap::new();
        metadata.insert("booking_id".to_string(), booking.id.to_string());
        metadata.insert("class_id".to_string(), class.id.to_string());
        metadata.insert("user_id".to_string(), caller.to_string());
        metadata.insert("transfer_group".to_string(), transfer_group.clone());

        let app_url = self.rules.app_url.trim_end_matches('/');
        let session_request = CheckoutSessionRequest {
            product_name: class.title.clone(),
            unit_amount,
            quantity: req.quantity,
            currency: self.rules.currency.clone(),
            capture_method,
            success_url: format!("{}/booking/confirm?session_id={{CHECKOUT_SESSION_ID}}", app_url),
            cancel_url: format!("{}/classes/{}", app_url, class.id),
            customer_email: caller_email,
            transfer_group,
            metadata,
        };

        let session = match self.gateway.create_checkout_session(&session_request).await {
            Ok(session) => session,
            Err(e) => {
                error!(class_id = %class.id, "Checkout session creation failed: {}", e);
                self.release_hold_quietly(booking.id).await;
                return Err(e.into());
            }
        };

        let Some(url) = session.url.clone() else {
            self.release_hold_quietly(booking.id).await;
            return Err(BookingError::Gateway(herd_core::GatewayError::Decode(
                "checkout session has no redirect url".to_string(),
            )));
        };

        booking.checkout_session_id = Some(session.id.clone());
        booking.payment_intent_id = session.payment_intent_id.clone();
        if let Err(e) = self.ledger.insert_booking(&booking).await {
            error!(booking_id = %booking.id, "Failed to persist booking after checkout: {}", e);
            self.release_hold_quietly(booking.id).await;
            return Err(e.into());
        }

        info!(
            booking_id = %booking.id,
            class_id = %class.id,
            session_id = %session.id,
            total = total,
            capture = capture_method.as_str(),
            "Checkout session created"
        );

        Ok(CheckoutOutcome {
            booking_id: booking.id,
            session_id: session.id,
            url,
            total_amount: total,
            capture_method,
        })
    }

    async fn release_hold_quietly(&self, booking_id: Uuid) {
        if let Err(e) = self.ledger.release_hold(booking_id).await {
            warn!(booking_id = %booking_id, "Failed to release seat hold: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fixture, GatewayCall};

    fn request(class_id: Uuid, quantity: i64) -> CheckoutRequest {
        CheckoutRequest {
            class_id,
            quantity,
            student_names: Vec::new(),
            user_id: None,
        }
    }

    #[test]
    fn test_remaining_seats_message_is_pluralized() {
        assert_eq!(remaining_seats_message(1), "Only 1 seat remaining");
        assert_eq!(remaining_seats_message(3), "Only 3 seats remaining");
        assert_eq!(remaining_seats_message(0), "Only 0 seats remaining");
    }

    #[tokio::test]
    async fn test_checkout_creates_booking_with_session() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let guest = Uuid::new_v4();

        let outcome = fx.orchestrator
            .create_checkout_session(guest, None, request(class.id, 2))
            .await
            .unwrap();

        assert_eq!(outcome.total_amount, 23000);
        assert_eq!(outcome.capture_method, CaptureMethod::Manual);

        let booking = fx.store.booking(outcome.booking_id).unwrap();
        assert_eq!(booking.checkout_session_id.as_deref(), Some(outcome.session_id.as_str()));
        assert_eq!(booking.quantity, 2);

        let requests = fx.gateway.session_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].unit_amount, 11500);
        assert_eq!(requests[0].metadata["booking_id"], booking.id.to_string());
        assert_eq!(requests[0].transfer_group, format!("booking_{}", booking.id));
    }

    #[tokio::test]
    async fn test_auto_approve_class_uses_automatic_capture() {
        let fx = fixture();
        let class = fx.store.add_class(true, 10, Some(5000));

        let outcome = fx.orchestrator
            .create_checkout_session(Uuid::new_v4(), None, request(class.id, 1))
            .await
            .unwrap();

        assert_eq!(outcome.capture_method, CaptureMethod::Automatic);
    }

    #[tokio::test]
    async fn test_insufficient_seats_names_remaining_count() {
        let fx = fixture();
        let class = fx.store.add_class(false, 3, Some(5000));

        fx.orchestrator
            .create_checkout_session(Uuid::new_v4(), None, request(class.id, 2))
            .await
            .unwrap();

        let err = fx.orchestrator
            .create_checkout_session(Uuid::new_v4(), None, request(class.id, 2))
            .await
            .unwrap_err();

        match err {
            BookingError::Invalid(msg) => assert_eq!(msg, "Only 1 seat remaining"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_quantity_and_foreign_user() {
        let fx = fixture();
        let class = fx.store.add_class(false, 3, Some(5000));
        let guest = Uuid::new_v4();

        let err = fx.orchestrator
            .create_checkout_session(guest, None, request(class.id, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Invalid(_)));

        let mut req = request(class.id, 1);
        req.user_id = Some(Uuid::new_v4());
        let err = fx.orchestrator.create_checkout_session(guest, None, req).await.unwrap_err();
        assert!(matches!(err, BookingError::Forbidden(_)));

        let err = fx.orchestrator
            .create_checkout_session(guest, None, request(Uuid::new_v4(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_no_booking_and_frees_seats() {
        let fx = fixture();
        let class = fx.store.add_class(false, 2, Some(5000));
        fx.gateway.fail_next(GatewayCall::CreateCheckoutSession).await;

        let err = fx.orchestrator
            .create_checkout_session(Uuid::new_v4(), None, request(class.id, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Gateway(_)));
        assert_eq!(fx.store.booking_count(), 0);

        fx.orchestrator
            .create_checkout_session(Uuid::new_v4(), None, request(class.id, 2))
            .await
            .unwrap();
    }
}
