use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use tracing::{error, info, warn};
use herd_core::fees::gateway_fee_estimate;
use herd_core::payment::{IntentStatus, PaymentIntent};
use herd_core::{
    Booking, BookingPatch, CaptureStatus, CaptureTransition, FeeSplit, LifecycleStatus,
    Notification, PaymentStatus, ReconciliationReason, ReconciliationRecord, TransitionGuard,
};
use crate::error::{BookingError, BookingResult};
use crate::orchestrator::BookingOrchestrator;

pub(crate) const APPROVABLE: &[LifecycleStatus] = &[LifecycleStatus::Pending, LifecycleStatus::Approved];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApproveOutcome {
    Captured,
    /// Nothing to do; the booking was captured by an earlier call
    AlreadyCaptured,
}

impl BookingOrchestrator {
    /// Host approval: capture the held funds exactly once and record the split
    pub async fn approve_booking(&self, booking_id: Uuid, caller: Uuid) -> BookingResult<ApproveOutcome> {
        let (booking, class) = self.load_for_host(booking_id, caller).await?;

        if !APPROVABLE.contains(&booking.status) {
            return Err(BookingError::Invalid(format!(
                "Booking cannot be approved from status {}",
                booking.status
            )));
        }

        let intent_id = self
            .resolve_payment_intent(&booking)
            .await?
            .ok_or_else(|| BookingError::Invalid("Booking has no authorised payment".to_string()))?;

        if booking.capture_status == CaptureStatus::Captured || booking.payment_status == PaymentStatus::Held {
            info!(booking_id = %booking_id, "Approval repeated, already captured");
            return Ok(ApproveOutcome::AlreadyCaptured);
        }
        if booking.capture_status == CaptureStatus::CaptureInProgress {
            return Err(BookingError::Conflict("Capture already in progress".to_string()));
        }

        // Gate: claim the capture before touching the gateway
        let begin = CaptureTransition::Begin;
        let guard = TransitionGuard::for_capture(begin).lifecycle(APPROVABLE);
        let patch = BookingPatch {
            increment_capture_attempts: true,
            ..BookingPatch::capture(begin)
        };
        let Some(claimed) = self.ledger.transition(booking_id, &guard, &patch).await? else {
            return self.lost_capture_race(booking_id).await;
        };

        // An earlier attempt may have captured without us seeing the response
        let captured = if booking.capture_attempt_count > 0 {
            self.resume_or_capture(&claimed, &intent_id).await
        } else {
            self.capture_at_gateway(&claimed, &intent_id).await
        };

        let intent = match captured {
            Ok(intent) => intent,
            Err(e) => {
                error!(booking_id = %booking_id, attempt = claimed.capture_attempt_count, "Capture failed: {}", e);
                let fail = CaptureTransition::Fail;
                let patch = BookingPatch {
                    capture_last_error: Some(e.to_string()),
                    ..BookingPatch::capture(fail)
                };
                if let Err(write_err) = self
                    .ledger
                    .transition(booking_id, &TransitionGuard::for_capture(fail), &patch)
                    .await
                {
                    error!(booking_id = %booking_id, "Could not record capture failure: {}", write_err);
                }
                return Err(e.into());
            }
        };

        self.commit_capture(&claimed, &intent).await?;

        self.notify_all(vec![
            Notification::HostBookingConfirmed {
                booking_id,
                host_id: class.host_id,
                class_id: class.id,
            },
            Notification::GuestBookingConfirmed {
                booking_id,
                guest_id: booking.user_id,
                class_id: class.id,
            },
        ])
        .await;

        info!(booking_id = %booking_id, intent = %intent.id, "Booking approved and captured");
        Ok(ApproveOutcome::Captured)
    }

    async fn lost_capture_race(&self, booking_id: Uuid) -> BookingResult<ApproveOutcome> {
        let current = self.load_booking(booking_id).await?;
        match current.capture_status {
            CaptureStatus::Captured => Ok(ApproveOutcome::AlreadyCaptured),
            CaptureStatus::CaptureInProgress => {
                Err(BookingError::Conflict("Capture already in progress".to_string()))
            }
            _ => Err(BookingError::Conflict(format!(
                "Booking changed during approval ({} / {})",
                current.status, current.capture_status
            ))),
        }
    }

    async fn capture_at_gateway(&self, booking: &Booking, intent_id: &str) -> herd_core::GatewayResult<PaymentIntent> {
        let key = format!("capture_{}_{}", booking.id, booking.capture_attempt_count);
        self.gateway.capture_payment_intent(intent_id, &key).await
    }

    /// A previous capture may already have landed; never capture twice
    async fn resume_or_capture(&self, booking: &Booking, intent_id: &str) -> herd_core::GatewayResult<PaymentIntent> {
        let intent = self.gateway.retrieve_payment_intent(intent_id).await?;
        if intent.status == IntentStatus::Succeeded {
            info!(booking_id = %booking.id, "Intent already captured, finalising ledger only");
            return Ok(intent);
        }
        self.capture_at_gateway(booking, intent_id).await
    }

    /// Ledger fields written once a capture is confirmed by the gateway
    pub(crate) fn captured_patch(&self, booking: &Booking, intent: &PaymentIntent, transition: CaptureTransition) -> BookingPatch {
        let now = Utc::now();
        let total = if intent.amount_received > 0 { intent.amount_received } else { booking.total_amount };
        let split = FeeSplit::from_total(total, self.rules.platform_fee_rate);

        BookingPatch {
            status: Some(LifecycleStatus::Approved),
            payment_status: Some(PaymentStatus::Held),
            payment_intent_id: Some(intent.id.clone()),
            charge_id: intent.latest_charge.clone(),
            platform_fee: Some(split.platform_fee),
            host_payout_amount: Some(split.host_payout),
            gateway_fee_estimate: Some(gateway_fee_estimate(
                total,
                self.rules.gateway_fee_percent,
                self.rules.gateway_fee_fixed_cents,
            )),
            approved_at: Some(now),
            captured_at: Some(now),
            ..BookingPatch::capture(transition)
        }
    }

    /// Record a capture that already happened at the gateway. A failed write
    /// is promoted to a reconciliation record; the capture is never retried.
    async fn commit_capture(&self, booking: &Booking, intent: &PaymentIntent) -> BookingResult<()> {
        let succeed = CaptureTransition::Succeed;
        let patch = self.captured_patch(booking, intent, succeed);

        let failure = match self
            .ledger
            .transition(booking.id, &TransitionGuard::for_capture(succeed).lifecycle(APPROVABLE), &patch)
            .await
        {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => "booking left PENDING/APPROVED with CAPTURE_IN_PROGRESS before the capture was recorded".to_string(),
            Err(e) => e.to_string(),
        };

        error!(booking_id = %booking.id, intent = %intent.id, "Captured at gateway but ledger write failed: {}", failure);
        self.promote_to_reconciliation(booking, intent, &failure).await;

        Err(BookingError::Reconciliation(
            "Payment captured but the booking could not be updated; it has been queued for reconciliation".to_string(),
        ))
    }

    async fn promote_to_reconciliation(&self, booking: &Booking, intent: &PaymentIntent, failure: &str) {
        let record = ReconciliationRecord::open(
            booking.id,
            ReconciliationReason::CaptureSucceededLedgerFailed,
            json!({
                "error": failure,
                "intent_status": intent.status.as_str(),
                "amount_received": intent.amount_received,
                "capture_attempt": booking.capture_attempt_count,
            }),
        )
        .with_gateway_ids(Some(intent.id.clone()), intent.latest_charge.clone());

        if let Err(e) = self.reconciliations.open_reconciliation(&record).await {
            error!(booking_id = %booking.id, "Failed to open reconciliation record: {}", e);
        }

        let flag = CaptureTransition::FlagReconcile;
        let patch = BookingPatch {
            capture_last_error: Some(failure.to_string()),
            ..BookingPatch::capture(flag)
        };
        if let Err(e) = self
            .ledger
            .transition(booking.id, &TransitionGuard::for_capture(flag).lifecycle(APPROVABLE), &patch)
            .await
        {
            warn!(booking_id = %booking.id, "Failed to flag booking for reconciliation: {}", e);
        }
    }
}
