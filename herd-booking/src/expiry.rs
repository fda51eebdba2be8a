use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use tracing::{error, info, warn};
use herd_core::payment::IntentStatus;
use herd_core::{
    Booking, BookingPatch, CaptureStatus, ClassListing, LifecycleStatus, Notification, PaymentStatus,
    ReconciliationReason, ReconciliationRecord, TransitionGuard,
};
use crate::error::BookingResult;
use crate::orchestrator::BookingOrchestrator;

pub const AUTO_EXPIRY_MESSAGE: &str =
    "Automatically expired: the class ended before this booking was approved.";

/// Capture states where no money has moved, so expiry may release the booking
const EXPIRABLE_CAPTURE: &[CaptureStatus] = &[CaptureStatus::None, CaptureStatus::CaptureFailed];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingSweepSummary {
    pub scanned: u32,
    pub expired: u32,
    pub cancelled: u32,
    pub failed: u32,
}

enum RowOutcome {
    Skipped,
    Expired { cancelled: bool },
}

impl BookingOrchestrator {
    /// Mark every seat hold past its expiry as EXPIRED. Ledger only.
    pub async fn expire_booking_holds(&self, now: DateTime<Utc>) -> BookingResult<u64> {
        let expired = self.ledger.expire_holds(now).await?;
        if expired > 0 {
            info!(expired = expired, "Expired seat holds");
        }
        Ok(expired)
    }

    /// Deny PENDING bookings whose class has already ended, releasing any
    /// authorisation on a best-effort basis. One row's failure never stops the batch.
    pub async fn expire_pending_bookings(&self, now: DateTime<Utc>, limit: Option<i64>) -> BookingResult<PendingSweepSummary> {
        let limit = self.rules.sweep_limit(limit);
        let pending = self.ledger.list_expirable_bookings(now, limit).await?;

        let mut summary = PendingSweepSummary::default();
        let mut classes: HashMap<Uuid, Option<ClassListing>> = HashMap::new();

        for booking in pending {
            summary.scanned += 1;

            if !classes.contains_key(&booking.class_id) {
                let class = match self.catalog.get_class(booking.class_id).await {
                    Ok(class) => class,
                    Err(e) => {
                        error!(booking_id = %booking.id, "Failed to load class for expiry: {}", e);
                        summary.failed += 1;
                        continue;
                    }
                };
                classes.insert(booking.class_id, class);
            }
            let Some(Some(class)) = classes.get(&booking.class_id) else {
                warn!(booking_id = %booking.id, class_id = %booking.class_id, "Pending booking references a missing class");
                continue;
            };

            match self.expire_one(&booking, class, now).await {
                Ok(RowOutcome::Skipped) => {}
                Ok(RowOutcome::Expired { cancelled }) => {
                    summary.expired += 1;
                    if cancelled {
                        summary.cancelled += 1;
                    }
                }
                Err(e) => {
                    error!(booking_id = %booking.id, "Failed to expire booking: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            scanned = summary.scanned,
            expired = summary.expired,
            cancelled = summary.cancelled,
            failed = summary.failed,
            "Pending booking sweep finished"
        );
        Ok(summary)
    }

    async fn expire_one(&self, booking: &Booking, class: &ClassListing, now: DateTime<Utc>) -> BookingResult<RowOutcome> {
        if class.end_instant() > now || !EXPIRABLE_CAPTURE.contains(&booking.capture_status) {
            return Ok(RowOutcome::Skipped);
        }
        if booking.capture_status == CaptureStatus::CaptureFailed && self.captured_despite_failure(booking).await? {
            return Ok(RowOutcome::Skipped);
        }

        let mut cancelled = false;
        if let Some(intent_id) = &booking.payment_intent_id {
            match self.gateway.cancel_payment_intent(intent_id).await {
                Ok(_) => cancelled = true,
                Err(e) => warn!(booking_id = %booking.id, "Best-effort cancel of {} failed: {}", intent_id, e),
            }
        }

        let guard = TransitionGuard::any()
            .lifecycle(&[LifecycleStatus::Pending])
            .capture(EXPIRABLE_CAPTURE);
        let patch = BookingPatch {
            status: Some(LifecycleStatus::Denied),
            payment_status: Some(PaymentStatus::Failed),
            host_message: Some(AUTO_EXPIRY_MESSAGE.to_string()),
            denied_at: Some(now),
            ..BookingPatch::default()
        };

        if self.ledger.transition(booking.id, &guard, &patch).await?.is_none() {
            // Resolved by another handler since it was listed
            return Ok(RowOutcome::Skipped);
        }

        self.notify_all(vec![Notification::GuestBookingExpired {
            booking_id: booking.id,
            guest_id: booking.user_id,
            class_id: booking.class_id,
        }])
        .await;

        Ok(RowOutcome::Expired { cancelled })
    }

    /// A capture recorded as failed may still have landed at the gateway.
    /// Such a booking is handed to reconciliation instead of being expired.
    async fn captured_despite_failure(&self, booking: &Booking) -> BookingResult<bool> {
        let Some(intent_id) = &booking.payment_intent_id else {
            return Ok(false);
        };
        let intent = self.gateway.retrieve_payment_intent(intent_id).await?;
        if intent.status != IntentStatus::Succeeded {
            return Ok(false);
        }

        if !self.reconciliations.has_open_reconciliation(booking.id).await? {
            let record = ReconciliationRecord::open(
                booking.id,
                ReconciliationReason::CaptureSucceededLedgerFailed,
                json!({
                    "error": booking.capture_last_error,
                    "intent_status": intent.status.as_str(),
                    "amount_received": intent.amount_received,
                    "capture_attempt": booking.capture_attempt_count,
                }),
            )
            .with_gateway_ids(Some(intent.id.clone()), intent.latest_charge.clone());
            self.reconciliations.open_reconciliation(&record).await?;
        }

        warn!(booking_id = %booking.id, intent = %intent.id, "Capture marked failed but gateway captured, queued for reconciliation");
        Ok(true)
    }
}
