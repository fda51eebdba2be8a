use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use herd_core::payment::IntentStatus;
use herd_core::{
    BookingPatch, CaptureTransition, ReconciliationReason, ReconciliationRecord, TransitionGuard,
};
use crate::approve::APPROVABLE;
use crate::error::{BookingError, BookingResult};
use crate::orchestrator::BookingOrchestrator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub processed: u32,
    pub resolved: u32,
    pub failed: u32,
    /// Stalled captures newly queued during this pass
    pub stalled: u32,
}

impl BookingOrchestrator {
    /// Repair bookings whose gateway state and ledger state disagree. Only
    /// reacts to captures that already happened; never captures itself.
    pub async fn reconcile_payments(&self, now: DateTime<Utc>) -> BookingResult<ReconcileSummary> {
        let limit = self.rules.sweep_limit(None);
        let mut summary = ReconcileSummary {
            stalled: self.queue_stalled_captures(now, limit).await?,
            ..ReconcileSummary::default()
        };

        let open = self.reconciliations.list_open_reconciliations(limit).await?;
        for record in open {
            summary.processed += 1;
            match self.reconcile_one(&record, now).await {
                Ok(resolution) => {
                    summary.resolved += 1;
                    info!(booking_id = %record.booking_id, record = %record.id, "Reconciled: {}", resolution);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(booking_id = %record.booking_id, record = %record.id, "Reconciliation failed: {}", e);
                }
            }
        }

        info!(
            processed = summary.processed,
            resolved = summary.resolved,
            failed = summary.failed,
            stalled = summary.stalled,
            "Payment reconciliation finished"
        );
        Ok(summary)
    }

    /// Open records for captures stuck in flight past the stall threshold
    async fn queue_stalled_captures(&self, now: DateTime<Utc>, limit: i64) -> BookingResult<u32> {
        let cutoff = now - Duration::minutes(self.rules.stalled_capture_minutes);
        let stalled = self.ledger.list_stalled_captures(cutoff, limit).await?;

        let mut queued = 0;
        for booking in stalled {
            if self.reconciliations.has_open_reconciliation(booking.id).await? {
                continue;
            }
            let record = ReconciliationRecord::open(
                booking.id,
                ReconciliationReason::CaptureStalled,
                json!({
                    "capture_attempt": booking.capture_attempt_count,
                    "last_update": booking.updated_at,
                }),
            )
            .with_gateway_ids(booking.payment_intent_id.clone(), booking.charge_id.clone());

            self.reconciliations.open_reconciliation(&record).await?;
            warn!(booking_id = %booking.id, "Capture stalled in progress, queued for reconciliation");
            queued += 1;
        }
        Ok(queued)
    }

    async fn reconcile_one(&self, record: &ReconciliationRecord, now: DateTime<Utc>) -> BookingResult<String> {
        let Some(booking) = self.ledger.get_booking(record.booking_id).await? else {
            let note = "skipped: booking not found".to_string();
            self.reconciliations.resolve_reconciliation(record.id, &note, now).await?;
            return Ok(note);
        };

        if booking.is_settled() {
            let note = format!(
                "skipped: booking already {} / {} / {}",
                booking.status, booking.payment_status, booking.capture_status
            );
            self.reconciliations.resolve_reconciliation(record.id, &note, now).await?;
            return Ok(note);
        }

        let intent_id = record
            .payment_intent_id
            .clone()
            .or_else(|| booking.payment_intent_id.clone())
            .ok_or_else(|| BookingError::Invalid("no payment intent to reconcile against".to_string()))?;

        let intent = self.gateway.retrieve_payment_intent(&intent_id).await?;

        let (transition, patch, note) = if intent.status == IntentStatus::Succeeded {
            let transition = CaptureTransition::ReconcileCaptured;
            let patch = self.captured_patch(&booking, &intent, transition);
            (transition, patch, "resolved: captured at gateway".to_string())
        } else {
            let transition = CaptureTransition::ReconcileFailed;
            let patch = BookingPatch {
                capture_last_error: Some(format!("gateway status: {}", intent.status.as_str())),
                ..BookingPatch::capture(transition)
            };
            (transition, patch, format!("resolved: not captured ({})", intent.status.as_str()))
        };

        let written = self
            .ledger
            .transition(booking.id, &TransitionGuard::for_capture(transition).lifecycle(APPROVABLE), &patch)
            .await?;
        if written.is_none() {
            return Err(BookingError::Conflict(format!(
                "booking moved to {} while reconciling",
                booking.capture_status
            )));
        }

        self.reconciliations.resolve_reconciliation(record.id, &note, now).await?;
        Ok(note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fixture, GatewayCall, LedgerFault};
    use herd_core::{CaptureStatus, LifecycleStatus, PaymentStatus, ReconciliationStatus};

    #[tokio::test]
    async fn test_partial_failure_is_repaired_without_second_capture() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.store.inject(LedgerFault::CaptureCommit);
        let _ = fx.orchestrator.approve_booking(booking.id, class.host_id).await;

        let summary = fx.orchestrator.reconcile_payments(Utc::now()).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.failed, 0);

        let row = fx.store.booking(booking.id).unwrap();
        assert_eq!(row.status, LifecycleStatus::Approved);
        assert_eq!(row.payment_status, PaymentStatus::Held);
        assert_eq!(row.capture_status, CaptureStatus::Captured);
        assert_eq!(row.host_payout_amount, Some(10000));
        assert!(row.captured_at.is_some());

        assert_eq!(fx.gateway.count(GatewayCall::Capture).await, 1);
        assert_eq!(fx.store.reconciliations()[0].status, ReconciliationStatus::Resolved);

        let again = fx.orchestrator.reconcile_payments(Utc::now()).await.unwrap();
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn test_uncaptured_intent_marks_capture_failed() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.store.update(booking.id, |b| b.capture_status = CaptureStatus::NeedsReconcile);
        fx.store.put_reconciliation(ReconciliationRecord::open(
            booking.id,
            ReconciliationReason::CaptureSucceededLedgerFailed,
            serde_json::Value::Null,
        ));

        let summary = fx.orchestrator.reconcile_payments(Utc::now()).await.unwrap();
        assert_eq!(summary.resolved, 1);

        let row = fx.store.booking(booking.id).unwrap();
        assert_eq!(row.capture_status, CaptureStatus::CaptureFailed);
        assert_eq!(row.capture_last_error.as_deref(), Some("gateway status: requires_capture"));
        assert_eq!(row.status, LifecycleStatus::Pending);
    }

    #[tokio::test]
    async fn test_settled_booking_is_skipped_without_gateway_call() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.store.update(booking.id, |b| b.status = LifecycleStatus::Denied);
        fx.store.put_reconciliation(ReconciliationRecord::open(
            booking.id,
            ReconciliationReason::CaptureSucceededLedgerFailed,
            serde_json::Value::Null,
        ));

        let summary = fx.orchestrator.reconcile_payments(Utc::now()).await.unwrap();
        assert_eq!(summary.resolved, 1);
        assert_eq!(fx.gateway.count(GatewayCall::RetrievePaymentIntent).await, 0);

        let record = &fx.store.reconciliations()[0];
        assert!(record.resolution.as_deref().unwrap().starts_with("skipped"));
    }

    #[tokio::test]
    async fn test_one_bad_record_does_not_stop_the_sweep() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let broken = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        let healthy = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        for b in [&broken, &healthy] {
            fx.store.update(b.id, |row| row.capture_status = CaptureStatus::NeedsReconcile);
            fx.store.put_reconciliation(ReconciliationRecord::open(
                b.id,
                ReconciliationReason::CaptureSucceededLedgerFailed,
                serde_json::Value::Null,
            ));
        }
        fx.store.update(broken.id, |row| row.payment_intent_id = None);

        let summary = fx.orchestrator.reconcile_payments(Utc::now()).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_stalled_capture_is_queued_and_resolved() {
        let fx = fixture();
        let class = fx.store.add_class(false, 10, Some(10000));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;
        fx.gateway.force_capture(booking.payment_intent_id.as_deref().unwrap()).await;
        fx.store.update(booking.id, |b| {
            b.capture_status = CaptureStatus::CaptureInProgress;
            b.updated_at = Utc::now() - Duration::hours(1);
        });

        let summary = fx.orchestrator.reconcile_payments(Utc::now()).await.unwrap();
        assert_eq!(summary.stalled, 1);
        assert_eq!(summary.resolved, 1);
        assert_eq!(fx.store.booking(booking.id).unwrap().capture_status, CaptureStatus::Captured);
    }
}
