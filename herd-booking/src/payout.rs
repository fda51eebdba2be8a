use std::collections::HashMap;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;
use tracing::{error, info, warn};
use herd_core::payment::TransferRequest;
use herd_core::{
    Booking, BookingPatch, CaptureStatus, ClassListing, FeeSplit, Notification, PaymentStatus,
    TransitionGuard,
};
use crate::error::{BookingError, BookingResult};
use crate::orchestrator::BookingOrchestrator;

/// Deterministic transfer key so a re-run sweep never pays a booking twice
pub fn payout_idempotency_key(booking_id: Uuid) -> String {
    format!("payout_{}", booking_id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayoutSummary {
    pub success: u32,
    pub failed: u32,
    /// Class processed by this pass, if any were due
    pub class_id: Option<Uuid>,
    /// Classes still waiting for a later pass
    pub remaining_classes: u32,
}

impl BookingOrchestrator {
    /// Transfer host payouts for one class whose bookings are due. Stops at
    /// the first failed transfer so a class is never half paid in one pass.
    pub async fn release_held_payments(&self, now: DateTime<Utc>) -> BookingResult<PayoutSummary> {
        let limit = self.rules.sweep_limit(None);
        let due = self
            .ledger
            .due_payouts(self.rules.payout_buffer_hours, now, limit)
            .await?;

        let mut order: Vec<Uuid> = Vec::new();
        let mut by_class: HashMap<Uuid, Vec<Booking>> = HashMap::new();
        for booking in due {
            if !by_class.contains_key(&booking.class_id) {
                order.push(booking.class_id);
            }
            by_class.entry(booking.class_id).or_default().push(booking);
        }

        let Some(class_id) = order.first().copied() else {
            info!("No payouts due");
            return Ok(PayoutSummary::default());
        };
        let bookings = by_class.remove(&class_id).unwrap_or_default();
        let mut summary = PayoutSummary {
            class_id: Some(class_id),
            remaining_classes: (order.len() - 1) as u32,
            ..PayoutSummary::default()
        };

        let class = self.load_class(class_id).await?;
        let Some(destination) = self.catalog.host_payout_account(class.host_id).await? else {
            warn!(class_id = %class_id, host_id = %class.host_id, "Host has no payout account, skipping class");
            summary.failed = 1;
            self.defer_class(class_id, &bookings, now).await;
            return Ok(summary);
        };

        let review_deadline = class.end_instant() + Duration::hours(self.rules.review_unlock_hours);
        let mut unlock: Vec<Uuid> = Vec::new();
        let mut total_paid: i64 = 0;

        for (i, booking) in bookings.iter().enumerate() {
            if review_deadline <= now && !booking.reviews_unlocked {
                unlock.push(booking.id);
            }

            match self.pay_out_one(booking, &class, &destination, now).await {
                Ok(amount) => {
                    summary.success += 1;
                    total_paid += amount;
                }
                Err(e) => {
                    error!(booking_id = %booking.id, class_id = %class_id, "Payout failed, stopping class: {}", e);
                    summary.failed += 1;
                    self.defer_class(class_id, &bookings[i..], now).await;
                    break;
                }
            }
        }

        if !unlock.is_empty() {
            match self.ledger.unlock_reviews(&unlock).await {
                Ok(n) => info!(class_id = %class_id, unlocked = n, "Reviews unlocked"),
                Err(e) => warn!(class_id = %class_id, "Failed to unlock reviews: {}", e),
            }
        }

        if summary.success > 0 {
            self.notify_all(vec![Notification::HostPayoutSummary {
                host_id: class.host_id,
                class_id,
                class_title: class.title.clone(),
                bookings_paid: summary.success,
                total_payout: total_paid,
                currency: self.rules.currency.clone(),
            }])
            .await;
        }

        info!(
            class_id = %class_id,
            success = summary.success,
            failed = summary.failed,
            remaining_classes = summary.remaining_classes,
            "Payout pass finished"
        );
        Ok(summary)
    }

    /// Push the unpaid rest of a failed class behind every other due class
    async fn defer_class(&self, class_id: Uuid, unpaid: &[Booking], now: DateTime<Utc>) {
        let ids: Vec<Uuid> = unpaid.iter().map(|b| b.id).collect();
        if let Err(e) = self.ledger.mark_payout_failed(&ids, now).await {
            warn!(class_id = %class_id, "Failed to record payout failure: {}", e);
        }
    }

    async fn pay_out_one(
        &self,
        booking: &Booking,
        class: &ClassListing,
        destination: &str,
        now: DateTime<Utc>,
    ) -> BookingResult<i64> {
        let amount = booking
            .host_payout_amount
            .unwrap_or_else(|| FeeSplit::from_total(booking.total_amount, self.rules.platform_fee_rate).host_payout);
        if amount <= 0 {
            return Err(BookingError::Invalid(format!("payout amount {} is not positive", amount)));
        }

        // Tie the transfer to the original charge where possible
        let (source_transaction, transfer_group) = match &booking.charge_id {
            Some(charge) => (Some(charge.clone()), None),
            None => (None, Some(format!("booking_{}", booking.id))),
        };

        let mut metadata = HashMap::new();
        metadata.insert("booking_id".to_string(), booking.id.to_string());
        metadata.insert("class_id".to_string(), class.id.to_string());

        let transfer = self
            .gateway
            .create_transfer(&TransferRequest {
                amount,
                currency: self.rules.currency.clone(),
                destination: destination.to_string(),
                source_transaction,
                transfer_group,
                idempotency_key: payout_idempotency_key(booking.id),
                metadata,
            })
            .await?;

        let guard = TransitionGuard::any()
            .payment(&[PaymentStatus::Held])
            .capture(&[CaptureStatus::Captured]);
        let patch = BookingPatch {
            payment_status: Some(PaymentStatus::Completed),
            transfer_id: Some(transfer.id.clone()),
            paid_out_at: Some(now),
            ..BookingPatch::default()
        };
        if self.ledger.transition(booking.id, &guard, &patch).await?.is_none() {
            return Err(BookingError::Conflict(format!(
                "booking {} left HELD before transfer {} was recorded",
                booking.id, transfer.id
            )));
        }

        info!(booking_id = %booking.id, transfer = %transfer.id, amount = amount, "Host payout transferred");
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fixture, Fixture, GatewayCall};

    async fn captured_booking(fx: &Fixture, class: &ClassListing) -> Booking {
        let booking = fx.store.add_authorised_booking(class, &fx.gateway, 11500).await;
        fx.orchestrator.approve_booking(booking.id, class.host_id).await.unwrap();
        fx.store.booking(booking.id).unwrap()
    }

    fn ended_class(fx: &Fixture, hours_ago: i64) -> ClassListing {
        let class = fx.store.add_class_ending_at(Utc::now() - Duration::hours(hours_ago));
        fx.store.set_payout_account(class.host_id, "acct_host");
        class
    }

    #[tokio::test]
    async fn test_payout_waits_for_buffer() {
        let fx = fixture();
        let class = ended_class(&fx, 2);
        let booking = captured_booking(&fx, &class).await;

        let summary = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(summary, PayoutSummary::default());
        assert_eq!(fx.store.booking(booking.id).unwrap().payment_status, PaymentStatus::Held);
        assert_eq!(fx.gateway.count(GatewayCall::Transfer).await, 0);

        let later = Utc::now() + Duration::hours(23);
        let summary = fx.orchestrator.release_held_payments(later).await.unwrap();
        assert_eq!(summary.success, 1);
    }

    #[tokio::test]
    async fn test_payout_completes_booking_and_notifies_host() {
        let fx = fixture();
        let class = ended_class(&fx, 30);
        let first = captured_booking(&fx, &class).await;
        let second = captured_booking(&fx, &class).await;

        let summary = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(summary, PayoutSummary { success: 2, failed: 0, class_id: Some(class.id), remaining_classes: 0 });

        for id in [first.id, second.id] {
            let row = fx.store.booking(id).unwrap();
            assert_eq!(row.payment_status, PaymentStatus::Completed);
            assert!(row.transfer_id.is_some());
            assert!(row.paid_out_at.is_some());
            assert!(row.reviews_unlocked);
        }

        let transfers = fx.gateway.transfer_requests().await;
        assert_eq!(transfers[0].amount, 10000);
        assert_eq!(transfers[0].destination, "acct_host");
        assert_eq!(transfers[0].source_transaction, first.charge_id);
        assert_eq!(transfers[0].idempotency_key, format!("payout_{}", first.id));

        let summaries: Vec<_> = fx.notifier.sent().into_iter()
            .filter(|n| matches!(n, Notification::HostPayoutSummary { .. }))
            .collect();
        assert_eq!(summaries.len(), 1);
        match &summaries[0] {
            Notification::HostPayoutSummary { bookings_paid, total_payout, .. } => {
                assert_eq!(*bookings_paid, 2);
                assert_eq!(*total_payout, 20000);
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_transfer_stops_the_class() {
        let fx = fixture();
        let class = ended_class(&fx, 30);
        let first = captured_booking(&fx, &class).await;
        let second = captured_booking(&fx, &class).await;
        fx.gateway.fail_next(GatewayCall::Transfer).await;

        let summary = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(summary.success, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(fx.gateway.count(GatewayCall::Transfer).await, 1);
        assert_eq!(fx.store.booking(first.id).unwrap().payment_status, PaymentStatus::Held);
        assert_eq!(fx.store.booking(second.id).unwrap().payment_status, PaymentStatus::Held);
        assert!(fx.notifier.sent().iter().all(|n| !matches!(n, Notification::HostPayoutSummary { .. })));
    }

    #[tokio::test]
    async fn test_one_class_per_pass() {
        let fx = fixture();
        let a = ended_class(&fx, 48);
        let b = ended_class(&fx, 30);
        captured_booking(&fx, &a).await;
        captured_booking(&fx, &b).await;

        let first = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(first.success, 1);
        assert_eq!(first.remaining_classes, 1);

        let second = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(second.success, 1);
        assert_eq!(second.remaining_classes, 0);
        assert_ne!(first.class_id, second.class_id);

        let third = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(third.class_id, None);
    }

    #[tokio::test]
    async fn test_missing_payout_account_counts_as_failure() {
        let fx = fixture();
        let class = fx.store.add_class_ending_at(Utc::now() - Duration::hours(30));
        let booking = captured_booking(&fx, &class).await;

        let summary = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(fx.gateway.count(GatewayCall::Transfer).await, 0);
        assert_eq!(fx.store.booking(booking.id).unwrap().payment_status, PaymentStatus::Held);
    }

    #[tokio::test]
    async fn test_failing_class_does_not_starve_later_classes() {
        let fx = fixture();
        let stuck = fx.store.add_class_ending_at(Utc::now() - Duration::hours(48));
        let ready = ended_class(&fx, 30);
        let stuck_booking = captured_booking(&fx, &stuck).await;
        let ready_booking = captured_booking(&fx, &ready).await;

        let first = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(first.class_id, Some(stuck.id));
        assert_eq!(first.failed, 1);
        assert!(fx.store.booking(stuck_booking.id).unwrap().payout_failed_at.is_some());

        let second = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(second.class_id, Some(ready.id));
        assert_eq!(second.success, 1);
        assert_eq!(fx.store.booking(ready_booking.id).unwrap().payment_status, PaymentStatus::Completed);

        // The failed class is retried once nothing else is waiting
        fx.store.set_payout_account(stuck.host_id, "acct_late");
        let third = fx.orchestrator.release_held_payments(Utc::now()).await.unwrap();
        assert_eq!(third.class_id, Some(stuck.id));
        assert_eq!(third.success, 1);
    }
}
