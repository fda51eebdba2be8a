use chrono::Utc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, error};
use herd_booking::BookingOrchestrator;

/// Runs every sweep on a fixed interval. The HTTP sweep endpoints stay
/// available, so an external scheduler can be used instead.
pub async fn start_sweep_scheduler(orchestrator: BookingOrchestrator, interval_seconds: u64) {
    let mut ticker = interval(Duration::from_secs(interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Sweep scheduler started, running every {}s", interval_seconds);

    loop {
        ticker.tick().await;
        run_sweeps(&orchestrator).await;
    }
}

/// One pass of all four sweeps. A failing sweep does not stop the others.
pub async fn run_sweeps(orchestrator: &BookingOrchestrator) {
    match orchestrator.expire_booking_holds(Utc::now()).await {
        Ok(expired) => info!(expired, "Hold sweep finished"),
        Err(e) => error!("Hold sweep failed: {}", e),
    }

    match orchestrator.expire_pending_bookings(Utc::now(), None).await {
        Ok(s) => info!(scanned = s.scanned, expired = s.expired, cancelled = s.cancelled, failed = s.failed, "Pending booking sweep finished"),
        Err(e) => error!("Pending booking sweep failed: {}", e),
    }

    match orchestrator.reconcile_payments(Utc::now()).await {
        Ok(s) => info!(processed = s.processed, resolved = s.resolved, failed = s.failed, stalled = s.stalled, "Reconciliation sweep finished"),
        Err(e) => error!("Reconciliation sweep failed: {}", e),
    }

    match orchestrator.release_held_payments(Utc::now()).await {
        Ok(s) => info!(success = s.success, failed = s.failed, remaining_classes = s.remaining_classes, "Payout sweep finished"),
        Err(e) => error!("Payout sweep failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use herd_booking::mock::fixture;
    use herd_core::{BookingHold, HoldStatus, LifecycleStatus};

    #[tokio::test]
    async fn test_one_pass_expires_holds_and_ended_class_bookings() {
        let fx = fixture();
        let class = fx.store.add_class_ending_at(Utc::now() - ChronoDuration::hours(1));
        let booking = fx.store.add_authorised_booking(&class, &fx.gateway, 11500).await;

        let hold = BookingHold::new(booking.id, class.id, booking.user_id, 1, ChronoDuration::minutes(-5));
        fx.store.put_hold(hold.clone());

        run_sweeps(&fx.orchestrator).await;

        assert_eq!(fx.store.hold(hold.id).unwrap().status, HoldStatus::Expired);
        assert_eq!(fx.store.booking(booking.id).unwrap().status, LifecycleStatus::Denied);
    }
}
