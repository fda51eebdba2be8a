//! Conditional ledger transitions.
//!
//! Handlers never read-then-write a status. Every move is expressed as a
//! [`TransitionGuard`] (the set of states the row must currently be in) plus a
//! [`BookingPatch`] (what to write), and the ledger applies both in a single
//! conditional update. A guard that does not match leaves the row untouched.

use crate::booking::{Booking, CaptureStatus, LifecycleStatus, PaymentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named moves of the capture axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureTransition {
    /// Taken before calling the gateway; the mutual-exclusion gate
    Begin,
    Succeed,
    Fail,
    /// Gateway captured but the ledger write did not land
    FlagReconcile,
    /// Reconciliation found the gateway captured
    ReconcileCaptured,
    /// Reconciliation found the gateway did not capture
    ReconcileFailed,
}

impl CaptureTransition {
    pub fn allowed_from(self) -> &'static [CaptureStatus] {
        match self {
            CaptureTransition::Begin => &[
                CaptureStatus::None,
                CaptureStatus::CaptureFailed,
                CaptureStatus::NeedsReconcile,
            ],
            CaptureTransition::Succeed
            | CaptureTransition::Fail
            | CaptureTransition::FlagReconcile => &[CaptureStatus::CaptureInProgress],
            CaptureTransition::ReconcileCaptured => &[
                CaptureStatus::None,
                CaptureStatus::CaptureInProgress,
                CaptureStatus::CaptureFailed,
                CaptureStatus::NeedsReconcile,
            ],
            CaptureTransition::ReconcileFailed => &[
                CaptureStatus::CaptureInProgress,
                CaptureStatus::NeedsReconcile,
            ],
        }
    }

    pub fn target(self) -> CaptureStatus {
        match self {
            CaptureTransition::Begin => CaptureStatus::CaptureInProgress,
            CaptureTransition::Succeed | CaptureTransition::ReconcileCaptured => CaptureStatus::Captured,
            CaptureTransition::Fail | CaptureTransition::ReconcileFailed => CaptureStatus::CaptureFailed,
            CaptureTransition::FlagReconcile => CaptureStatus::NeedsReconcile,
        }
    }

    pub fn permits(self, current: CaptureStatus) -> bool {
        self.allowed_from().contains(&current)
    }
}

/// Expected prior state. `None` on an axis means "any value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionGuard {
    pub lifecycle: Option<Vec<LifecycleStatus>>,
    pub payment: Option<Vec<PaymentStatus>>,
    pub capture: Option<Vec<CaptureStatus>>,
}

impl TransitionGuard {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn lifecycle(mut self, allowed: &[LifecycleStatus]) -> Self {
        self.lifecycle = Some(allowed.to_vec());
        self
    }

    pub fn payment(mut self, allowed: &[PaymentStatus]) -> Self {
        self.payment = Some(allowed.to_vec());
        self
    }

    pub fn capture(mut self, allowed: &[CaptureStatus]) -> Self {
        self.capture = Some(allowed.to_vec());
        self
    }

    /// Guard and target for a capture-axis move
    pub fn for_capture(transition: CaptureTransition) -> Self {
        Self::any().capture(transition.allowed_from())
    }

    pub fn matches(&self, booking: &Booking) -> bool {
        fn axis<T: PartialEq>(allowed: &Option<Vec<T>>, value: &T) -> bool {
            allowed.as_ref().map_or(true, |set| set.contains(value))
        }

        axis(&self.lifecycle, &booking.status)
            && axis(&self.payment, &booking.payment_status)
            && axis(&self.capture, &booking.capture_status)
    }
}

/// Fields written by one transition. `None` leaves the column as it is.
///
/// `captured_at` and `approved_at` never overwrite an earlier value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingPatch {
    pub status: Option<LifecycleStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub capture_status: Option<CaptureStatus>,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,
    pub platform_fee: Option<i64>,
    pub host_payout_amount: Option<i64>,
    pub gateway_fee_estimate: Option<i64>,
    pub increment_capture_attempts: bool,
    pub capture_last_error: Option<String>,
    pub host_message: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub denied_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub paid_out_at: Option<DateTime<Utc>>,
}

impl BookingPatch {
    pub fn capture(transition: CaptureTransition) -> Self {
        Self {
            capture_status: Some(transition.target()),
            ..Self::default()
        }
    }

    /// Apply to an in-memory row with the same semantics as the SQL update
    pub fn apply(&self, booking: &mut Booking, now: DateTime<Utc>) {
        if let Some(s) = self.status {
            booking.status = s;
        }
        if let Some(s) = self.payment_status {
            booking.payment_status = s;
        }
        if let Some(s) = self.capture_status {
            booking.capture_status = s;
        }
        if let Some(v) = &self.checkout_session_id {
            booking.checkout_session_id = Some(v.clone());
        }
        if let Some(v) = &self.payment_intent_id {
            booking.payment_intent_id = Some(v.clone());
        }
        if let Some(v) = &self.charge_id {
            booking.charge_id = Some(v.clone());
        }
        if let Some(v) = &self.transfer_id {
            booking.transfer_id = Some(v.clone());
        }
        if let Some(v) = &self.refund_id {
            booking.refund_id = Some(v.clone());
        }
        if let Some(v) = self.platform_fee {
            booking.platform_fee = Some(v);
        }
        if let Some(v) = self.host_payout_amount {
            booking.host_payout_amount = Some(v);
        }
        if let Some(v) = self.gateway_fee_estimate {
            booking.gateway_fee_estimate = Some(v);
        }
        if self.increment_capture_attempts {
            booking.capture_attempt_count += 1;
        }
        if let Some(v) = &self.capture_last_error {
            booking.capture_last_error = Some(v.clone());
        }
        if let Some(v) = &self.host_message {
            booking.host_message = Some(v.clone());
        }
        if let Some(t) = self.approved_at {
            booking.approved_at.get_or_insert(t);
        }
        if let Some(t) = self.denied_at {
            booking.denied_at = Some(t);
        }
        if let Some(t) = self.captured_at {
            booking.captured_at.get_or_insert(t);
        }
        if let Some(t) = self.paid_out_at {
            booking.paid_out_at = Some(t);
        }
        booking.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_begin_is_refused_while_in_flight_or_done() {
        assert!(CaptureTransition::Begin.permits(CaptureStatus::None));
        assert!(CaptureTransition::Begin.permits(CaptureStatus::CaptureFailed));
        assert!(CaptureTransition::Begin.permits(CaptureStatus::NeedsReconcile));
        assert!(!CaptureTransition::Begin.permits(CaptureStatus::CaptureInProgress));
        assert!(!CaptureTransition::Begin.permits(CaptureStatus::Captured));
    }

    #[test]
    fn test_outcomes_only_follow_in_progress() {
        for t in [CaptureTransition::Succeed, CaptureTransition::Fail, CaptureTransition::FlagReconcile] {
            assert_eq!(t.allowed_from(), &[CaptureStatus::CaptureInProgress]);
        }
        assert_eq!(CaptureTransition::FlagReconcile.target(), CaptureStatus::NeedsReconcile);
    }

    #[test]
    fn test_guard_matching() {
        let mut booking = Booking::new(Uuid::new_v4(), Uuid::new_v4(), 1, 1000);
        let guard = TransitionGuard::any()
            .lifecycle(&[LifecycleStatus::Pending])
            .capture(&[CaptureStatus::None]);
        assert!(guard.matches(&booking));

        booking.capture_status = CaptureStatus::CaptureInProgress;
        assert!(!guard.matches(&booking));
        assert!(TransitionGuard::any().matches(&booking));
    }

    #[test]
    fn test_patch_never_overwrites_capture_time() {
        let mut booking = Booking::new(Uuid::new_v4(), Uuid::new_v4(), 1, 1000);
        let first = Utc::now() - chrono::Duration::hours(3);
        booking.captured_at = Some(first);

        let patch = BookingPatch {
            captured_at: Some(Utc::now()),
            increment_capture_attempts: true,
            ..BookingPatch::capture(CaptureTransition::ReconcileCaptured)
        };
        patch.apply(&mut booking, Utc::now());

        assert_eq!(booking.captured_at, Some(first));
        assert_eq!(booking.capture_attempt_count, 1);
        assert_eq!(booking.capture_status, CaptureStatus::Captured);
    }
}
