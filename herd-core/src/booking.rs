use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

/// Host-approval axis of a booking
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Pending,
    Approved,
    Denied,
    Cancelled,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Pending => "PENDING",
            LifecycleStatus::Approved => "APPROVED",
            LifecycleStatus::Denied => "DENIED",
            LifecycleStatus::Cancelled => "CANCELLED",
        }
    }

    /// PENDING is the only non-terminal value
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LifecycleStatus::Pending)
    }
}

/// Funds axis of a booking, independent of the lifecycle axis
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Held,
    Paid,
    Failed,
    Refunded,
    Completed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "UNPAID",
            PaymentStatus::Held => "HELD",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Completed => "COMPLETED",
        }
    }
}

/// State of the capture operation against the gateway
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureStatus {
    None,
    CaptureInProgress,
    Captured,
    CaptureFailed,
    NeedsReconcile,
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::None => "NONE",
            CaptureStatus::CaptureInProgress => "CAPTURE_IN_PROGRESS",
            CaptureStatus::Captured => "CAPTURED",
            CaptureStatus::CaptureFailed => "CAPTURE_FAILED",
            CaptureStatus::NeedsReconcile => "NEEDS_RECONCILE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for LifecycleStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(LifecycleStatus::Pending),
            "APPROVED" => Ok(LifecycleStatus::Approved),
            "DENIED" => Ok(LifecycleStatus::Denied),
            "CANCELLED" => Ok(LifecycleStatus::Cancelled),
            other => Err(ParseStatusError { kind: "lifecycle status", value: other.to_string() }),
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNPAID" => Ok(PaymentStatus::Unpaid),
            "HELD" => Ok(PaymentStatus::Held),
            "PAID" => Ok(PaymentStatus::Paid),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            other => Err(ParseStatusError { kind: "payment status", value: other.to_string() }),
        }
    }
}

impl FromStr for CaptureStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(CaptureStatus::None),
            "CAPTURE_IN_PROGRESS" => Ok(CaptureStatus::CaptureInProgress),
            "CAPTURED" => Ok(CaptureStatus::Captured),
            "CAPTURE_FAILED" => Ok(CaptureStatus::CaptureFailed),
            "NEEDS_RECONCILE" => Ok(CaptureStatus::NeedsReconcile),
            other => Err(ParseStatusError { kind: "capture status", value: other.to_string() }),
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ledger row: single source of truth for a booking's money and approval state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub class_id: Uuid,
    pub quantity: i32,
    pub student_names: Vec<String>,

    /// Minor currency units, platform fee included
    pub total_amount: i64,
    pub platform_fee: Option<i64>,
    pub host_payout_amount: Option<i64>,
    pub gateway_fee_estimate: Option<i64>,

    pub status: LifecycleStatus,
    pub payment_status: PaymentStatus,
    pub capture_status: CaptureStatus,

    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,

    pub capture_attempt_count: i32,
    pub capture_last_error: Option<String>,
    pub host_message: Option<String>,
    pub reviews_unlocked: bool,

    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub denied_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub paid_out_at: Option<DateTime<Utc>>,
    /// Last payout pass that failed for this booking's class
    pub payout_failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(user_id: Uuid, class_id: Uuid, quantity: i32, total_amount: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            class_id,
            quantity,
            student_names: Vec::new(),
            total_amount,
            platform_fee: None,
            host_payout_amount: None,
            gateway_fee_estimate: None,
            status: LifecycleStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            capture_status: CaptureStatus::None,
            checkout_session_id: None,
            payment_intent_id: None,
            charge_id: None,
            transfer_id: None,
            refund_id: None,
            capture_attempt_count: 0,
            capture_last_error: None,
            host_message: None,
            reviews_unlocked: false,
            created_at: now,
            approved_at: None,
            denied_at: None,
            captured_at: None,
            paid_out_at: None,
            payout_failed_at: None,
            updated_at: now,
        }
    }

    /// Funds are captured and recorded, or the booking can no longer move money.
    /// Nothing is left for the reconciliation sweep to repair.
    pub fn is_settled(&self) -> bool {
        let captured_and_recorded = self.capture_status == CaptureStatus::Captured
            && matches!(
                self.payment_status,
                PaymentStatus::Held | PaymentStatus::Paid | PaymentStatus::Completed
            );

        captured_and_recorded
            || matches!(self.status, LifecycleStatus::Denied | LifecycleStatus::Cancelled)
            || matches!(self.payment_status, PaymentStatus::Refunded | PaymentStatus::Completed)
    }

    /// Eligible for payout once the class has ended and the buffer has elapsed
    pub fn is_payout_ready(&self, class_end: DateTime<Utc>, buffer_hours: i64, now: DateTime<Utc>) -> bool {
        self.payment_status == PaymentStatus::Held
            && self.capture_status == CaptureStatus::Captured
            && class_end + Duration::hours(buffer_hours) <= now
    }
}

/// A bookable class as far as payments are concerned
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassListing {
    pub id: Uuid,
    pub host_id: Uuid,
    pub title: String,
    /// Base price in minor units, when the listing stores it that way
    pub price_cents: Option<i64>,
    /// Base price in major units (e.g. dollars)
    pub price: Option<f64>,
    pub capacity: i32,
    pub auto_approve: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
}

impl ClassListing {
    /// End date if set, else start plus duration, else the start itself
    pub fn end_instant(&self) -> DateTime<Utc> {
        if let Some(end) = self.end_date {
            return end;
        }
        match self.duration_minutes {
            Some(minutes) => self.start_date + Duration::minutes(minutes as i64),
            None => self.start_date,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    Held,
    Expired,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Held => "HELD",
            HoldStatus::Expired => "EXPIRED",
        }
    }
}

impl FromStr for HoldStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HELD" => Ok(HoldStatus::Held),
            "EXPIRED" => Ok(HoldStatus::Expired),
            other => Err(ParseStatusError { kind: "hold status", value: other.to_string() }),
        }
    }
}

/// Provisional seat reservation taken while the guest is in checkout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingHold {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub class_id: Uuid,
    pub user_id: Uuid,
    pub quantity: i32,
    pub status: HoldStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl BookingHold {
    pub fn new(booking_id: Uuid, class_id: Uuid, user_id: Uuid, quantity: i32, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            booking_id,
            class_id,
            user_id,
            quantity,
            status: HoldStatus::Held,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == HoldStatus::Held && self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn class(end_date: Option<DateTime<Utc>>, duration: Option<i32>) -> ClassListing {
        ClassListing {
            id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            title: "Pottery".to_string(),
            price_cents: Some(10000),
            price: None,
            capacity: 8,
            auto_approve: false,
            start_date: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
            end_date,
            duration_minutes: duration,
        }
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for s in ["PENDING", "APPROVED", "DENIED", "CANCELLED"] {
            assert_eq!(s.parse::<LifecycleStatus>().unwrap().as_str(), s);
        }
        for s in ["NONE", "CAPTURE_IN_PROGRESS", "CAPTURED", "CAPTURE_FAILED", "NEEDS_RECONCILE"] {
            assert_eq!(s.parse::<CaptureStatus>().unwrap().as_str(), s);
        }
        assert!("SETTLED".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_only_pending_is_non_terminal() {
        assert!(!LifecycleStatus::Pending.is_terminal());
        assert!(LifecycleStatus::Approved.is_terminal());
        assert!(LifecycleStatus::Denied.is_terminal());
        assert!(LifecycleStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_class_end_instant() {
        let explicit = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap();
        assert_eq!(class(Some(explicit), Some(30)).end_instant(), explicit);

        let by_duration = class(None, Some(90)).end_instant();
        assert_eq!(by_duration, Utc.with_ymd_and_hms(2026, 3, 1, 11, 30, 0).unwrap());

        let c = class(None, None);
        assert_eq!(c.end_instant(), c.start_date);
    }

    #[test]
    fn test_payout_ready_requires_buffer() {
        let mut booking = Booking::new(Uuid::new_v4(), Uuid::new_v4(), 1, 11500);
        booking.payment_status = PaymentStatus::Held;
        booking.capture_status = CaptureStatus::Captured;

        let end = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(!booking.is_payout_ready(end, 24, end + Duration::hours(23)));
        assert!(booking.is_payout_ready(end, 24, end + Duration::hours(24)));

        booking.capture_status = CaptureStatus::NeedsReconcile;
        assert!(!booking.is_payout_ready(end, 24, end + Duration::hours(48)));
    }

    #[test]
    fn test_settled_bookings() {
        let mut booking = Booking::new(Uuid::new_v4(), Uuid::new_v4(), 1, 5000);
        assert!(!booking.is_settled());

        booking.capture_status = CaptureStatus::NeedsReconcile;
        assert!(!booking.is_settled());

        booking.capture_status = CaptureStatus::Captured;
        booking.payment_status = PaymentStatus::Held;
        assert!(booking.is_settled());

        let mut denied = Booking::new(Uuid::new_v4(), Uuid::new_v4(), 1, 5000);
        denied.status = LifecycleStatus::Denied;
        assert!(denied.is_settled());
    }
}
