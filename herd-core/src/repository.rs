use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use crate::booking::{Booking, BookingHold, ClassListing};
use crate::reconciliation::ReconciliationRecord;
use crate::transition::{BookingPatch, TransitionGuard};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Read access to classes and host payout accounts
#[async_trait]
pub trait ClassCatalog: Send + Sync {
    async fn get_class(&self, class_id: Uuid) -> LedgerResult<Option<ClassListing>>;

    /// Seats not taken by live bookings or live holds
    async fn available_seats(&self, class_id: Uuid, now: DateTime<Utc>) -> LedgerResult<i64>;

    async fn host_payout_account(&self, host_id: Uuid) -> LedgerResult<Option<String>>;

    async fn set_host_payout_account(&self, host_id: Uuid, account_id: &str) -> LedgerResult<()>;
}

/// The booking ledger. All status writes go through [`BookingLedger::transition`].
#[async_trait]
pub trait BookingLedger: Send + Sync {
    async fn insert_booking(&self, booking: &Booking) -> LedgerResult<()>;

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>>;

    async fn find_booking_by_session(&self, session_id: &str) -> LedgerResult<Option<Booking>>;

    /// Apply `patch` only if the row currently satisfies `guard`.
    /// Returns the updated row, or `None` when the guard did not match.
    async fn transition(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        patch: &BookingPatch,
    ) -> LedgerResult<Option<Booking>>;

    /// PENDING bookings whose class ended before `now` and whose capture has
    /// not moved money (NONE or CAPTURE_FAILED), oldest first
    async fn list_expirable_bookings(&self, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>>;

    /// Bookings left in CAPTURE_IN_PROGRESS since before `older_than`
    async fn list_stalled_captures(&self, older_than: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>>;

    /// Captured, HELD bookings whose class ended at least `buffer_hours` ago.
    /// Classes that never failed a payout come first, then the least recently
    /// failed, then by class end.
    async fn due_payouts(&self, buffer_hours: i64, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>>;

    /// Stamp `payout_failed_at` on bookings still HELD so later passes rotate
    /// to other classes
    async fn mark_payout_failed(&self, booking_ids: &[Uuid], now: DateTime<Utc>) -> LedgerResult<u64>;

    async fn unlock_reviews(&self, booking_ids: &[Uuid]) -> LedgerResult<u64>;

    async fn insert_hold(&self, hold: &BookingHold) -> LedgerResult<()>;

    async fn release_hold(&self, booking_id: Uuid) -> LedgerResult<()>;

    /// Mark every HELD hold past its expiry as EXPIRED
    async fn expire_holds(&self, now: DateTime<Utc>) -> LedgerResult<u64>;
}

/// Queue of gateway/ledger disagreements awaiting repair
#[async_trait]
pub trait ReconciliationQueue: Send + Sync {
    async fn open_reconciliation(&self, record: &ReconciliationRecord) -> LedgerResult<()>;

    async fn has_open_reconciliation(&self, booking_id: Uuid) -> LedgerResult<bool>;

    async fn list_open_reconciliations(&self, limit: i64) -> LedgerResult<Vec<ReconciliationRecord>>;

    async fn resolve_reconciliation(&self, id: Uuid, resolution: &str, now: DateTime<Utc>) -> LedgerResult<()>;
}
