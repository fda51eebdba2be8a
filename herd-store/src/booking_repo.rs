use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;
use herd_core::{
    Booking, BookingHold, BookingLedger, BookingPatch, ClassCatalog, ClassListing, LedgerError,
    LedgerResult, ReconciliationQueue, ReconciliationRecord, TransitionGuard,
};

const BOOKING_COLUMNS: &str = "id, user_id, class_id, quantity, student_names, total_amount, platform_fee, \
     host_payout_amount, gateway_fee_estimate, status, payment_status, capture_status, checkout_session_id, \
     payment_intent_id, charge_id, transfer_id, refund_id, capture_attempt_count, capture_last_error, \
     host_message, reviews_unlocked, created_at, approved_at, denied_at, captured_at, paid_out_at, payout_failed_at, \
     updated_at";

const RECONCILIATION_COLUMNS: &str = "id, booking_id, payment_intent_id, charge_id, reason, status, details, \
     resolution, created_at, resolved_at";

fn db_err(e: sqlx::Error) -> LedgerError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LedgerError::Unavailable(e.to_string())
        }
        other => LedgerError::Database(other.to_string()),
    }
}

fn parse<T: std::str::FromStr>(value: &str) -> LedgerResult<T>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| LedgerError::Corrupt(e.to_string()))
}

/// Postgres-backed ledger, catalog and reconciliation queue
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    user_id: Uuid,
    class_id: Uuid,
    quantity: i32,
    student_names: Option<Vec<String>>,
    total_amount: i64,
    platform_fee: Option<i64>,
    host_payout_amount: Option<i64>,
    gateway_fee_estimate: Option<i64>,
    status: String,
    payment_status: String,
    capture_status: String,
    checkout_session_id: Option<String>,
    payment_intent_id: Option<String>,
    charge_id: Option<String>,
    transfer_id: Option<String>,
    refund_id: Option<String>,
    capture_attempt_count: i32,
    capture_last_error: Option<String>,
    host_message: Option<String>,
    reviews_unlocked: bool,
    created_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
    denied_at: Option<DateTime<Utc>>,
    captured_at: Option<DateTime<Utc>>,
    paid_out_at: Option<DateTime<Utc>>,
    payout_failed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = LedgerError;

    fn try_from(row: BookingRow) -> LedgerResult<Self> {
        Ok(Booking {
            id: row.id,
            user_id: row.user_id,
            class_id: row.class_id,
            quantity: row.quantity,
            student_names: row.student_names.unwrap_or_default(),
            total_amount: row.total_amount,
            platform_fee: row.platform_fee,
            host_payout_amount: row.host_payout_amount,
            gateway_fee_estimate: row.gateway_fee_estimate,
            status: parse(&row.status)?,
            payment_status: parse(&row.payment_status)?,
            capture_status: parse(&row.capture_status)?,
            checkout_session_id: row.checkout_session_id,
            payment_intent_id: row.payment_intent_id,
            charge_id: row.charge_id,
            transfer_id: row.transfer_id,
            refund_id: row.refund_id,
            capture_attempt_count: row.capture_attempt_count,
            capture_last_error: row.capture_last_error,
            host_message: row.host_message,
            reviews_unlocked: row.reviews_unlocked,
            created_at: row.created_at,
            approved_at: row.approved_at,
            denied_at: row.denied_at,
            captured_at: row.captured_at,
            paid_out_at: row.paid_out_at,
            payout_failed_at: row.payout_failed_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_bookings(rows: Vec<BookingRow>) -> LedgerResult<Vec<Booking>> {
    rows.into_iter().map(Booking::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct ClassRow {
    id: Uuid,
    host_id: Uuid,
    title: String,
    price_cents: Option<i64>,
    price: Option<f64>,
    capacity: i32,
    auto_approve: bool,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    duration_minutes: Option<i32>,
}

impl From<ClassRow> for ClassListing {
    fn from(row: ClassRow) -> Self {
        ClassListing {
            id: row.id,
            host_id: row.host_id,
            title: row.title,
            price_cents: row.price_cents,
            price: row.price,
            capacity: row.capacity,
            auto_approve: row.auto_approve,
            start_date: row.start_date,
            end_date: row.end_date,
            duration_minutes: row.duration_minutes,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReconciliationRow {
    id: Uuid,
    booking_id: Uuid,
    payment_intent_id: Option<String>,
    charge_id: Option<String>,
    reason: String,
    status: String,
    details: Option<serde_json::Value>,
    resolution: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReconciliationRow> for ReconciliationRecord {
    type Error = LedgerError;

    fn try_from(row: ReconciliationRow) -> LedgerResult<Self> {
        Ok(ReconciliationRecord {
            id: row.id,
            booking_id: row.booking_id,
            payment_intent_id: row.payment_intent_id,
            charge_id: row.charge_id,
            reason: parse(&row.reason)?,
            status: parse(&row.status)?,
            details: row.details.unwrap_or(serde_json::Value::Null),
            resolution: row.resolution,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

/// Build the conditional UPDATE for one transition. The WHERE clause carries
/// the guard, so the row only changes if it is still in an expected state.
fn transition_query<'a>(
    id: Uuid,
    guard: &TransitionGuard,
    patch: &'a BookingPatch,
    now: DateTime<Utc>,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE bookings SET updated_at = ");
    qb.push_bind(now);

    if let Some(s) = patch.status {
        qb.push(", status = ").push_bind(s.as_str());
    }
    if let Some(s) = patch.payment_status {
        qb.push(", payment_status = ").push_bind(s.as_str());
    }
    if let Some(s) = patch.capture_status {
        qb.push(", capture_status = ").push_bind(s.as_str());
    }

    let text_fields = [
        ("checkout_session_id", &patch.checkout_session_id),
        ("payment_intent_id", &patch.payment_intent_id),
        ("charge_id", &patch.charge_id),
        ("transfer_id", &patch.transfer_id),
        ("refund_id", &patch.refund_id),
        ("capture_last_error", &patch.capture_last_error),
        ("host_message", &patch.host_message),
    ];
    for (column, value) in text_fields {
        if let Some(v) = value {
            qb.push(format!(", {} = ", column)).push_bind(v.as_str());
        }
    }

    let amount_fields = [
        ("platform_fee", patch.platform_fee),
        ("host_payout_amount", patch.host_payout_amount),
        ("gateway_fee_estimate", patch.gateway_fee_estimate),
    ];
    for (column, value) in amount_fields {
        if let Some(v) = value {
            qb.push(format!(", {} = ", column)).push_bind(v);
        }
    }

    if patch.increment_capture_attempts {
        qb.push(", capture_attempt_count = capture_attempt_count + 1");
    }

    // First write wins for these two
    if let Some(t) = patch.approved_at {
        qb.push(", approved_at = COALESCE(approved_at, ").push_bind(t).push(")");
    }
    if let Some(t) = patch.captured_at {
        qb.push(", captured_at = COALESCE(captured_at, ").push_bind(t).push(")");
    }
    if let Some(t) = patch.denied_at {
        qb.push(", denied_at = ").push_bind(t);
    }
    if let Some(t) = patch.paid_out_at {
        qb.push(", paid_out_at = ").push_bind(t);
    }

    qb.push(" WHERE id = ").push_bind(id);

    if let Some(allowed) = &guard.lifecycle {
        let values: Vec<String> = allowed.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND status = ANY(").push_bind(values).push(")");
    }
    if let Some(allowed) = &guard.payment {
        let values: Vec<String> = allowed.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND payment_status = ANY(").push_bind(values).push(")");
    }
    if let Some(allowed) = &guard.capture {
        let values: Vec<String> = allowed.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND capture_status = ANY(").push_bind(values).push(")");
    }

    qb.push(" RETURNING ").push(BOOKING_COLUMNS);
    qb
}

#[async_trait]
impl ClassCatalog for PgStore {
    async fn get_class(&self, class_id: Uuid) -> LedgerResult<Option<ClassListing>> {
        let row = sqlx::query_as::<_, ClassRow>(
            "SELECT id, host_id, title, price_cents, price, capacity, auto_approve, start_date, end_date, duration_minutes \
             FROM classes WHERE id = $1",
        )
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(ClassListing::from))
    }

    async fn available_seats(&self, class_id: Uuid, now: DateTime<Utc>) -> LedgerResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT available_seats($1, $2)")
            .bind(class_id)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn host_payout_account(&self, host_id: Uuid) -> LedgerResult<Option<String>> {
        let account = sqlx::query_scalar::<_, Option<String>>("SELECT stripe_account_id FROM profiles WHERE id = $1")
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(account.flatten())
    }

    async fn set_host_payout_account(&self, host_id: Uuid, account_id: &str) -> LedgerResult<()> {
        let result = sqlx::query("UPDATE profiles SET stripe_account_id = $2 WHERE id = $1")
            .bind(host_id)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Database(format!("no profile for host {}", host_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BookingLedger for PgStore {
    async fn insert_booking(&self, booking: &Booking) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (
                id, user_id, class_id, quantity, student_names, total_amount, status, payment_status,
                capture_status, checkout_session_id, payment_intent_id, capture_attempt_count,
                reviews_unlocked, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(booking.id)
        .bind(booking.user_id)
        .bind(booking.class_id)
        .bind(booking.quantity)
        .bind(&booking.student_names)
        .bind(booking.total_amount)
        .bind(booking.status.as_str())
        .bind(booking.payment_status.as_str())
        .bind(booking.capture_status.as_str())
        .bind(&booking.checkout_session_id)
        .bind(&booking.payment_intent_id)
        .bind(booking.capture_attempt_count)
        .bind(booking.reviews_unlocked)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_booking_by_session(&self, session_id: &str) -> LedgerResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE checkout_session_id = $1",
            BOOKING_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn transition(&self, id: Uuid, guard: &TransitionGuard, patch: &BookingPatch) -> LedgerResult<Option<Booking>> {
        let mut qb = transition_query(id, guard, patch, Utc::now());
        let row = qb
            .build_query_as::<BookingRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn list_expirable_bookings(&self, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings \
             WHERE status = 'PENDING' AND capture_status IN ('NONE', 'CAPTURE_FAILED') \
             AND class_id IN (SELECT c.id FROM classes c WHERE class_end_instant(c) < $1) \
             ORDER BY created_at LIMIT $2",
            BOOKING_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_bookings(rows)
    }

    async fn list_stalled_captures(&self, older_than: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings \
             WHERE capture_status = 'CAPTURE_IN_PROGRESS' AND updated_at < $1 \
             ORDER BY updated_at LIMIT $2",
            BOOKING_COLUMNS
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_bookings(rows)
    }

    async fn due_payouts(&self, buffer_hours: i64, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM due_payouts($1, $2, $3)",
            BOOKING_COLUMNS
        ))
        .bind(buffer_hours as i32)
        .bind(now)
        .bind(limit as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_bookings(rows)
    }

    async fn mark_payout_failed(&self, booking_ids: &[Uuid], now: DateTime<Utc>) -> LedgerResult<u64> {
        let result = sqlx::query(
            "UPDATE bookings SET payout_failed_at = $2, updated_at = $2 \
             WHERE id = ANY($1) AND payment_status = 'HELD'",
        )
        .bind(booking_ids)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn unlock_reviews(&self, booking_ids: &[Uuid]) -> LedgerResult<u64> {
        let result = sqlx::query(
            "UPDATE bookings SET reviews_unlocked = TRUE, updated_at = now() \
             WHERE id = ANY($1) AND reviews_unlocked = FALSE",
        )
        .bind(booking_ids)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn insert_hold(&self, hold: &BookingHold) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO booking_holds (id, booking_id, class_id, user_id, quantity, status, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(hold.id)
        .bind(hold.booking_id)
        .bind(hold.class_id)
        .bind(hold.user_id)
        .bind(hold.quantity)
        .bind(hold.status.as_str())
        .bind(hold.expires_at)
        .bind(hold.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn release_hold(&self, booking_id: Uuid) -> LedgerResult<()> {
        sqlx::query("UPDATE booking_holds SET status = 'EXPIRED' WHERE booking_id = $1 AND status = 'HELD'")
            .bind(booking_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn expire_holds(&self, now: DateTime<Utc>) -> LedgerResult<u64> {
        let result = sqlx::query("UPDATE booking_holds SET status = 'EXPIRED' WHERE status = 'HELD' AND expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReconciliationQueue for PgStore {
    async fn open_reconciliation(&self, record: &ReconciliationRecord) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO payment_reconciliations \
             (id, booking_id, payment_intent_id, charge_id, reason, status, details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(record.booking_id)
        .bind(&record.payment_intent_id)
        .bind(&record.charge_id)
        .bind(record.reason.as_str())
        .bind(record.status.as_str())
        .bind(&record.details)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn has_open_reconciliation(&self, booking_id: Uuid) -> LedgerResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM payment_reconciliations WHERE booking_id = $1 AND status = 'OPEN')",
        )
        .bind(booking_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_open_reconciliations(&self, limit: i64) -> LedgerResult<Vec<ReconciliationRecord>> {
        let rows = sqlx::query_as::<_, ReconciliationRow>(&format!(
            "SELECT {} FROM payment_reconciliations WHERE status = 'OPEN' ORDER BY created_at LIMIT $1",
            RECONCILIATION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(ReconciliationRecord::try_from).collect()
    }

    async fn resolve_reconciliation(&self, id: Uuid, resolution: &str, now: DateTime<Utc>) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE payment_reconciliations SET status = 'RESOLVED', resolution = $2, resolved_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(resolution)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_core::{CaptureStatus, LifecycleStatus, PaymentStatus};

    fn row(status: &str) -> BookingRow {
        let now = Utc::now();
        BookingRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            class_id: Uuid::new_v4(),
            quantity: 1,
            student_names: None,
            total_amount: 11500,
            platform_fee: None,
            host_payout_amount: None,
            gateway_fee_estimate: None,
            status: status.to_string(),
            payment_status: "UNPAID".to_string(),
            capture_status: "NONE".to_string(),
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

    #[test]
    fn test_row_statuses_are_parsed() {
        let booking = Booking::try_from(row("PENDING")).unwrap();
        assert_eq!(booking.status, LifecycleStatus::Pending);
        assert_eq!(booking.payment_status, PaymentStatus::Unpaid);
        assert_eq!(booking.capture_status, CaptureStatus::None);
        assert!(booking.student_names.is_empty());
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let err = Booking::try_from(row("ON_HOLD")).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt(_)));
    }

    #[test]
    fn test_transition_sql_carries_guard_and_first_write_wins() {
        let patch = BookingPatch {
            increment_capture_attempts: true,
            captured_at: Some(Utc::now()),
            ..BookingPatch::capture(herd_core::CaptureTransition::Succeed)
        };
        let guard = TransitionGuard::for_capture(herd_core::CaptureTransition::Succeed)
            .lifecycle(&[LifecycleStatus::Pending]);

        let qb = transition_query(Uuid::new_v4(), &guard, &patch, Utc::now());
        let sql = qb.sql();

        assert!(sql.starts_with("UPDATE bookings SET updated_at = $1"));
        assert!(sql.contains("capture_status = $2"));
        assert!(sql.contains("capture_attempt_count = capture_attempt_count + 1"));
        assert!(sql.contains("captured_at = COALESCE(captured_at, $3)"));
        assert!(sql.contains("AND status = ANY($5)"));
        assert!(sql.contains("AND capture_status = ANY($6)"));
        assert!(sql.contains("RETURNING id, user_id"));
    }
}
