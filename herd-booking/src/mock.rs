//! In-memory collaborators for exercising the orchestrator without Postgres or
//! a live gateway. The store applies guarded transitions under one lock, which
//! gives it the same compare-and-set semantics as the SQL ledger.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;
use herd_core::payment::{
    CheckoutSession, CheckoutSessionRequest, ConnectedAccount, ConnectedAccountRequest, IntentStatus,
    PaymentIntent, Refund, Transfer, TransferRequest,
};
use herd_core::{
    Booking, BookingHold, BookingLedger, BookingPatch, CaptureStatus, ClassCatalog, ClassListing,
    GatewayError, GatewayResult, HoldStatus, LedgerError, LedgerResult, LifecycleStatus, Notification,
    NotificationSink, NotifyError, PaymentGateway, PaymentRules, PaymentStatus, ReconciliationQueue,
    ReconciliationRecord, ReconciliationStatus, TransitionGuard,
};
use crate::orchestrator::BookingOrchestrator;

/// Injected ledger failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerFault {
    /// Fail the next transition that records a completed capture, once
    CaptureCommit,
    /// Fail every transition for this booking
    TransitionFor(Uuid),
}

#[derive(Default)]
struct StoreState {
    classes: HashMap<Uuid, ClassListing>,
    bookings: HashMap<Uuid, Booking>,
    holds: HashMap<Uuid, BookingHold>,
    reconciliations: Vec<ReconciliationRecord>,
    payout_accounts: HashMap<Uuid, String>,
    faults: Vec<LedgerFault>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("store lock poisoned".to_string()))
    }

    fn with<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// An upcoming class, a week out, two hours long
    pub fn add_class(&self, auto_approve: bool, capacity: i32, price_cents: Option<i64>) -> ClassListing {
        let class = ClassListing {
            id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            title: "Wheel Throwing Basics".to_string(),
            price_cents,
            price: None,
            capacity,
            auto_approve,
            start_date: Utc::now() + chrono::Duration::days(7),
            end_date: None,
            duration_minutes: Some(120),
        };
        self.with(|s| s.classes.insert(class.id, class.clone()));
        class
    }

    pub fn add_class_ending_at(&self, end: DateTime<Utc>) -> ClassListing {
        let class = ClassListing {
            id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            title: "Sourdough Workshop".to_string(),
            price_cents: Some(10000),
            price: None,
            capacity: 10,
            auto_approve: false,
            start_date: end - chrono::Duration::hours(2),
            end_date: Some(end),
            duration_minutes: None,
        };
        self.with(|s| s.classes.insert(class.id, class.clone()));
        class
    }

    /// A PENDING booking whose guest has completed checkout with an
    /// authorisation hold of `total`
    pub async fn add_authorised_booking(&self, class: &ClassListing, gateway: &MockGateway, total: i64) -> Booking {
        let mut booking = Booking::new(Uuid::new_v4(), class.id, 1, total);
        let session = gateway.authorised_session(&booking, total).await;
        booking.checkout_session_id = Some(session.id);
        booking.payment_intent_id = session.payment_intent_id;
        self.with(|s| s.bookings.insert(booking.id, booking.clone()));
        booking
    }

    pub fn booking(&self, id: Uuid) -> Option<Booking> {
        self.with(|s| s.bookings.get(&id).cloned())
    }

    pub fn booking_count(&self) -> usize {
        self.with(|s| s.bookings.len())
    }

    /// Edit a row directly, bypassing guards and timestamps
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Booking)) {
        self.with(|s| {
            if let Some(booking) = s.bookings.get_mut(&id) {
                f(booking);
            }
        });
    }

    pub fn inject(&self, fault: LedgerFault) {
        self.with(|s| s.faults.push(fault));
    }

    pub fn reconciliations(&self) -> Vec<ReconciliationRecord> {
        self.with(|s| s.reconciliations.clone())
    }

    pub fn put_reconciliation(&self, record: ReconciliationRecord) {
        self.with(|s| s.reconciliations.push(record));
    }

    pub fn put_hold(&self, hold: BookingHold) {
        self.with(|s| s.holds.insert(hold.id, hold));
    }

    pub fn hold(&self, id: Uuid) -> Option<BookingHold> {
        self.with(|s| s.holds.get(&id).cloned())
    }

    pub fn holds_for(&self, booking_id: Uuid) -> Vec<BookingHold> {
        self.with(|s| s.holds.values().filter(|h| h.booking_id == booking_id).cloned().collect())
    }

    pub fn set_payout_account(&self, host_id: Uuid, account_id: &str) {
        self.with(|s| s.payout_accounts.insert(host_id, account_id.to_string()));
    }

    pub fn payout_account(&self, host_id: Uuid) -> Option<String> {
        self.with(|s| s.payout_accounts.get(&host_id).cloned())
    }

    pub fn available(&self, class_id: Uuid) -> i64 {
        self.with(|s| seats_left(s, class_id, Utc::now()))
    }
}

/// Mirrors the `available_seats` SQL function
fn seats_left(state: &StoreState, class_id: Uuid, now: DateTime<Utc>) -> i64 {
    let Some(class) = state.classes.get(&class_id) else {
        return 0;
    };
    let live_hold = |booking_id: Uuid| {
        state.holds.values().any(|h| h.booking_id == booking_id && h.is_live(now))
    };

    let booked: i64 = state
        .bookings
        .values()
        .filter(|b| b.class_id == class_id)
        .filter(|b| matches!(b.status, LifecycleStatus::Pending | LifecycleStatus::Approved))
        .filter(|b| !matches!(b.payment_status, PaymentStatus::Failed | PaymentStatus::Refunded))
        .filter(|b| b.payment_intent_id.is_some() || b.payment_status != PaymentStatus::Unpaid || live_hold(b.id))
        .map(|b| b.quantity as i64)
        .sum();

    // Holds taken by checkouts whose booking row is not written yet
    let in_checkout: i64 = state
        .holds
        .values()
        .filter(|h| h.class_id == class_id && h.is_live(now) && !state.bookings.contains_key(&h.booking_id))
        .map(|h| h.quantity as i64)
        .sum();

    (class.capacity as i64 - booked - in_checkout).max(0)
}

#[async_trait]
impl ClassCatalog for InMemoryStore {
    async fn get_class(&self, class_id: Uuid) -> LedgerResult<Option<ClassListing>> {
        Ok(self.lock()?.classes.get(&class_id).cloned())
    }

    async fn available_seats(&self, class_id: Uuid, now: DateTime<Utc>) -> LedgerResult<i64> {
        Ok(seats_left(&*self.lock()?, class_id, now))
    }

    async fn host_payout_account(&self, host_id: Uuid) -> LedgerResult<Option<String>> {
        Ok(self.lock()?.payout_accounts.get(&host_id).cloned())
    }

    async fn set_host_payout_account(&self, host_id: Uuid, account_id: &str) -> LedgerResult<()> {
        self.lock()?.payout_accounts.insert(host_id, account_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl BookingLedger for InMemoryStore {
    async fn insert_booking(&self, booking: &Booking) -> LedgerResult<()> {
        let mut state = self.lock()?;
        if state.bookings.contains_key(&booking.id) {
            return Err(LedgerError::Database(format!("duplicate booking {}", booking.id)));
        }
        state.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>> {
        Ok(self.lock()?.bookings.get(&id).cloned())
    }

    async fn find_booking_by_session(&self, session_id: &str) -> LedgerResult<Option<Booking>> {
        Ok(self
            .lock()?
            .bookings
            .values()
            .find(|b| b.checkout_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn transition(&self, id: Uuid, guard: &TransitionGuard, patch: &BookingPatch) -> LedgerResult<Option<Booking>> {
        let mut state = self.lock()?;

        if state.faults.contains(&LedgerFault::TransitionFor(id)) {
            return Err(LedgerError::Database(format!("injected failure for {}", id)));
        }
        if patch.capture_status == Some(CaptureStatus::Captured) {
            if let Some(pos) = state.faults.iter().position(|f| *f == LedgerFault::CaptureCommit) {
                state.faults.remove(pos);
                return Err(LedgerError::Unavailable("injected capture commit failure".to_string()));
            }
        }

        let Some(booking) = state.bookings.get_mut(&id) else {
            return Ok(None);
        };
        if !guard.matches(booking) {
            return Ok(None);
        }
        patch.apply(booking, Utc::now());
        Ok(Some(booking.clone()))
    }

    async fn list_expirable_bookings(&self, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>> {
        let state = self.lock()?;
        let class_ended = |b: &Booking| {
            state
                .classes
                .get(&b.class_id)
                .map_or(false, |c| c.end_instant() < now)
        };
        let mut rows: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.status == LifecycleStatus::Pending)
            .filter(|b| matches!(b.capture_status, CaptureStatus::None | CaptureStatus::CaptureFailed))
            .filter(|b| class_ended(*b))
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_stalled_captures(&self, older_than: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>> {
        let state = self.lock()?;
        let mut rows: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.capture_status == CaptureStatus::CaptureInProgress && b.updated_at < older_than)
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.updated_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn due_payouts(&self, buffer_hours: i64, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<Booking>> {
        let state = self.lock()?;
        let ready: Vec<(DateTime<Utc>, Booking)> = state
            .bookings
            .values()
            .filter_map(|b| {
                let end = state.classes.get(&b.class_id)?.end_instant();
                b.is_payout_ready(end, buffer_hours, now).then(|| (end, b.clone()))
            })
            .collect();

        // Latest failure per class; `None` sorts ahead of any timestamp
        let mut last_failed: HashMap<Uuid, Option<DateTime<Utc>>> = HashMap::new();
        for (_, b) in &ready {
            let entry = last_failed.entry(b.class_id).or_insert(None);
            *entry = (*entry).max(b.payout_failed_at);
        }

        let mut rows = ready;
        rows.sort_by_key(|(end, b)| (last_failed[&b.class_id], *end, b.class_id, b.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows.into_iter().map(|(_, b)| b).collect())
    }

    async fn mark_payout_failed(&self, booking_ids: &[Uuid], now: DateTime<Utc>) -> LedgerResult<u64> {
        let mut state = self.lock()?;
        let mut marked = 0;
        for id in booking_ids {
            if let Some(b) = state.bookings.get_mut(id) {
                if b.payment_status == PaymentStatus::Held {
                    b.payout_failed_at = Some(now);
                    b.updated_at = now;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn unlock_reviews(&self, booking_ids: &[Uuid]) -> LedgerResult<u64> {
        let mut state = self.lock()?;
        let mut unlocked = 0;
        for id in booking_ids {
            if let Some(b) = state.bookings.get_mut(id) {
                if !b.reviews_unlocked {
                    b.reviews_unlocked = true;
                    unlocked += 1;
                }
            }
        }
        Ok(unlocked)
    }

    async fn insert_hold(&self, hold: &BookingHold) -> LedgerResult<()> {
        self.lock()?.holds.insert(hold.id, hold.clone());
        Ok(())
    }

    async fn release_hold(&self, booking_id: Uuid) -> LedgerResult<()> {
        let mut state = self.lock()?;
        for hold in state.holds.values_mut().filter(|h| h.booking_id == booking_id) {
            hold.status = HoldStatus::Expired;
        }
        Ok(())
    }

    async fn expire_holds(&self, now: DateTime<Utc>) -> LedgerResult<u64> {
        let mut state = self.lock()?;
        let mut expired = 0;
        for hold in state.holds.values_mut() {
            if hold.status == HoldStatus::Held && hold.expires_at <= now {
                hold.status = HoldStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl ReconciliationQueue for InMemoryStore {
    async fn open_reconciliation(&self, record: &ReconciliationRecord) -> LedgerResult<()> {
        self.lock()?.reconciliations.push(record.clone());
        Ok(())
    }

    async fn has_open_reconciliation(&self, booking_id: Uuid) -> LedgerResult<bool> {
        Ok(self
            .lock()?
            .reconciliations
            .iter()
            .any(|r| r.booking_id == booking_id && r.status == ReconciliationStatus::Open))
    }

    async fn list_open_reconciliations(&self, limit: i64) -> LedgerResult<Vec<ReconciliationRecord>> {
        let state = self.lock()?;
        let mut rows: Vec<ReconciliationRecord> = state
            .reconciliations
            .iter()
            .filter(|r| r.status == ReconciliationStatus::Open)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn resolve_reconciliation(&self, id: Uuid, resolution: &str, now: DateTime<Utc>) -> LedgerResult<()> {
        let mut state = self.lock()?;
        let record = state
            .reconciliations
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LedgerError::Database(format!("reconciliation {} not found", id)))?;
        record.status = ReconciliationStatus::Resolved;
        record.resolution = Some(resolution.to_string());
        record.resolved_at = Some(now);
        Ok(())
    }
}

/// Gateway operations, for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayCall {
    CreateCheckoutSession,
    RetrieveCheckoutSession,
    RetrievePaymentIntent,
    Capture,
    Cancel,
    Refund,
    Transfer,
    CreateAccount,
    RetrieveAccount,
    AccountLink,
}

#[derive(Default)]
struct GatewayState {
    seq: u64,
    calls: Vec<GatewayCall>,
    fail_next: Vec<GatewayCall>,
    capture_delay: Option<Duration>,
    /// Captures that settle but whose response never reaches the caller
    lost_captures: usize,
    sessions: HashMap<String, CheckoutSession>,
    intents: HashMap<String, PaymentIntent>,
    session_requests: Vec<CheckoutSessionRequest>,
    /// Keyed by idempotency key
    refunds: HashMap<String, Refund>,
    refund_keys: Vec<String>,
    transfers: HashMap<String, Transfer>,
    transfer_requests: Vec<TransferRequest>,
    accounts: HashMap<String, ConnectedAccount>,
}

impl GatewayState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{}_mock{:06}", prefix, self.seq)
    }

    /// Record the call, then fail it if a failure was queued for it
    fn enter(&mut self, call: GatewayCall) -> GatewayResult<()> {
        self.calls.push(call);
        if let Some(pos) = self.fail_next.iter().position(|c| *c == call) {
            self.fail_next.remove(pos);
            return Err(GatewayError::Transport(format!("injected {:?} failure", call)));
        }
        Ok(())
    }

    fn intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        self.intents.get(intent_id).cloned().ok_or_else(|| GatewayError::Api {
            status: 404,
            code: Some("resource_missing".to_string()),
            message: format!("No such payment_intent: '{}'", intent_id),
        })
    }

    fn insert_session(&mut self, intent: PaymentIntent, url: bool) -> CheckoutSession {
        let id = self.next_id("cs");
        let session = CheckoutSession {
            url: url.then(|| format!("https://checkout.mock/pay/{}", id)),
            id: id.clone(),
            status: Some("open".to_string()),
            payment_status: Some("unpaid".to_string()),
            customer_email: None,
            amount_total: Some(intent.amount),
            payment_intent_id: Some(intent.id.clone()),
            payment_intent: None,
            metadata: intent.metadata.clone(),
        };
        self.intents.insert(intent.id.clone(), intent);
        self.sessions.insert(id, session.clone());
        session
    }

    /// Session as retrieved: intent expanded, statuses derived from it
    fn view_session(&self, session_id: &str) -> GatewayResult<CheckoutSession> {
        let mut session = self.sessions.get(session_id).cloned().ok_or_else(|| GatewayError::Api {
            status: 404,
            code: Some("resource_missing".to_string()),
            message: format!("No such checkout.session: '{}'", session_id),
        })?;
        let intent = session.payment_intent_id.as_ref().and_then(|id| self.intents.get(id)).cloned();
        if let Some(intent) = intent {
            let (status, paid) = match intent.status {
                IntentStatus::Succeeded => ("complete", "paid"),
                IntentStatus::RequiresCapture | IntentStatus::Canceled => ("complete", "unpaid"),
                _ => ("open", "unpaid"),
            };
            session.status = Some(status.to_string());
            session.payment_status = Some(paid.to_string());
            session.payment_intent = Some(intent);
        }
        Ok(session)
    }

    fn new_intent(&mut self, amount: i64, status: IntentStatus, metadata: HashMap<String, String>) -> PaymentIntent {
        PaymentIntent {
            id: self.next_id("pi"),
            status,
            amount,
            amount_received: 0,
            latest_charge: None,
            metadata,
        }
    }

    fn settle(&mut self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let charge = self.next_id("ch");
        let intent = self.intents.get_mut(intent_id).ok_or_else(|| GatewayError::Api {
            status: 404,
            code: Some("resource_missing".to_string()),
            message: format!("No such payment_intent: '{}'", intent_id),
        })?;
        intent.status = IntentStatus::Succeeded;
        intent.amount_received = intent.amount;
        intent.latest_charge = Some(charge);
        Ok(intent.clone())
    }
}

/// Scripted stand-in for the card processor
#[derive(Default)]
pub struct MockGateway {
    state: AsyncMutex<GatewayState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next(&self, call: GatewayCall) {
        self.state.lock().await.fail_next.push(call);
    }

    pub async fn count(&self, call: GatewayCall) -> usize {
        self.state.lock().await.calls.iter().filter(|c| **c == call).count()
    }

    pub async fn set_capture_delay(&self, delay: Duration) {
        self.state.lock().await.capture_delay = Some(delay);
    }

    /// Settle the next capture, then report a transport timeout
    pub async fn lose_next_capture_response(&self) {
        self.state.lock().await.lost_captures += 1;
    }

    pub async fn session_requests(&self) -> Vec<CheckoutSessionRequest> {
        self.state.lock().await.session_requests.clone()
    }

    pub async fn transfer_requests(&self) -> Vec<TransferRequest> {
        self.state.lock().await.transfer_requests.clone()
    }

    pub async fn refund_keys(&self) -> Vec<String> {
        self.state.lock().await.refund_keys.clone()
    }

    pub async fn distinct_refunds(&self) -> usize {
        let state = self.state.lock().await;
        state.refunds.values().map(|r| r.id.as_str()).collect::<HashSet<_>>().len()
    }

    /// Capture out of band, as an automatic-capture checkout would
    pub async fn force_capture(&self, intent_id: &str) {
        let _ = self.state.lock().await.settle(intent_id);
    }

    /// Issue a refund without going through the orchestrator; returns its id
    pub async fn refund_directly(&self, intent_id: &str, idempotency_key: &str) -> String {
        let mut state = self.state.lock().await;
        let id = state.next_id("re");
        let amount = state.intents.get(intent_id).map_or(0, |pi| pi.amount_received);
        state
            .refunds
            .entry(idempotency_key.to_string())
            .or_insert(Refund { id, status: Some("succeeded".to_string()), amount })
            .id
            .clone()
    }

    /// A completed manual-capture session for `booking`
    pub async fn authorised_session(&self, booking: &Booking, amount: i64) -> CheckoutSession {
        let mut metadata = HashMap::new();
        metadata.insert("booking_id".to_string(), booking.id.to_string());
        metadata.insert("class_id".to_string(), booking.class_id.to_string());
        metadata.insert("user_id".to_string(), booking.user_id.to_string());

        let mut state = self.state.lock().await;
        let intent = state.new_intent(amount, IntentStatus::RequiresCapture, metadata);
        state.insert_session(intent, true)
    }

    /// A session owned by `owner` with no booking behind it
    pub async fn add_orphan_session(&self, owner: Uuid) -> String {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), owner.to_string());

        let mut state = self.state.lock().await;
        let intent = state.new_intent(5000, IntentStatus::RequiresCapture, metadata);
        state.insert_session(intent, true).id
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_checkout_session(&self, request: &CheckoutSessionRequest) -> GatewayResult<CheckoutSession> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::CreateCheckoutSession)?;
        state.session_requests.push(request.clone());

        let intent = state.new_intent(
            request.unit_amount * request.quantity,
            IntentStatus::RequiresPaymentMethod,
            request.metadata.clone(),
        );
        let mut session = state.insert_session(intent, true);
        session.customer_email = request.customer_email.clone();
        if let Some(stored) = state.sessions.get_mut(&session.id) {
            stored.customer_email = request.customer_email.clone();
        }
        Ok(session)
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> GatewayResult<CheckoutSession> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::RetrieveCheckoutSession)?;
        state.view_session(session_id)
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::RetrievePaymentIntent)?;
        state.intent(intent_id)
    }

    async fn capture_payment_intent(&self, intent_id: &str, _idempotency_key: &str) -> GatewayResult<PaymentIntent> {
        let delay = {
            let mut state = self.state.lock().await;
            state.enter(GatewayCall::Capture)?;
            state.capture_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let current = state.intent(intent_id)?;
        if current.status != IntentStatus::RequiresCapture {
            return Err(GatewayError::Api {
                status: 400,
                code: Some("payment_intent_unexpected_state".to_string()),
                message: format!("PaymentIntent is {}", current.status.as_str()),
            });
        }
        let settled = state.settle(intent_id)?;
        if state.lost_captures > 0 {
            state.lost_captures -= 1;
            return Err(GatewayError::Transport("timeout".to_string()));
        }
        Ok(settled)
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::Cancel)?;
        let mut intent = state.intent(intent_id)?;
        if !intent.status.is_cancelable() {
            return Err(GatewayError::Api {
                status: 400,
                code: Some("payment_intent_unexpected_state".to_string()),
                message: format!("Cannot cancel a PaymentIntent that is {}", intent.status.as_str()),
            });
        }
        intent.status = IntentStatus::Canceled;
        state.intents.insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }

    async fn create_refund(&self, intent_id: &str, idempotency_key: &str) -> GatewayResult<Refund> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::Refund)?;
        state.refund_keys.push(idempotency_key.to_string());

        if let Some(existing) = state.refunds.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let intent = state.intent(intent_id)?;
        let refund = Refund {
            id: state.next_id("re"),
            status: Some("succeeded".to_string()),
            amount: intent.amount_received,
        };
        state.refunds.insert(idempotency_key.to_string(), refund.clone());
        Ok(refund)
    }

    async fn create_transfer(&self, request: &TransferRequest) -> GatewayResult<Transfer> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::Transfer)?;
        state.transfer_requests.push(request.clone());

        if let Some(existing) = state.transfers.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        let transfer = Transfer {
            id: state.next_id("tr"),
            amount: request.amount,
            destination: request.destination.clone(),
        };
        state.transfers.insert(request.idempotency_key.clone(), transfer.clone());
        Ok(transfer)
    }

    async fn create_connected_account(&self, _request: &ConnectedAccountRequest) -> GatewayResult<ConnectedAccount> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::CreateAccount)?;
        let account = ConnectedAccount {
            id: state.next_id("acct"),
            charges_enabled: false,
            payouts_enabled: false,
            details_submitted: false,
        };
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(account)
    }

    async fn retrieve_connected_account(&self, account_id: &str) -> GatewayResult<ConnectedAccount> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::RetrieveAccount)?;
        state.accounts.get(account_id).cloned().ok_or_else(|| GatewayError::Api {
            status: 404,
            code: Some("resource_missing".to_string()),
            message: format!("No such account: '{}'", account_id),
        })
    }

    async fn create_account_link(&self, account_id: &str, _refresh_url: &str, _return_url: &str) -> GatewayResult<String> {
        let mut state = self.state.lock().await;
        state.enter(GatewayCall::AccountLink)?;
        Ok(format!("https://connect.mock/setup/{}", account_id))
    }
}

/// Keeps every submitted job for inspection
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn submit(&self, job: Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError("notifier lock poisoned".to_string()))?
            .push(job);
        Ok(())
    }
}

pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: BookingOrchestrator,
}

/// Orchestrator wired to fresh in-memory collaborators with default rules
pub fn fixture() -> Fixture {
    fixture_with(PaymentRules::with_app_url("https://herd.test"))
}

pub fn fixture_with(rules: PaymentRules) -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = BookingOrchestrator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        Arc::new(rules),
    );
    Fixture { store, gateway, notifier, orchestrator }
}
