use std::sync::Arc;
use uuid::Uuid;
use tracing::{info, warn};
use herd_core::{
    Booking, BookingLedger, BookingPatch, ClassCatalog, ClassListing, Notification, NotificationSink,
    PaymentGateway, PaymentRules, ReconciliationQueue, TransitionGuard,
};
use crate::error::{BookingError, BookingResult};

/// Coordinates the booking payment lifecycle between the ledger and the gateway.
///
/// Holds no per-booking state: every operation reads the ledger, talks to the
/// gateway, and writes back through guarded transitions, so any number of
/// orchestrators (processes, handler invocations) can run side by side.
#[derive(Clone)]
pub struct BookingOrchestrator {
    pub(crate) ledger: Arc<dyn BookingLedger>,
    pub(crate) catalog: Arc<dyn ClassCatalog>,
    pub(crate) reconciliations: Arc<dyn ReconciliationQueue>,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) notifier: Arc<dyn NotificationSink>,
    pub(crate) rules: Arc<PaymentRules>,
}

impl BookingOrchestrator {
    pub fn new(
        ledger: Arc<dyn BookingLedger>,
        catalog: Arc<dyn ClassCatalog>,
        reconciliations: Arc<dyn ReconciliationQueue>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSink>,
        rules: Arc<PaymentRules>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            reconciliations,
            gateway,
            notifier,
            rules,
        }
    }

    pub fn rules(&self) -> &PaymentRules {
        &self.rules
    }

    pub(crate) async fn load_booking(&self, booking_id: Uuid) -> BookingResult<Booking> {
        self.ledger
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::NotFound("Booking not found".to_string()))
    }

    pub(crate) async fn load_class(&self, class_id: Uuid) -> BookingResult<ClassListing> {
        self.catalog
            .get_class(class_id)
            .await?
            .ok_or_else(|| BookingError::NotFound("Class not found".to_string()))
    }

    /// Load a booking and its class, refusing anyone but the class host
    pub(crate) async fn load_for_host(&self, booking_id: Uuid, caller: Uuid) -> BookingResult<(Booking, ClassListing)> {
        let booking = self.load_booking(booking_id).await?;
        let class = self.load_class(booking.class_id).await?;

        if class.host_id != caller {
            warn!(booking_id = %booking_id, caller = %caller, "Host check failed");
            return Err(BookingError::Forbidden("Only the class host can manage this booking".to_string()));
        }

        Ok((booking, class))
    }

    /// Payment intent id for a booking, backfilled from its checkout session
    /// for rows created before the intent id was tracked.
    pub(crate) async fn resolve_payment_intent(&self, booking: &Booking) -> BookingResult<Option<String>> {
        if let Some(id) = &booking.payment_intent_id {
            return Ok(Some(id.clone()));
        }

        let Some(session_id) = &booking.checkout_session_id else {
            return Ok(None);
        };

        let session = self.gateway.retrieve_checkout_session(session_id).await?;
        let Some(intent_id) = session.payment_intent_id else {
            return Ok(None);
        };

        let patch = BookingPatch {
            payment_intent_id: Some(intent_id.clone()),
            ..BookingPatch::default()
        };
        if let Err(e) = self.ledger.transition(booking.id, &TransitionGuard::any(), &patch).await {
            // The id is re-derivable from the session next time
            warn!(booking_id = %booking.id, "Failed to backfill payment intent id: {}", e);
        } else {
            info!(booking_id = %booking.id, intent = %intent_id, "Backfilled payment intent id");
        }

        Ok(Some(intent_id))
    }

    /// Enqueue email jobs; failures are logged and swallowed
    pub(crate) async fn notify_all(&self, jobs: Vec<Notification>) {
        for job in jobs {
            if let Err(e) = self.notifier.submit(job).await {
                warn!("Notification dropped: {}", e);
            }
        }
    }
}
