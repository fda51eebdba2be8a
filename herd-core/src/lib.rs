pub mod booking;
pub mod config;
pub mod fees;
pub mod notification;
pub mod payment;
pub mod reconciliation;
pub mod repository;
pub mod transition;

pub use booking::{Booking, BookingHold, CaptureStatus, ClassListing, HoldStatus, LifecycleStatus, PaymentStatus};
pub use config::PaymentRules;
pub use fees::FeeSplit;
pub use notification::{Notification, NotificationSink, NotifyError};
pub use payment::{GatewayError, GatewayResult, PaymentGateway};
pub use reconciliation::{ReconciliationReason, ReconciliationRecord, ReconciliationStatus};
pub use repository::{BookingLedger, ClassCatalog, LedgerError, LedgerResult, ReconciliationQueue};
pub use transition::{BookingPatch, CaptureTransition, TransitionGuard};
