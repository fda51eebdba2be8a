pub mod error;
pub mod orchestrator;
pub mod checkout;
pub mod approve;
pub mod deny;
pub mod confirm;
pub mod expiry;
pub mod reconcile;
pub mod payout;
pub mod webhook;
pub mod connect;
pub mod mock;

pub use error::{BookingError, BookingResult};
pub use orchestrator::BookingOrchestrator;
pub use checkout::{CheckoutOutcome, CheckoutRequest};
pub use approve::ApproveOutcome;
pub use deny::DenyOutcome;
pub use confirm::{ConfirmationView, SessionSummary};
pub use expiry::PendingSweepSummary;
pub use reconcile::ReconcileSummary;
pub use payout::PayoutSummary;
pub use webhook::WebhookOutcome;
pub use connect::ConnectOutcome;
