use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One email job. Rendering happens downstream of the sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    HostBookingConfirmed {
        booking_id: Uuid,
        host_id: Uuid,
        class_id: Uuid,
    },
    GuestBookingConfirmed {
        booking_id: Uuid,
        guest_id: Uuid,
        class_id: Uuid,
    },
    GuestBookingDenied {
        booking_id: Uuid,
        guest_id: Uuid,
        class_id: Uuid,
        message: Option<String>,
    },
    GuestBookingExpired {
        booking_id: Uuid,
        guest_id: Uuid,
        class_id: Uuid,
    },
    HostPayoutSummary {
        host_id: Uuid,
        class_id: Uuid,
        class_title: String,
        bookings_paid: u32,
        total_payout: i64,
        currency: String,
    },
}

impl Notification {
    /// User the job is addressed to; used as the partition key
    pub fn recipient(&self) -> Uuid {
        match self {
            Notification::HostBookingConfirmed { host_id, .. }
            | Notification::HostPayoutSummary { host_id, .. } => *host_id,
            Notification::GuestBookingConfirmed { guest_id, .. }
            | Notification::GuestBookingDenied { guest_id, .. }
            | Notification::GuestBookingExpired { guest_id, .. } => *guest_id,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("notification not enqueued: {0}")]
pub struct NotifyError(pub String);

/// Fire-and-forget outbox for email jobs
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn submit(&self, job: Notification) -> Result<(), NotifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_is_tagged_by_type() {
        let host = Uuid::new_v4();
        let job = Notification::HostPayoutSummary {
            host_id: host,
            class_id: Uuid::new_v4(),
            class_title: "Sourdough".to_string(),
            bookings_paid: 3,
            total_payout: 30000,
            currency: "usd".to_string(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "host_payout_summary");
        assert_eq!(job.recipient(), host);
    }
}
