use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use crate::booking::ParseStatusError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationReason {
    /// The gateway captured, then the ledger write failed
    CaptureSucceededLedgerFailed,
    /// A capture sat in CAPTURE_IN_PROGRESS past the stall threshold
    CaptureStalled,
}

impl ReconciliationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationReason::CaptureSucceededLedgerFailed => "CAPTURE_SUCCEEDED_LEDGER_FAILED",
            ReconciliationReason::CaptureStalled => "CAPTURE_STALLED",
        }
    }
}

impl FromStr for ReconciliationReason {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CAPTURE_SUCCEEDED_LEDGER_FAILED" => Ok(ReconciliationReason::CaptureSucceededLedgerFailed),
            "CAPTURE_STALLED" => Ok(ReconciliationReason::CaptureStalled),
            other => Err(ParseStatusError { kind: "reconciliation reason", value: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Open,
    Resolved,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Open => "OPEN",
            ReconciliationStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for ReconciliationStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(ReconciliationStatus::Open),
            "RESOLVED" => Ok(ReconciliationStatus::Resolved),
            other => Err(ParseStatusError { kind: "reconciliation status", value: other.to_string() }),
        }
    }
}

/// Durable marker that the gateway and the ledger disagree about a booking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub reason: ReconciliationReason,
    pub status: ReconciliationStatus,
    pub details: serde_json::Value,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReconciliationRecord {
    pub fn open(booking_id: Uuid, reason: ReconciliationReason, details: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            payment_intent_id: None,
            charge_id: None,
            reason,
            status: ReconciliationStatus::Open,
            details,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn with_gateway_ids(mut self, payment_intent_id: Option<String>, charge_id: Option<String>) -> Self {
        self.payment_intent_id = payment_intent_id;
        self.charge_id = charge_id;
        self
    }
}
