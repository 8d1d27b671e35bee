use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluator::Verdict;

#[derive(Debug, Clone)]
pub struct Patient {
    pub id: Uuid,
    pub place_id: Uuid,
    pub name: String,
}

/// A staff member reachable by email, as returned by the directory lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffContact {
    pub id: Uuid,
    pub email: String,
}

/// One heart-rate measurement. Immutable once stored.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub bpm: i32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub sample_id: Uuid,
    pub verdict: Verdict,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub patient_id: Uuid,
    pub sample_id: Uuid,
    pub verdict: Verdict,
    pub message: String,
}

/// Result of a conditional alert insert keyed on the sample.
#[derive(Debug, Clone)]
pub enum AlertInsert {
    Created(Alert),
    Existing(Alert),
}

/// What evaluating one sample did to the alert store.
#[derive(Debug, Clone)]
pub enum AlertOutcome {
    NotCritical,
    Created(Alert),
    AlreadyExists(Alert),
}

impl AlertOutcome {
    /// The alert, only when this evaluation created it.
    pub fn created(&self) -> Option<&Alert> {
        match self {
            AlertOutcome::Created(alert) => Some(alert),
            _ => None,
        }
    }
}

/// Alert joined with the patient and place it belongs to, for listings.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub alert: Alert,
    pub patient_name: String,
    pub place_name: String,
    pub bpm: i32,
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub patient_id: Option<Uuid>,
    pub place_id: Option<Uuid>,
    pub resolved: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub resolved_since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Payload of one critical-alert email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEmail {
    pub patient_name: String,
    pub patient_id: Uuid,
    pub bpm: i32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub alert_id: Uuid,
    pub recipient: String,
    pub payload: AlertEmail,
}

/// A claimed delivery job. `attempts` already counts the current attempt.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub recipient: String,
    pub payload: AlertEmail,
    pub attempts: i32,
}

#[derive(Debug, Clone)]
pub struct FailedJob {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub recipient: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
