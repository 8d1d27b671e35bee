use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{
    Alert, AlertFilter, AlertInsert, AlertRecord, FailedJob, NewAlert, NewJob, NotificationJob,
    Patient, Sample, StaffContact,
};

#[async_trait]
pub trait VitalsRepository: Send + Sync {
    async fn find_patient(&self, id: Uuid) -> Result<Option<Patient>, PipelineError>;

    /// Patient assigned to an active device, if any.
    async fn patient_for_device(&self, device_id: &str) -> Result<Option<Patient>, PipelineError>;

    /// Stores a sample with a server-assigned timestamp. The returned sample
    /// is committed.
    async fn insert_sample(&self, patient_id: Uuid, bpm: i32) -> Result<Sample, PipelineError>;

    async fn find_sample(&self, id: Uuid) -> Result<Option<Sample>, PipelineError>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Atomic insert-or-fetch keyed on `alert.sample_id`. Concurrent callers
    /// for the same sample observe exactly one `Created`.
    async fn insert_alert_if_absent(&self, alert: NewAlert) -> Result<AlertInsert, PipelineError>;

    /// Open -> resolved. `NotFound` for an unknown alert or resolver,
    /// `Conflict` when the alert is already resolved.
    async fn resolve_alert(
        &self,
        id: Uuid,
        resolver: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Alert, PipelineError>;

    async fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), PipelineError>;

    async fn undispatched_alerts(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Alert>, PipelineError>;

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, PipelineError>;
}

#[async_trait]
pub trait StaffDirectory: Send + Sync {
    async fn list_staff_for_place(
        &self,
        place_id: Uuid,
        roles: &[String],
    ) -> Result<Vec<StaffContact>, PipelineError>;

    async fn find_staff_by_email(&self, email: &str) -> Result<Option<StaffContact>, PipelineError>;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns false when a job for the same (alert, recipient) already exists.
    async fn enqueue(&self, job: NewJob) -> Result<bool, PipelineError>;

    /// Claims due jobs plus jobs whose claim is older than `stale_after`,
    /// incrementing their attempt count.
    async fn claim_due(
        &self,
        limit: i64,
        stale_after: Duration,
    ) -> Result<Vec<NotificationJob>, PipelineError>;

    async fn complete(&self, job_id: Uuid) -> Result<(), PipelineError>;

    async fn retry_later(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PipelineError>;

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), PipelineError>;

    async fn list_failed(&self, limit: i64) -> Result<Vec<FailedJob>, PipelineError>;
}
