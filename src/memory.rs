//! In-memory stand-ins for Postgres, Redis and the mail relay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{DeliveryError, PipelineError};
use crate::evaluator::Evaluator;
use crate::mailer::{Mailer, OutboundEmail};
use crate::models::{
    Alert, AlertEmail, AlertFilter, AlertInsert, AlertRecord, FailedJob, NewAlert, NewJob,
    NotificationJob, Patient, Sample, StaffContact,
};
use crate::otp::{ExpiringStore, OtpError};
use crate::store::{AlertRepository, StaffDirectory, TaskQueue, VitalsRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Sent,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub recipient: String,
    pub payload: AlertEmail,
    pub status: JobStatus,
    pub attempts: i32,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

struct StaffRow {
    contact: StaffContact,
    role: String,
    place_id: Uuid,
}

#[derive(Default)]
struct Tables {
    places: HashMap<Uuid, String>,
    patients: HashMap<Uuid, Patient>,
    devices: HashMap<String, Uuid>,
    staff: Vec<StaffRow>,
    samples: HashMap<Uuid, Sample>,
    alerts: HashMap<Uuid, Alert>,
    alert_by_sample: HashMap<Uuid, Uuid>,
    jobs: Vec<JobRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    enqueue_failing: AtomicBool,
    claim_failures: AtomicUsize,
    updates_failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a patient at a fresh place.
    pub fn add_patient(&self, name: &str) -> (Patient, Uuid) {
        let mut tables = self.tables.lock().unwrap();
        let place_id = Uuid::new_v4();
        tables.places.insert(place_id, format!("{name}'s ward"));
        let patient = Patient {
            id: Uuid::new_v4(),
            place_id,
            name: name.to_string(),
        };
        tables.patients.insert(patient.id, patient.clone());
        (patient, place_id)
    }

    pub fn add_staff(&self, place_id: Uuid, role: &str, email: &str) -> StaffContact {
        let contact = StaffContact {
            id: Uuid::new_v4(),
            email: email.to_string(),
        };
        self.tables.lock().unwrap().staff.push(StaffRow {
            contact: contact.clone(),
            role: role.to_string(),
            place_id,
        });
        contact
    }

    pub fn assign_device(&self, device_id: &str, patient_id: Uuid) {
        self.tables
            .lock()
            .unwrap()
            .devices
            .insert(device_id.to_string(), patient_id);
    }

    pub fn add_sample(&self, patient_id: Uuid, bpm: i32) -> Sample {
        let sample = Sample {
            id: Uuid::new_v4(),
            patient_id,
            bpm,
            recorded_at: Utc::now(),
        };
        self.tables
            .lock()
            .unwrap()
            .samples
            .insert(sample.id, sample.clone());
        sample
    }

    /// Inserts an undispatched alert as if created a second ago.
    pub fn add_alert(&self, sample: &Sample) -> Alert {
        let verdict = Evaluator::default().evaluate(sample.bpm);
        let alert = Alert {
            id: Uuid::new_v4(),
            patient_id: sample.patient_id,
            sample_id: sample.id,
            verdict,
            message: verdict.alert_message(sample.bpm).unwrap_or_default(),
            created_at: Utc::now() - chrono::Duration::seconds(1),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            dispatched_at: None,
        };
        let mut tables = self.tables.lock().unwrap();
        tables.alert_by_sample.insert(sample.id, alert.id);
        tables.alerts.insert(alert.id, alert.clone());
        alert
    }

    pub fn set_enqueue_failing(&self, failing: bool) {
        self.enqueue_failing.store(failing, Ordering::SeqCst);
    }

    /// The next `times` claims fail as if the connection dropped.
    pub fn fail_next_claims(&self, times: usize) {
        self.claim_failures.store(times, Ordering::SeqCst);
    }

    /// Job status writes (complete, retry, fail) error while set.
    pub fn set_updates_failing(&self, failing: bool) {
        self.updates_failing.store(failing, Ordering::SeqCst);
    }

    /// Leaves a job claimed by a worker that went away `locked_for` ago.
    pub fn strand_job(&self, job_id: Uuid, attempts: i32, locked_for: chrono::Duration) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(job) = tables.jobs.iter_mut().find(|job| job.id == job_id) {
            job.status = JobStatus::Running;
            job.attempts = attempts;
            job.locked_at = Some(Utc::now() - locked_for);
        }
    }

    pub fn alert(&self, id: Uuid) -> Option<Alert> {
        self.tables.lock().unwrap().alerts.get(&id).cloned()
    }

    pub fn alert_count(&self) -> usize {
        self.tables.lock().unwrap().alerts.len()
    }

    pub fn sample_count(&self) -> usize {
        self.tables.lock().unwrap().samples.len()
    }

    pub fn job_count(&self) -> usize {
        self.tables.lock().unwrap().jobs.len()
    }

    pub fn jobs_for(&self, alert_id: Uuid) -> Vec<JobRow> {
        self.tables
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|job| job.alert_id == alert_id)
            .cloned()
            .collect()
    }

    pub fn job_recipients(&self, alert_id: Uuid) -> Vec<String> {
        self.jobs_for(alert_id)
            .into_iter()
            .map(|job| job.recipient)
            .collect()
    }
}

#[async_trait]
impl VitalsRepository for MemoryStore {
    async fn find_patient(&self, id: Uuid) -> Result<Option<Patient>, PipelineError> {
        Ok(self.tables.lock().unwrap().patients.get(&id).cloned())
    }

    async fn patient_for_device(&self, device_id: &str) -> Result<Option<Patient>, PipelineError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .devices
            .get(device_id)
            .and_then(|patient_id| tables.patients.get(patient_id))
            .cloned())
    }

    async fn insert_sample(&self, patient_id: Uuid, bpm: i32) -> Result<Sample, PipelineError> {
        if !self.tables.lock().unwrap().patients.contains_key(&patient_id) {
            return Err(PipelineError::not_found("patient", patient_id));
        }
        Ok(self.add_sample(patient_id, bpm))
    }

    async fn find_sample(&self, id: Uuid) -> Result<Option<Sample>, PipelineError> {
        Ok(self.tables.lock().unwrap().samples.get(&id).cloned())
    }
}

#[async_trait]
impl AlertRepository for MemoryStore {
    async fn insert_alert_if_absent(&self, alert: NewAlert) -> Result<AlertInsert, PipelineError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(existing) = tables.alert_by_sample.get(&alert.sample_id) {
            return Ok(AlertInsert::Existing(tables.alerts[existing].clone()));
        }

        let created = Alert {
            id: Uuid::new_v4(),
            patient_id: alert.patient_id,
            sample_id: alert.sample_id,
            verdict: alert.verdict,
            message: alert.message,
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            dispatched_at: None,
        };
        tables.alert_by_sample.insert(created.sample_id, created.id);
        tables.alerts.insert(created.id, created.clone());
        Ok(AlertInsert::Created(created))
    }

    async fn resolve_alert(
        &self,
        id: Uuid,
        resolver: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Alert, PipelineError> {
        let mut tables = self.tables.lock().unwrap();
        let known_resolver = tables.staff.iter().any(|row| row.contact.id == resolver);
        let alert = tables
            .alerts
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("alert", id))?;
        if alert.resolved {
            return Err(PipelineError::Conflict(format!("alert {id} is already resolved")));
        }
        if !known_resolver {
            return Err(PipelineError::not_found("staff member", resolver));
        }
        alert.resolved = true;
        alert.resolved_at = Some(at);
        alert.resolved_by = Some(resolver);
        Ok(alert.clone())
    }

    async fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), PipelineError> {
        if let Some(alert) = self.tables.lock().unwrap().alerts.get_mut(&id) {
            alert.dispatched_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn undispatched_alerts(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Alert>, PipelineError> {
        let tables = self.tables.lock().unwrap();
        let mut pending: Vec<Alert> = tables
            .alerts
            .values()
            .filter(|alert| alert.dispatched_at.is_none() && alert.created_at < created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|alert| alert.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, PipelineError> {
        let tables = self.tables.lock().unwrap();
        let mut records: Vec<AlertRecord> = tables
            .alerts
            .values()
            .filter_map(|alert| {
                let patient = tables.patients.get(&alert.patient_id)?;
                let sample = tables.samples.get(&alert.sample_id)?;
                let keep = filter.patient_id.map_or(true, |id| id == alert.patient_id)
                    && filter.place_id.map_or(true, |id| id == patient.place_id)
                    && filter.resolved.map_or(true, |resolved| resolved == alert.resolved)
                    && filter.since.map_or(true, |since| alert.created_at >= since)
                    && filter
                        .resolved_since
                        .map_or(true, |since| alert.resolved_at.map_or(false, |at| at >= since));
                keep.then(|| AlertRecord {
                    alert: alert.clone(),
                    patient_name: patient.name.clone(),
                    place_name: tables.places.get(&patient.place_id).cloned().unwrap_or_default(),
                    bpm: sample.bpm,
                })
            })
            .collect();
        records.sort_by(|a, b| b.alert.created_at.cmp(&a.alert.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit.max(0) as usize);
        }
        Ok(records)
    }
}

#[async_trait]
impl StaffDirectory for MemoryStore {
    async fn list_staff_for_place(
        &self,
        place_id: Uuid,
        roles: &[String],
    ) -> Result<Vec<StaffContact>, PipelineError> {
        let tables = self.tables.lock().unwrap();
        let mut staff: Vec<StaffContact> = tables
            .staff
            .iter()
            .filter(|row| row.place_id == place_id && roles.contains(&row.role))
            .map(|row| row.contact.clone())
            .collect();
        staff.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(staff)
    }

    async fn find_staff_by_email(&self, email: &str) -> Result<Option<StaffContact>, PipelineError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .staff
            .iter()
            .find(|row| row.contact.email.eq_ignore_ascii_case(email))
            .map(|row| row.contact.clone()))
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<bool, PipelineError> {
        if self.enqueue_failing.load(Ordering::SeqCst) {
            return Err(PipelineError::Queue("queue unavailable".to_string()));
        }
        let mut tables = self.tables.lock().unwrap();
        let exists = tables
            .jobs
            .iter()
            .any(|row| row.alert_id == job.alert_id && row.recipient == job.recipient);
        if exists {
            return Ok(false);
        }
        let now = Utc::now();
        tables.jobs.push(JobRow {
            id: Uuid::new_v4(),
            alert_id: job.alert_id,
            recipient: job.recipient,
            payload: job.payload,
            status: JobStatus::Pending,
            attempts: 0,
            run_at: now,
            locked_at: None,
            last_error: None,
            updated_at: now,
        });
        Ok(true)
    }

    async fn claim_due(
        &self,
        limit: i64,
        stale_after: Duration,
    ) -> Result<Vec<NotificationJob>, PipelineError> {
        let fail_claim = self
            .claim_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail_claim {
            return Err(PipelineError::Queue("connection reset".to_string()));
        }
        let now = Utc::now();
        let stale_before = now - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tables = self.tables.lock().unwrap();

        let mut due: Vec<usize> = tables
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| match job.status {
                JobStatus::Pending => job.run_at <= now,
                JobStatus::Running => job.locked_at.map_or(false, |at| at < stale_before),
                _ => false,
            })
            .map(|(index, _)| index)
            .collect();
        due.sort_by_key(|&index| tables.jobs[index].run_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for index in due {
            let job = &mut tables.jobs[index];
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.locked_at = Some(now);
            job.updated_at = now;
            claimed.push(NotificationJob {
                id: job.id,
                alert_id: job.alert_id,
                recipient: job.recipient.clone(),
                payload: job.payload.clone(),
                attempts: job.attempts,
            });
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), PipelineError> {
        self.update_job(job_id, |job| {
            job.status = JobStatus::Sent;
            job.locked_at = None;
            job.last_error = None;
        })
    }

    async fn retry_later(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PipelineError> {
        self.update_job(job_id, |job| {
            job.status = JobStatus::Pending;
            job.run_at = run_at;
            job.locked_at = None;
            job.last_error = Some(error.to_string());
        })
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), PipelineError> {
        self.update_job(job_id, |job| {
            job.status = JobStatus::Failed;
            job.locked_at = None;
            job.last_error = Some(error.to_string());
        })
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<FailedJob>, PipelineError> {
        let tables = self.tables.lock().unwrap();
        let mut failed: Vec<FailedJob> = tables
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .map(|job| FailedJob {
                id: job.id,
                alert_id: job.alert_id,
                recipient: job.recipient.clone(),
                attempts: job.attempts,
                last_error: job.last_error.clone(),
                updated_at: job.updated_at,
            })
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }
}

impl MemoryStore {
    fn update_job(&self, job_id: Uuid, apply: impl FnOnce(&mut JobRow)) -> Result<(), PipelineError> {
        if self.updates_failing.load(Ordering::SeqCst) {
            return Err(PipelineError::Queue("connection reset".to_string()));
        }
        let mut tables = self.tables.lock().unwrap();
        if let Some(job) = tables.jobs.iter_mut().find(|job| job.id == job_id) {
            apply(job);
            job.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// Expiring map driven by tokio's clock, so tests can pause and advance it.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

#[async_trait]
impl ExpiringStore for MemoryKv {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), OtpError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, OtpError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), OtpError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

enum Behaviour {
    FailAlways,
    FailTimes(usize),
    Hang,
}

/// Records successful sends; misbehaves per recipient on request.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    behaviour: Mutex<HashMap<String, Behaviour>>,
}

impl RecordingMailer {
    pub fn fail_always(&self, recipient: &str) {
        self.set(recipient, Behaviour::FailAlways);
    }

    pub fn fail_times(&self, recipient: &str, times: usize) {
        self.set(recipient, Behaviour::FailTimes(times));
    }

    pub fn hang(&self, recipient: &str) {
        self.set(recipient, Behaviour::Hang);
    }

    fn set(&self, recipient: &str, behaviour: Behaviour) {
        self.behaviour
            .lock()
            .unwrap()
            .insert(recipient.to_string(), behaviour);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent().into_iter().map(|email| email.to).collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DeliveryError> {
        let hang = {
            let mut behaviour = self.behaviour.lock().unwrap();
            match behaviour.get_mut(&email.to) {
                Some(Behaviour::FailAlways) => {
                    return Err(DeliveryError::Transport("connection refused".to_string()))
                }
                Some(Behaviour::FailTimes(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(DeliveryError::Transport("connection reset".to_string()));
                }
                Some(Behaviour::Hang) => true,
                _ => false,
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}
