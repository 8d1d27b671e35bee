use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::PipelineError;
use crate::models::{Alert, AlertEmail, NewJob, Patient, Sample};
use crate::store::{AlertRepository, StaffDirectory, TaskQueue, VitalsRepository};

const SWEEP_BATCH: i64 = 100;

/// Turns a newly created alert into one queued delivery job per recipient.
/// Delivery itself happens in the worker.
#[derive(Clone)]
pub struct Dispatcher {
    vitals: Arc<dyn VitalsRepository>,
    alerts: Arc<dyn AlertRepository>,
    directory: Arc<dyn StaffDirectory>,
    queue: Arc<dyn TaskQueue>,
    roles: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        vitals: Arc<dyn VitalsRepository>,
        alerts: Arc<dyn AlertRepository>,
        directory: Arc<dyn StaffDirectory>,
        queue: Arc<dyn TaskQueue>,
        roles: Vec<String>,
    ) -> Self {
        Self {
            vitals,
            alerts,
            directory,
            queue,
            roles,
        }
    }

    /// Enqueues the alert for every staff member of the patient's place and
    /// stamps it dispatched. Returns how many jobs were newly queued.
    pub async fn dispatch(
        &self,
        alert: &Alert,
        patient: &Patient,
        sample: &Sample,
    ) -> Result<usize, PipelineError> {
        let staff = self
            .directory
            .list_staff_for_place(patient.place_id, &self.roles)
            .await?;

        let payload = AlertEmail {
            patient_name: patient.name.clone(),
            patient_id: patient.id,
            bpm: sample.bpm,
            recorded_at: sample.recorded_at,
        };

        let mut seen = HashSet::new();
        let mut enqueued = 0;
        for contact in staff {
            let Some(recipient) = usable_address(&contact.email) else {
                tracing::debug!(staff_id = %contact.id, "skipping staff member without usable email");
                continue;
            };
            if !seen.insert(recipient.to_ascii_lowercase()) {
                continue;
            }

            let queued = self
                .queue
                .enqueue(NewJob {
                    alert_id: alert.id,
                    recipient: recipient.clone(),
                    payload: payload.clone(),
                })
                .await?;
            if queued {
                enqueued += 1;
            }
        }

        self.alerts.mark_dispatched(alert.id, Utc::now()).await?;
        tracing::info!(
            alert_id = %alert.id,
            place_id = %patient.place_id,
            recipients = enqueued,
            "alert dispatched"
        );
        Ok(enqueued)
    }

    /// Dispatches alerts that were committed but never stamped dispatched,
    /// e.g. after a crash between alert creation and enqueue.
    pub async fn redispatch_pending(&self, older_than: Duration) -> Result<usize, PipelineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|err| PipelineError::Validation(err.to_string()))?;
        let pending = self.alerts.undispatched_alerts(cutoff, SWEEP_BATCH).await?;

        let mut redispatched = 0;
        for alert in pending {
            let patient = self.vitals.find_patient(alert.patient_id).await?;
            let sample = self.vitals.find_sample(alert.sample_id).await?;
            let (Some(patient), Some(sample)) = (patient, sample) else {
                tracing::warn!(alert_id = %alert.id, "alert lost its patient or sample, skipping");
                continue;
            };

            tracing::warn!(alert_id = %alert.id, "redispatching undispatched alert");
            self.dispatch(&alert, &patient, &sample).await?;
            redispatched += 1;
        }
        Ok(redispatched)
    }
}

fn usable_address(email: &str) -> Option<String> {
    let email = email.trim();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || email.contains(char::is_whitespace) {
        return None;
    }
    Some(email.to_string())
}
