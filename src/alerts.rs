use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::evaluator::Evaluator;
use crate::models::{Alert, AlertFilter, AlertInsert, AlertOutcome, AlertRecord, NewAlert, Patient, Sample};
use crate::store::AlertRepository;

/// Owns alert creation and the open -> resolved lifecycle.
#[derive(Clone)]
pub struct AlertStore {
    repo: Arc<dyn AlertRepository>,
    evaluator: Evaluator,
}

impl AlertStore {
    pub fn new(repo: Arc<dyn AlertRepository>, evaluator: Evaluator) -> Self {
        Self { repo, evaluator }
    }

    /// Evaluates a stored sample and creates its alert when critical.
    ///
    /// Keyed on the sample: repeated or concurrent calls for the same sample
    /// yield one `Created` and otherwise `AlreadyExists`.
    pub async fn create_if_critical(
        &self,
        sample: &Sample,
        patient: &Patient,
    ) -> Result<AlertOutcome, PipelineError> {
        if sample.patient_id != patient.id {
            return Err(PipelineError::Validation(format!(
                "sample {} belongs to patient {}, not {}",
                sample.id, sample.patient_id, patient.id
            )));
        }

        let verdict = self.evaluator.evaluate(sample.bpm);
        let Some(message) = verdict.alert_message(sample.bpm) else {
            tracing::debug!(
                sample_id = %sample.id,
                patient_id = %patient.id,
                bpm = sample.bpm,
                "heart rate not critical"
            );
            return Ok(AlertOutcome::NotCritical);
        };

        let insert = self
            .repo
            .insert_alert_if_absent(NewAlert {
                patient_id: patient.id,
                sample_id: sample.id,
                verdict,
                message,
            })
            .await?;

        match insert {
            AlertInsert::Created(alert) => {
                tracing::info!(
                    alert_id = %alert.id,
                    sample_id = %sample.id,
                    patient_id = %patient.id,
                    verdict = %verdict,
                    "created alert"
                );
                Ok(AlertOutcome::Created(alert))
            }
            AlertInsert::Existing(alert) => {
                tracing::debug!(alert_id = %alert.id, sample_id = %sample.id, "alert already exists");
                Ok(AlertOutcome::AlreadyExists(alert))
            }
        }
    }

    pub async fn resolve(&self, alert_id: Uuid, resolver: Uuid) -> Result<Alert, PipelineError> {
        let alert = self.repo.resolve_alert(alert_id, resolver, Utc::now()).await?;
        tracing::info!(alert_id = %alert.id, resolved_by = %resolver, "alert resolved");
        Ok(alert)
    }

    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, PipelineError> {
        self.repo.list_alerts(filter).await
    }
}
