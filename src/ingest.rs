use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::alerts::AlertStore;
use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::models::{AlertOutcome, Patient, Sample};
use crate::store::VitalsRepository;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub sample: Sample,
    pub outcome: AlertOutcome,
    /// Delivery jobs queued for a newly created alert.
    pub notifications: usize,
}

pub struct Ingestor {
    vitals: Arc<dyn VitalsRepository>,
    alerts: AlertStore,
    dispatcher: Dispatcher,
}

impl Ingestor {
    pub fn new(vitals: Arc<dyn VitalsRepository>, alerts: AlertStore, dispatcher: Dispatcher) -> Self {
        Self {
            vitals,
            alerts,
            dispatcher,
        }
    }

    /// Stores a heart-rate sample and evaluates it. Returns once the alert
    /// (if any) is committed and its delivery jobs are queued.
    pub async fn record(&self, patient_id: Uuid, bpm: i64) -> Result<Recorded, PipelineError> {
        let bpm = validate_bpm(bpm)?;
        let patient = self
            .vitals
            .find_patient(patient_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("patient", patient_id))?;
        self.store_and_evaluate(patient, bpm).await
    }

    pub async fn record_from_device(&self, device_id: &str, bpm: i64) -> Result<Recorded, PipelineError> {
        let bpm = validate_bpm(bpm)?;
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(PipelineError::Validation("device id must not be empty".to_string()));
        }
        let patient = self
            .vitals
            .patient_for_device(device_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("assigned device", device_id))?;
        self.store_and_evaluate(patient, bpm).await
    }

    /// Runs alert evaluation again for an already stored sample, as a
    /// redelivered ingestion would.
    pub async fn reevaluate(&self, sample_id: Uuid) -> Result<Recorded, PipelineError> {
        let sample = self
            .vitals
            .find_sample(sample_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("sample", sample_id))?;
        let patient = self
            .vitals
            .find_patient(sample.patient_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("patient", sample.patient_id))?;
        self.evaluate(sample, patient).await
    }

    async fn store_and_evaluate(&self, patient: Patient, bpm: i32) -> Result<Recorded, PipelineError> {
        let sample = self.vitals.insert_sample(patient.id, bpm).await?;
        tracing::debug!(sample_id = %sample.id, patient_id = %patient.id, bpm, "sample stored");
        self.evaluate(sample, patient).await
    }

    async fn evaluate(&self, sample: Sample, patient: Patient) -> Result<Recorded, PipelineError> {
        let outcome = self.alerts.create_if_critical(&sample, &patient).await?;

        let mut notifications = 0;
        if let Some(alert) = outcome.created() {
            // The alert stays undispatched on failure and the worker sweep
            // picks it up again.
            match self.dispatcher.dispatch(alert, &patient, &sample).await {
                Ok(queued) => notifications = queued,
                Err(err) => tracing::warn!(
                    alert_id = %alert.id,
                    error = %err,
                    "failed to queue alert notifications"
                ),
            }
        }

        Ok(Recorded {
            sample,
            outcome,
            notifications,
        })
    }
}

pub fn validate_bpm(bpm: i64) -> Result<i32, PipelineError> {
    if bpm <= 0 {
        return Err(PipelineError::Validation(format!(
            "bpm must be a positive integer, got {bpm}"
        )));
    }
    i32::try_from(bpm)
        .map_err(|_| PipelineError::Validation(format!("bpm {bpm} is out of range")))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub alerted: usize,
    pub rejected: usize,
}

#[derive(serde::Deserialize)]
struct CsvRow {
    patient_id: Option<Uuid>,
    device_id: Option<String>,
    bpm: i64,
}

/// Records every row of a `patient_id,bpm` (or `device_id,bpm`) CSV through
/// the ingestion path. Rejected rows are logged and skipped.
pub async fn import_csv(ingestor: &Ingestor, csv_path: &Path) -> anyhow::Result<ImportSummary> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut summary = ImportSummary::default();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = match result {
            Ok(row) => row,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                tracing::warn!(line, error = %err, "skipping malformed csv row");
                summary.rejected += 1;
                continue;
            }
        };

        let recorded = match (row.patient_id, row.device_id.as_deref()) {
            (Some(patient_id), _) => ingestor.record(patient_id, row.bpm).await,
            (None, Some(device_id)) => ingestor.record_from_device(device_id, row.bpm).await,
            (None, None) => Err(PipelineError::Validation(
                "row needs a patient_id or device_id".to_string(),
            )),
        };

        match recorded {
            Ok(recorded) => {
                summary.inserted += 1;
                if recorded.outcome.created().is_some() {
                    summary.alerted += 1;
                }
            }
            Err(err @ (PipelineError::Validation(_) | PipelineError::NotFound { .. })) => {
                tracing::warn!(line, error = %err, "skipping csv row");
                summary.rejected += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(summary)
}
