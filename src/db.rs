use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::evaluator::Verdict;
use crate::models::{
    Alert, AlertEmail, AlertFilter, AlertInsert, AlertRecord, FailedJob, NewAlert, NewJob,
    NotificationJob, Patient, Sample, StaffContact,
};
use crate::store::{AlertRepository, StaffDirectory, TaskQueue, VitalsRepository};

const ALERT_COLUMNS: &str = "id, patient_id, sample_id, verdict, message, created_at, \
                             resolved, resolved_at, resolved_by, dispatched_at";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Seeded {
    pub place_id: Uuid,
    pub patient_id: Uuid,
    pub device_id: String,
    pub staff: Vec<(String, Uuid)>,
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<Seeded> {
    let place_id = Uuid::parse_str("6f1c2b7e-1d2a-4c55-9d1e-2f7b8a3c4d10")?;
    sqlx::query(
        r#"
        INSERT INTO places (id, name, address, phone, email)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET name = EXCLUDED.name, address = EXCLUDED.address
        "#,
    )
    .bind(place_id)
    .bind("Riverside Maternity Clinic")
    .bind("12 Riverside Road")
    .bind("5550100")
    .bind("front-desk@riverside.example")
    .execute(pool)
    .await?;

    let staff_rows = vec![
        (
            Uuid::parse_str("a3e8c1f2-5b6d-4e7f-8a9b-0c1d2e3f4a51")?,
            "priya.nair@riverside.example",
            "Priya",
            "Nair",
            "DOCTOR",
        ),
        (
            Uuid::parse_str("b4f9d2a3-6c7e-4f80-9bac-1d2e3f4a5b62")?,
            "tomas.ortega@riverside.example",
            "Tomas",
            "Ortega",
            "DOCTOR",
        ),
        (
            Uuid::parse_str("c5a0e3b4-7d8f-4091-acbd-2e3f4a5b6c73")?,
            "hana.kim@riverside.example",
            "Hana",
            "Kim",
            "NURSE",
        ),
    ];

    let mut staff = Vec::new();
    for (id, email, first_name, last_name, role) in staff_rows {
        let staff_id: Uuid = sqlx::query(
            r#"
            INSERT INTO staff (id, email, first_name, last_name, role, place_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (email) DO UPDATE
            SET first_name = EXCLUDED.first_name, role = EXCLUDED.role, place_id = EXCLUDED.place_id
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(email)
        .bind(first_name)
        .bind(last_name)
        .bind(role)
        .bind(place_id)
        .fetch_one(pool)
        .await?
        .get("id");
        staff.push((email.to_string(), staff_id));
    }

    let patient_id = Uuid::parse_str("d6b1f4c5-8e90-41a2-bdce-3f4a5b6c7d84")?;
    sqlx::query(
        r#"
        INSERT INTO patients (id, place_id, name, age, gender)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET name = EXCLUDED.name, age = EXCLUDED.age
        "#,
    )
    .bind(patient_id)
    .bind(place_id)
    .bind("Amara Okafor")
    .bind(29)
    .bind("F")
    .execute(pool)
    .await?;

    let device_id = "HRM-0001".to_string();
    sqlx::query(
        r#"
        INSERT INTO devices (id, device_id, place_id, assigned_to)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (device_id) DO UPDATE
        SET assigned_to = EXCLUDED.assigned_to, is_active = TRUE
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&device_id)
    .bind(place_id)
    .bind(patient_id)
    .execute(pool)
    .await?;

    Ok(Seeded {
        place_id,
        patient_id,
        device_id,
        staff,
    })
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_err(message: String) -> PipelineError {
    PipelineError::Storage(sqlx::Error::Decode(message.into()))
}

fn alert_from_row(row: &PgRow) -> Result<Alert, PipelineError> {
    let verdict: String = row.try_get("verdict")?;
    Ok(Alert {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        sample_id: row.try_get("sample_id")?,
        verdict: verdict.parse::<Verdict>().map_err(decode_err)?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
        resolved: row.try_get("resolved")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
        dispatched_at: row.try_get("dispatched_at")?,
    })
}

fn patient_from_row(row: &PgRow) -> Result<Patient, PipelineError> {
    Ok(Patient {
        id: row.try_get("id")?,
        place_id: row.try_get("place_id")?,
        name: row.try_get("name")?,
    })
}

fn sample_from_row(row: &PgRow) -> Result<Sample, PipelineError> {
    Ok(Sample {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        bpm: row.try_get("bpm")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

#[async_trait]
impl VitalsRepository for PgStore {
    async fn find_patient(&self, id: Uuid) -> Result<Option<Patient>, PipelineError> {
        let row = sqlx::query("SELECT id, place_id, name FROM patients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(patient_from_row).transpose()
    }

    async fn patient_for_device(&self, device_id: &str) -> Result<Option<Patient>, PipelineError> {
        let row = sqlx::query(
            r#"
            SELECT p.id, p.place_id, p.name
            FROM devices d
            JOIN patients p ON p.id = d.assigned_to
            WHERE d.device_id = $1 AND d.is_active
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(patient_from_row).transpose()
    }

    async fn insert_sample(&self, patient_id: Uuid, bpm: i32) -> Result<Sample, PipelineError> {
        let row = sqlx::query(
            r#"
            INSERT INTO heart_rate_samples (id, patient_id, bpm)
            VALUES ($1, $2, $3)
            RETURNING id, patient_id, bpm, recorded_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(patient_id)
        .bind(bpm)
        .fetch_one(&self.pool)
        .await?;
        sample_from_row(&row)
    }

    async fn find_sample(&self, id: Uuid) -> Result<Option<Sample>, PipelineError> {
        let row = sqlx::query(
            "SELECT id, patient_id, bpm, recorded_at FROM heart_rate_samples WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sample_from_row).transpose()
    }
}

#[async_trait]
impl AlertRepository for PgStore {
    async fn insert_alert_if_absent(&self, alert: NewAlert) -> Result<AlertInsert, PipelineError> {
        let insert = format!(
            "INSERT INTO alerts (id, patient_id, sample_id, verdict, message) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (sample_id) DO NOTHING \
             RETURNING {ALERT_COLUMNS}"
        );
        let select = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE sample_id = $1");

        // The follow-up SELECT runs as its own statement so it sees a row
        // committed by a concurrent winner. An admin delete in between sends
        // us around again.
        for _ in 0..3 {
            let inserted = sqlx::query(&insert)
                .bind(Uuid::new_v4())
                .bind(alert.patient_id)
                .bind(alert.sample_id)
                .bind(alert.verdict.as_str())
                .bind(&alert.message)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = inserted {
                return Ok(AlertInsert::Created(alert_from_row(&row)?));
            }

            let existing = sqlx::query(&select)
                .bind(alert.sample_id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = existing {
                return Ok(AlertInsert::Existing(alert_from_row(&row)?));
            }
        }

        Err(PipelineError::Conflict(format!(
            "alert for sample {} kept changing concurrently",
            alert.sample_id
        )))
    }

    async fn resolve_alert(
        &self,
        id: Uuid,
        resolver: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Alert, PipelineError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query("SELECT resolved FROM alerts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PipelineError::not_found("alert", id))?;
        if current.try_get::<bool, _>("resolved")? {
            return Err(PipelineError::Conflict(format!("alert {id} is already resolved")));
        }

        let resolver_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM staff WHERE id = $1)")
                .bind(resolver)
                .fetch_one(&mut *tx)
                .await?;
        if !resolver_exists {
            return Err(PipelineError::not_found("staff member", resolver));
        }

        let row = sqlx::query(&format!(
            "UPDATE alerts SET resolved = TRUE, resolved_at = $2, resolved_by = $3 \
             WHERE id = $1 RETURNING {ALERT_COLUMNS}"
        ))
        .bind(id)
        .bind(at)
        .bind(resolver)
        .fetch_one(&mut *tx)
        .await?;
        let alert = alert_from_row(&row)?;

        tx.commit().await?;
        Ok(alert)
    }

    async fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), PipelineError> {
        sqlx::query("UPDATE alerts SET dispatched_at = COALESCE(dispatched_at, $2) WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn undispatched_alerts(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Alert>, PipelineError> {
        let rows = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE dispatched_at IS NULL AND created_at < $1 \
             ORDER BY created_at LIMIT $2"
        ))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, PipelineError> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT a.id, a.patient_id, a.sample_id, a.verdict, a.message, a.created_at, \
             a.resolved, a.resolved_at, a.resolved_by, a.dispatched_at, \
             p.name AS patient_name, pl.name AS place_name, s.bpm \
             FROM alerts a \
             JOIN patients p ON p.id = a.patient_id \
             JOIN places pl ON pl.id = p.place_id \
             JOIN heart_rate_samples s ON s.id = a.sample_id \
             WHERE TRUE",
        );

        if let Some(patient_id) = filter.patient_id {
            query.push(" AND a.patient_id = ").push_bind(patient_id);
        }
        if let Some(place_id) = filter.place_id {
            query.push(" AND p.place_id = ").push_bind(place_id);
        }
        if let Some(resolved) = filter.resolved {
            query.push(" AND a.resolved = ").push_bind(resolved);
        }
        if let Some(since) = filter.since {
            query.push(" AND a.created_at >= ").push_bind(since);
        }
        if let Some(resolved_since) = filter.resolved_since {
            query.push(" AND a.resolved_at >= ").push_bind(resolved_since);
        }
        query.push(" ORDER BY a.created_at DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(AlertRecord {
                alert: alert_from_row(&row)?,
                patient_name: row.try_get("patient_name")?,
                place_name: row.try_get("place_name")?,
                bpm: row.try_get("bpm")?,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl StaffDirectory for PgStore {
    async fn list_staff_for_place(
        &self,
        place_id: Uuid,
        roles: &[String],
    ) -> Result<Vec<StaffContact>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT id, email FROM staff
            WHERE place_id = $1 AND role = ANY($2) AND is_active
            ORDER BY email
            "#,
        )
        .bind(place_id)
        .bind(roles.to_vec())
        .fetch_all(&self.pool)
        .await?;

        let mut staff = Vec::with_capacity(rows.len());
        for row in rows {
            staff.push(StaffContact {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
            });
        }
        Ok(staff)
    }

    async fn find_staff_by_email(&self, email: &str) -> Result<Option<StaffContact>, PipelineError> {
        let row = sqlx::query("SELECT id, email FROM staff WHERE lower(email) = lower($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(StaffContact {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TaskQueue for PgStore {
    async fn enqueue(&self, job: NewJob) -> Result<bool, PipelineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_jobs (id, alert_id, recipient, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (alert_id, recipient) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job.alert_id)
        .bind(&job.recipient)
        .bind(Json(&job.payload))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        limit: i64,
        stale_after: Duration,
    ) -> Result<Vec<NotificationJob>, PipelineError> {
        let rows = sqlx::query(
            r#"
            UPDATE notification_jobs j
            SET status = 'running', attempts = j.attempts + 1, locked_at = now(), updated_at = now()
            WHERE j.id IN (
                SELECT id FROM notification_jobs
                WHERE (status = 'pending' AND run_at <= now())
                   OR (status = 'running' AND locked_at < now() - make_interval(secs => $2))
                ORDER BY run_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING j.id, j.alert_id, j.recipient, j.payload, j.attempts
            "#,
        )
        .bind(limit)
        .bind(stale_after.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: Json<AlertEmail> = row.try_get("payload")?;
            jobs.push(NotificationJob {
                id: row.try_get("id")?,
                alert_id: row.try_get("alert_id")?,
                recipient: row.try_get("recipient")?,
                payload: payload.0,
                attempts: row.try_get("attempts")?,
            });
        }
        Ok(jobs)
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'sent', sent_at = now(), locked_at = NULL, last_error = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_later(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'pending', run_at = $2, last_error = $3, locked_at = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'failed', last_error = $2, locked_at = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<FailedJob>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_id, recipient, attempts, last_error, updated_at
            FROM notification_jobs
            WHERE status = 'failed'
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(FailedJob {
                id: row.try_get("id")?,
                alert_id: row.try_get("alert_id")?,
                recipient: row.try_get("recipient")?,
                attempts: row.try_get("attempts")?,
                last_error: row.try_get("last_error")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(jobs)
    }
}
