use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::config::DeliveryConfig;
use crate::dispatch::Dispatcher;
use crate::error::{DeliveryError, PipelineError};
use crate::mailer::{Branding, Mailer};
use crate::models::NotificationJob;
use crate::store::TaskQueue;

const IDLE_POLL: Duration = Duration::from_secs(2);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Retrying,
    Failed,
    /// The outcome could not be written back; the job is reclaimed once its
    /// lock goes stale.
    Unrecorded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub redispatched: usize,
    pub claimed: usize,
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
    pub unrecorded: usize,
}

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    mailer: Arc<dyn Mailer>,
    dispatcher: Dispatcher,
    branding: Branding,
    config: DeliveryConfig,
    concurrency: usize,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        mailer: Arc<dyn Mailer>,
        dispatcher: Dispatcher,
        branding: Branding,
        config: DeliveryConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            mailer,
            dispatcher,
            branding,
            config,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs passes until `shutdown` resolves. Shutdown is checked between
    /// passes, so sends already in flight finish first. A failed pass is
    /// logged and retried after a pause.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            let pause = match self.run_once().await {
                Ok(pass) if pass.claimed > 0 || pass.redispatched > 0 => {
                    tracing::info!(
                        claimed = pass.claimed,
                        sent = pass.sent,
                        retrying = pass.retrying,
                        failed = pass.failed,
                        unrecorded = pass.unrecorded,
                        redispatched = pass.redispatched,
                        "worker pass finished"
                    );
                    None
                }
                Ok(_) => Some(IDLE_POLL),
                Err(err) => {
                    tracing::error!(error = %err, "worker pass failed, backing off");
                    Some(ERROR_BACKOFF)
                }
            };

            let stop = match pause {
                Some(pause) => tokio::select! {
                    biased;
                    _ = &mut shutdown => true,
                    _ = tokio::time::sleep(pause) => false,
                },
                None => tokio::select! {
                    biased;
                    _ = &mut shutdown => true,
                    _ = std::future::ready(()) => false,
                },
            };
            if stop {
                tracing::info!("worker shutting down");
                return;
            }
        }
    }

    /// One sweep plus one batch of due deliveries. Fails only when no jobs
    /// could be claimed; every claimed job is seen through to an outcome.
    pub async fn run_once(&self) -> Result<PassSummary, PipelineError> {
        let mut pass = PassSummary::default();
        match self.dispatcher.redispatch_pending(self.config.sweep_after).await {
            Ok(redispatched) => pass.redispatched = redispatched,
            Err(err) => tracing::error!(error = %err, "sweep of undispatched alerts failed"),
        }

        let jobs = self
            .queue
            .claim_due(self.concurrency as i64, self.config.stale_lock)
            .await?;
        pass.claimed = jobs.len();

        let mut deliveries = JoinSet::new();
        for job in jobs {
            let worker = self.clone();
            deliveries.spawn(async move { worker.deliver(job).await });
        }

        while let Some(joined) = deliveries.join_next().await {
            let delivery = joined.unwrap_or_else(|err| {
                tracing::error!(error = %err, "delivery task died");
                Delivery::Unrecorded
            });
            match delivery {
                Delivery::Sent => pass.sent += 1,
                Delivery::Retrying => pass.retrying += 1,
                Delivery::Failed => pass.failed += 1,
                Delivery::Unrecorded => pass.unrecorded += 1,
            }
        }

        Ok(pass)
    }

    async fn deliver(&self, job: NotificationJob) -> Delivery {
        match self.attempt(&job).await {
            Ok(delivery) => delivery,
            Err(err) => {
                tracing::error!(
                    job_id = %job.id,
                    alert_id = %job.alert_id,
                    recipient = %job.recipient,
                    error = %err,
                    "could not record delivery outcome"
                );
                Delivery::Unrecorded
            }
        }
    }

    async fn attempt(&self, job: &NotificationJob) -> Result<Delivery, PipelineError> {
        if job.attempts > self.config.max_attempts {
            let reason = format!("abandoned after {} attempts", job.attempts - 1);
            tracing::error!(job_id = %job.id, alert_id = %job.alert_id, recipient = %job.recipient, "{reason}");
            self.queue.fail(job.id, &reason).await?;
            return Ok(Delivery::Failed);
        }

        let email = self.branding.alert_email(&job.recipient, &job.payload);
        let timeout = self.config.send_timeout;
        let sent = match tokio::time::timeout(timeout, self.mailer.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout.as_secs())),
        };

        let err = match sent {
            Ok(()) => {
                self.queue.complete(job.id).await?;
                tracing::info!(job_id = %job.id, alert_id = %job.alert_id, recipient = %job.recipient, "alert email sent");
                return Ok(Delivery::Sent);
            }
            Err(err) => err,
        };

        if job.attempts >= self.config.max_attempts {
            tracing::error!(
                job_id = %job.id,
                alert_id = %job.alert_id,
                recipient = %job.recipient,
                attempt = job.attempts,
                error = %err,
                "alert email delivery failed, giving up"
            );
            self.queue.fail(job.id, &err.to_string()).await?;
            return Ok(Delivery::Failed);
        }

        let delay = self.config.backoff_for(job.attempts);
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        tracing::warn!(
            job_id = %job.id,
            alert_id = %job.alert_id,
            recipient = %job.recipient,
            attempt = job.attempts,
            retry_in_secs = delay.as_secs(),
            error = %err,
            "alert email delivery failed, will retry"
        );
        self.queue.retry_later(job.id, run_at, &err.to_string()).await?;
        Ok(Delivery::Retrying)
    }
}
