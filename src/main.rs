use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::Map;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod alerts;
mod config;
mod db;
mod dispatch;
mod error;
mod evaluator;
mod ingest;
mod mailer;
#[cfg(test)]
mod memory;
mod models;
mod otp;
mod report;
mod store;
mod worker;

use alerts::AlertStore;
use config::Config;
use dispatch::Dispatcher;
use evaluator::Evaluator;
use ingest::{Ingestor, Recorded};
use mailer::{Branding, Template};
use models::{AlertFilter, AlertOutcome};
use otp::{OtpStore, RedisStore};

#[derive(Parser)]
#[command(name = "vitals-alerting")]
#[command(about = "Critical heart-rate alerting for clinic patient monitoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo clinic with staff, a patient and a device
    Seed,
    /// Record heart-rate samples from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record one heart-rate sample and raise an alert if critical
    #[command(group(
        ArgGroup::new("source")
            .args(["patient", "device"])
            .required(true)
            .multiple(false)
    ))]
    Record {
        #[arg(long)]
        patient: Option<Uuid>,
        #[arg(long)]
        device: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        bpm: i64,
    },
    /// Re-run alert evaluation for a stored sample
    Evaluate {
        #[arg(long)]
        sample: Uuid,
    },
    /// Mark an alert as resolved
    Resolve {
        #[arg(long)]
        alert: Uuid,
        /// Staff member resolving the alert
        #[arg(long)]
        by: Uuid,
    },
    /// List alerts, newest first
    #[command(group(
        ArgGroup::new("state")
            .args(["open", "resolved"])
            .multiple(false)
    ))]
    Alerts {
        #[arg(long)]
        patient: Option<Uuid>,
        #[arg(long)]
        place: Option<Uuid>,
        #[arg(long)]
        open: bool,
        #[arg(long)]
        resolved: bool,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Generate a markdown alert digest
    Report {
        #[arg(long)]
        place: Option<Uuid>,
        #[arg(long, default_value_t = 7)]
        since_days: i64,
        #[arg(long, default_value = "alerts.md")]
        out: PathBuf,
    },
    /// Deliver queued alert notifications
    Worker {
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// List notifications that exhausted their retries
    Failures {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Send one message through the configured mail transport
    MailTest {
        #[arg(long)]
        to: String,
        #[arg(long, value_enum, default_value_t = Template::WelcomeEmail)]
        template: Template,
    },
    /// Password reset one-time codes
    Otp {
        #[command(subcommand)]
        command: OtpCommands,
    },
}

#[derive(Subcommand)]
enum OtpCommands {
    /// Issue a code and email it to the staff member
    Issue {
        #[arg(long)]
        email: String,
    },
    /// Check a code without consuming it
    Verify {
        #[arg(long)]
        email: String,
        #[arg(long)]
        code: String,
    },
    /// Drop any outstanding code
    Invalidate {
        #[arg(long)]
        email: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(db::PgStore::new(pool.clone()));
    let alerts = AlertStore::new(store.clone(), Evaluator::new(config.thresholds));
    let dispatcher = Dispatcher::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        config.notify_roles.clone(),
    );
    let ingestor = Ingestor::new(store.clone(), alerts.clone(), dispatcher.clone());
    let mailer = mailer::from_config(&config.mail);
    let branding = Branding::from_config(&config.mail);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let seeded = db::seed(&pool).await?;
            println!("Seeded place {}.", seeded.place_id);
            println!("Patient {} wears device {}.", seeded.patient_id, seeded.device_id);
            for (email, id) in seeded.staff {
                println!("Staff {email} ({id})");
            }
        }
        Commands::Import { csv } => {
            let summary = ingest::import_csv(&ingestor, &csv).await?;
            println!(
                "Recorded {} samples from {} ({} alerts, {} rows rejected).",
                summary.inserted,
                csv.display(),
                summary.alerted,
                summary.rejected
            );
        }
        Commands::Record {
            patient,
            device,
            bpm,
        } => {
            let recorded = match (patient, device) {
                (Some(patient_id), _) => ingestor.record(patient_id, bpm).await?,
                (None, Some(device_id)) => ingestor.record_from_device(&device_id, bpm).await?,
                (None, None) => anyhow::bail!("either --patient or --device is required"),
            };
            print_recorded(&recorded);
        }
        Commands::Evaluate { sample } => {
            let recorded = ingestor.reevaluate(sample).await?;
            print_recorded(&recorded);
        }
        Commands::Resolve { alert, by } => {
            let resolved = alerts.resolve(alert, by).await?;
            println!(
                "Alert {} resolved by {} at {}.",
                resolved.id,
                resolved.resolved_by.unwrap_or(by),
                resolved
                    .resolved_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default()
            );
        }
        Commands::Alerts {
            patient,
            place,
            open,
            resolved,
            limit,
        } => {
            let filter = AlertFilter {
                patient_id: patient,
                place_id: place,
                resolved: if open {
                    Some(false)
                } else if resolved {
                    Some(true)
                } else {
                    None
                },
                limit: Some(limit.max(1)),
                ..AlertFilter::default()
            };
            let records = alerts.list(&filter).await?;
            if records.is_empty() {
                println!("No alerts match.");
                return Ok(());
            }
            for record in records {
                let state = match (record.alert.resolved, record.alert.dispatched_at) {
                    (true, _) => "resolved",
                    (false, Some(_)) => "open",
                    (false, None) => "open, not yet dispatched",
                };
                println!(
                    "- {} [{}] {} ({}) at {}: {}",
                    record.alert.id,
                    state,
                    record.patient_name,
                    record.place_name,
                    record.alert.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.alert.message
                );
            }
        }
        Commands::Report {
            place,
            since_days,
            out,
        } => {
            let cutoff = report::cutoff(since_days);
            let window = alerts
                .list(&AlertFilter {
                    place_id: place,
                    since: Some(cutoff),
                    ..AlertFilter::default()
                })
                .await?;
            let open = alerts
                .list(&AlertFilter {
                    place_id: place,
                    resolved: Some(false),
                    ..AlertFilter::default()
                })
                .await?;
            let resolved = alerts
                .list(&AlertFilter {
                    place_id: place,
                    resolved_since: Some(report::cutoff(1)),
                    ..AlertFilter::default()
                })
                .await?;
            let scope = window
                .iter()
                .chain(&open)
                .chain(&resolved)
                .next()
                .filter(|_| place.is_some())
                .map(|record| record.place_name.clone());
            let report = report::build_report(
                scope.as_deref(),
                cutoff,
                &report::Sections {
                    window: &window,
                    open: &open,
                    resolved: &resolved,
                },
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Worker { concurrency, once } => {
            let worker = worker::Worker::new(
                store.clone(),
                mailer,
                dispatcher,
                branding,
                config.delivery.clone(),
                concurrency,
            );
            if once {
                let pass = worker.run_once().await?;
                println!(
                    "Claimed {} jobs: {} sent, {} retrying, {} failed, {} unrecorded ({} alerts redispatched).",
                    pass.claimed, pass.sent, pass.retrying, pass.failed, pass.unrecorded, pass.redispatched
                );
            } else {
                let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
                tokio::spawn(async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            let _ = stop_tx.send(true);
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "cannot listen for ctrl-c");
                            std::future::pending::<()>().await;
                        }
                    }
                });
                worker
                    .run(async move {
                        let _ = stop_rx.wait_for(|stop| *stop).await;
                    })
                    .await;
            }
        }
        Commands::Failures { limit } => {
            use crate::store::TaskQueue;

            let failed = store.list_failed(limit.max(1)).await?;
            if failed.is_empty() {
                println!("No failed notifications.");
                return Ok(());
            }
            for job in failed {
                println!(
                    "- job {} alert {} to {} after {} attempts at {}: {}",
                    job.id,
                    job.alert_id,
                    job.recipient,
                    job.attempts,
                    job.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    job.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::MailTest { to, template } => {
            let message = branding.compose(&to, "Mail transport check", template, Map::new());
            tokio::time::timeout(config.delivery.send_timeout, mailer.send(&message))
                .await
                .context("mail transport timed out")??;
            println!("Sent {} to {to}.", template.name());
        }
        Commands::Otp { command } => {
            let kv = RedisStore::connect(&config.redis_url)
                .await
                .context("failed to connect to Redis")?;
            let otp = OtpStore::new(Arc::new(kv), Duration::from_secs(config.otp_ttl_secs));
            match command {
                OtpCommands::Issue { email } => {
                    otp::send_reset_code(store.as_ref(), &otp, mailer.as_ref(), &branding, &email)
                        .await?;
                    println!("Reset code sent to {email}.");
                }
                OtpCommands::Verify { email, code } => {
                    if otp.verify(&email, &code).await? {
                        println!("Code is valid.");
                    } else {
                        println!("Invalid or expired code.");
                    }
                }
                OtpCommands::Invalidate { email } => {
                    otp.invalidate(&email).await?;
                    println!("Outstanding code for {email} cleared.");
                }
            }
        }
    }

    Ok(())
}

fn print_recorded(recorded: &Recorded) {
    let sample = &recorded.sample;
    match &recorded.outcome {
        AlertOutcome::NotCritical => println!(
            "Recorded sample {} ({} bpm), not critical.",
            sample.id, sample.bpm
        ),
        AlertOutcome::Created(alert) => println!(
            "Recorded sample {} ({} bpm). Alert {} raised: {}. {} notifications queued.",
            sample.id, sample.bpm, alert.id, alert.message, recorded.notifications
        ),
        AlertOutcome::AlreadyExists(alert) => println!(
            "Sample {} ({} bpm) already has alert {}; no notifications re-sent.",
            sample.id, sample.bpm, alert.id
        ),
    }
}
