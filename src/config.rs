use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::evaluator::{Thresholds, DEFAULT_CRITICAL_HIGH, DEFAULT_CRITICAL_LOW};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub thresholds: Thresholds,
    pub notify_roles: Vec<String>,
    pub mail: MailConfig,
    pub delivery: DeliveryConfig,
    pub otp_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub from: String,
    pub company_name: String,
    pub support_email: String,
}

/// Retry policy of the notification worker.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub send_timeout: Duration,
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub stale_lock: Duration,
    pub sweep_after: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(900),
            stale_lock: Duration::from_secs(300),
            sweep_after: Duration::from_secs(60),
        }
    }
}

impl DeliveryConfig {
    /// Delay before the next attempt, doubling per failed attempt.
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.backoff_max)
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let thresholds = Thresholds {
            high: env_or("ALERT_CRITICAL_HIGH", DEFAULT_CRITICAL_HIGH)?,
            low: env_or("ALERT_CRITICAL_LOW", DEFAULT_CRITICAL_LOW)?,
        };
        if thresholds.low >= thresholds.high {
            bail!(
                "ALERT_CRITICAL_LOW ({}) must be below ALERT_CRITICAL_HIGH ({})",
                thresholds.low,
                thresholds.high
            );
        }

        let notify_roles = parse_roles(&env_or("ALERT_NOTIFY_ROLES", "DOCTOR".to_string())?);
        if notify_roles.is_empty() {
            bail!("ALERT_NOTIFY_ROLES must name at least one role");
        }

        let mail = MailConfig {
            api_url: optional("MAIL_API_URL"),
            api_token: optional("MAIL_API_TOKEN"),
            from: env_or("MAIL_FROM", "alerts@localhost".to_string())?,
            company_name: env_or("COMPANY_NAME", "Clinic Monitoring".to_string())?,
            support_email: env_or("SUPPORT_EMAIL", "support@localhost".to_string())?,
        };

        let defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            send_timeout: secs("NOTIFY_SEND_TIMEOUT_SECS", defaults.send_timeout)?,
            max_attempts: env_or("NOTIFY_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            backoff_base: secs("NOTIFY_BACKOFF_SECS", defaults.backoff_base)?,
            backoff_max: secs("NOTIFY_BACKOFF_MAX_SECS", defaults.backoff_max)?,
            stale_lock: secs("NOTIFY_STALE_LOCK_SECS", defaults.stale_lock)?,
            sweep_after: secs("NOTIFY_SWEEP_AFTER_SECS", defaults.sweep_after)?,
        };

        Ok(Self {
            database_url,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5)?,
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379/0".to_string())?,
            thresholds,
            notify_roles,
            mail,
            delivery,
            otp_ttl_secs: env_or("OTP_TTL_SECS", 300)?,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value {raw:?}")),
        None => Ok(default),
    }
}

fn secs(key: &str, default: Duration) -> anyhow::Result<Duration> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn parse_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|role| role.trim().to_ascii_uppercase())
        .filter(|role| !role.is_empty())
        .collect()
}
