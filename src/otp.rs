use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{DeliveryError, PipelineError};
use crate::mailer::{Branding, Mailer, Template};
use crate::store::StaffDirectory;

pub const RESET_SUBJECT: &str = "Your Password Reset OTP";

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("key-value store error: {0}")]
    Store(#[from] redis::RedisError),
}

/// Key-value store with server-side expiry.
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), OtpError>;
    async fn get(&self, key: &str) -> Result<Option<String>, OtpError>;
    async fn delete(&self, key: &str) -> Result<(), OtpError>;
}

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, OtpError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ExpiringStore for RedisStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), OtpError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, OtpError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), OtpError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

/// Six-digit one-time codes for password reset. The latest issue wins.
#[derive(Clone)]
pub struct OtpStore {
    store: Arc<dyn ExpiringStore>,
    ttl: Duration,
}

impl OtpStore {
    pub fn new(store: Arc<dyn ExpiringStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn issue(&self, identity: &str) -> Result<String, OtpError> {
        let key = key_for(identity)?;
        let code = generate_code();
        self.store.set_with_ttl(&key, &code, self.ttl).await?;
        Ok(code)
    }

    /// Does not consume the code; call `invalidate` once it has been used.
    pub async fn verify(&self, identity: &str, code: &str) -> Result<bool, OtpError> {
        let key = key_for(identity)?;
        let code = code.trim();
        if code.is_empty() {
            return Ok(false);
        }
        let stored = self.store.get(&key).await?;
        Ok(stored.as_deref() == Some(code))
    }

    pub async fn invalidate(&self, identity: &str) -> Result<(), OtpError> {
        let key = key_for(identity)?;
        self.store.delete(&key).await
    }
}

fn key_for(identity: &str) -> Result<String, OtpError> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(OtpError::Validation("identity must not be empty".to_string()));
    }
    Ok(format!("otp:{}", identity.to_lowercase()))
}

fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

#[derive(Debug, Error)]
pub enum ResetError {
    #[error(transparent)]
    Lookup(#[from] PipelineError),
    #[error(transparent)]
    Otp(#[from] OtpError),
    #[error("could not send reset code: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Issues a code for a known staff email and mails it out.
pub async fn send_reset_code(
    directory: &dyn StaffDirectory,
    otp: &OtpStore,
    mailer: &dyn Mailer,
    branding: &Branding,
    email: &str,
) -> Result<(), ResetError> {
    let staff = directory
        .find_staff_by_email(email.trim())
        .await?
        .ok_or_else(|| PipelineError::not_found("staff member", email.trim()))?;

    let code = otp.issue(&staff.email).await?;
    let mut context = Map::new();
    context.insert("otp".into(), Value::from(code));
    context.insert("expiry_minutes".into(), Value::from(otp.ttl().as_secs() / 60));
    let message = branding.compose(&staff.email, RESET_SUBJECT, Template::PasswordReset, context);

    mailer.send(&message).await?;
    tracing::info!(staff_id = %staff.id, "password reset code sent");
    Ok(())
}
