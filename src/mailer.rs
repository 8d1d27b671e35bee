use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::MailConfig;
use crate::error::DeliveryError;
use crate::models::AlertEmail;

pub const ALERT_SUBJECT: &str = "Critical Heart Rate Alert";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    AlertEmail,
    PasswordReset,
    WelcomeEmail,
    WelcomeEmailWithCredentials,
}

impl Template {
    pub fn name(self) -> &'static str {
        match self {
            Template::AlertEmail => "alert_email",
            Template::PasswordReset => "password_reset",
            Template::WelcomeEmail => "welcome_email",
            Template::WelcomeEmailWithCredentials => "welcome_email_with_credentials",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub template: Template,
    pub context: Map<String, Value>,
}

/// Outbound notification channel shared by alert and account emails.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DeliveryError>;
}

/// Fills the context keys every template expects.
#[derive(Debug, Clone)]
pub struct Branding {
    pub company_name: String,
    pub support_email: String,
}

impl Branding {
    pub fn from_config(mail: &MailConfig) -> Self {
        Self {
            company_name: mail.company_name.clone(),
            support_email: mail.support_email.clone(),
        }
    }

    pub fn compose(
        &self,
        to: &str,
        subject: &str,
        template: Template,
        mut context: Map<String, Value>,
    ) -> OutboundEmail {
        context
            .entry("company_name")
            .or_insert_with(|| Value::from(self.company_name.clone()));
        context
            .entry("support_email")
            .or_insert_with(|| Value::from(self.support_email.clone()));
        context
            .entry("year")
            .or_insert_with(|| Value::from(Utc::now().year()));

        OutboundEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            template,
            context,
        }
    }

    pub fn alert_email(&self, to: &str, payload: &AlertEmail) -> OutboundEmail {
        let mut context = Map::new();
        context.insert("patient_name".into(), Value::from(payload.patient_name.clone()));
        context.insert("patient_id".into(), Value::from(payload.patient_id.to_string()));
        context.insert("bpm".into(), Value::from(payload.bpm));
        context.insert(
            "recorded_at".into(),
            Value::from(payload.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        );
        self.compose(to, ALERT_SUBJECT, Template::AlertEmail, context)
    }
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    template: &'static str,
    context: &'a Map<String, Value>,
}

/// Posts messages to an HTTP mail relay.
pub struct HttpMailer {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(url: String, token: Option<String>, from: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
            from,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DeliveryError> {
        let body = ApiMessage {
            from: &self.from,
            to: &email.to,
            subject: &email.subject,
            template: email.template.name(),
            context: &email.context,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Writes messages to the log instead of sending them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DeliveryError> {
        let context = serde_json::Value::Object(email.context.clone());
        tracing::info!(
            recipient = %email.to,
            subject = %email.subject,
            template = email.template.name(),
            context = %context,
            "MAIL_API_URL unset, message logged only"
        );
        Ok(())
    }
}

pub fn from_config(mail: &MailConfig) -> Arc<dyn Mailer> {
    match &mail.api_url {
        Some(url) => Arc::new(HttpMailer::new(
            url.clone(),
            mail.api_token.clone(),
            mail.from.clone(),
        )),
        None => Arc::new(LogMailer),
    }
}
