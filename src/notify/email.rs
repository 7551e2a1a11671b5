//! Email dispatch adapter — template parameters, rendering, and SMTP via lettre.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::config::EmailConfig;
use crate::error::NotifyError;
use crate::job::{EmailKind, JobKey, JobRecord, JobStatus};

// ── Template parameters ─────────────────────────────────────────────

/// Values substituted into the subject line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectParams {
    pub kind: EmailKind,
    pub job_id: String,
    pub instrument: Option<String>,
    pub product_type: Option<String>,
}

/// Values substituted into the body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BodyParams {
    pub kind: EmailKind,
    pub status: JobStatus,
    pub job_id: String,
    pub session_id: String,
    /// Message from the worker that triggered the email, if any.
    pub message: Option<String>,
    /// Minutes since the original request; unknown without a request time.
    pub duration_minutes: Option<i64>,
    pub request_params: serde_json::Value,
}

impl SubjectParams {
    pub fn for_job(key: &JobKey, record: &JobRecord, kind: EmailKind) -> Self {
        Self {
            kind,
            job_id: key.job_id.clone(),
            instrument: param_str(&record.params, "instrument"),
            product_type: param_str(&record.params, "product_type"),
        }
    }
}

impl BodyParams {
    pub fn for_job(
        key: &JobKey,
        record: &JobRecord,
        kind: EmailKind,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            status: record.status,
            job_id: key.job_id.clone(),
            session_id: key.session_id.clone(),
            message: message.filter(|m| !m.is_empty()).map(str::to_string),
            duration_minutes: record
                .time_request
                .map(|t| (now - t).num_minutes().max(0)),
            request_params: record.params.clone(),
        }
    }
}

fn param_str(params: &serde_json::Value, name: &str) -> Option<String> {
    params.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

// ── Rendering ───────────────────────────────────────────────────────

pub fn render_subject(params: &SubjectParams) -> String {
    let what = match params.kind {
        EmailKind::Submitted => "submitted",
        EmailKind::Done => "done",
        EmailKind::Failed => "failed",
    };
    let product = match (&params.instrument, &params.product_type) {
        (Some(instrument), Some(product)) => format!("{instrument} {product}"),
        (Some(instrument), None) => instrument.clone(),
        (None, Some(product)) => product.clone(),
        (None, None) => "analysis".to_string(),
    };
    format!("[ODA] {product} job {} {what}", params.job_id)
}

pub fn render_body(params: &BodyParams) -> String {
    let mut body = String::new();

    let headline = match params.kind {
        EmailKind::Submitted => "Your request was submitted and is being processed.",
        EmailKind::Done => "Your request has been completed.",
        EmailKind::Failed => "Unfortunately your request has failed.",
    };
    body.push_str(headline);
    if params.kind != EmailKind::Submitted {
        if let Some(minutes) = params.duration_minutes {
            body.push_str(&format!(" It took about {minutes} minutes."));
        }
    }
    body.push_str("\n\n");

    body.push_str(&format!("Job ID: {}\n", params.job_id));
    body.push_str(&format!("Session ID: {}\n", params.session_id));
    body.push_str(&format!("Status: {}\n", params.status));
    if let Some(message) = &params.message {
        body.push_str(&format!("Message: {message}\n"));
    }

    if let Some(map) = params.request_params.as_object().filter(|m| !m.is_empty()) {
        body.push_str("\nRequest parameters:\n");
        for (name, value) in map {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            body.push_str(&format!("  {name}: {value}\n"));
        }
    }

    body
}

// ── Senders ─────────────────────────────────────────────────────────

/// Sends one notification email.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &SubjectParams,
        body: &BodyParams,
    ) -> Result<(), NotifyError>;
}

/// SMTP sender backed by lettre.
pub struct SmtpEmailSender {
    config: EmailConfig,
    timeout: Duration,
}

impl SmtpEmailSender {
    pub fn new(config: EmailConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn send_blocking(
        config: &EmailConfig,
        timeout: Duration,
        to: &str,
        subject: String,
        body: String,
    ) -> Result<(), NotifyError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| NotifyError::SendFailed {
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.smtp_port)
            .credentials(creds)
            .timeout(Some(timeout))
            .build();

        let email = Message::builder()
            .from(config.from_address.parse().map_err(|e| {
                NotifyError::InvalidAddress {
                    address: config.from_address.clone(),
                    reason: format!("{e}"),
                }
            })?)
            .to(to.parse().map_err(|e| NotifyError::InvalidAddress {
                address: to.to_string(),
                reason: format!("{e}"),
            })?)
            .subject(subject)
            .body(body)
            .map_err(|e| NotifyError::SendFailed {
                reason: format!("Failed to build email: {e}"),
            })?;

        transport.send(&email).map_err(|e| NotifyError::SendFailed {
            reason: format!("SMTP send failed: {e}"),
        })?;

        Ok(())
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(
        &self,
        to: &str,
        subject: &SubjectParams,
        body: &BodyParams,
    ) -> Result<(), NotifyError> {
        let config = self.config.clone();
        let timeout = self.timeout;
        let to_owned = to.to_string();
        let subject = render_subject(subject);
        let body = render_body(body);

        tokio::task::spawn_blocking(move || {
            Self::send_blocking(&config, timeout, &to_owned, subject, body)
        })
        .await
        .map_err(|e| NotifyError::SendFailed {
            reason: format!("Email task panicked: {e}"),
        })??;

        tracing::info!(to, "Notification email sent");
        Ok(())
    }
}

/// An email captured by [`RecordingEmailSender`].
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub to: String,
    pub subject: SubjectParams,
    pub body: BodyParams,
}

/// In-memory sender that records every email; can be switched to fail.
#[derive(Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<SentEmail>>,
    failing: AtomicBool,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Delivered emails of `kind`.
    pub fn count(&self, kind: EmailKind) -> usize {
        self.sent()
            .iter()
            .filter(|email| email.subject.kind == kind)
            .count()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(
        &self,
        to: &str,
        subject: &SubjectParams,
        body: &BodyParams,
    ) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::SendFailed {
                reason: "recording sender set to fail".into(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentEmail {
                to: to.to_string(),
                subject: subject.clone(),
                body: body.clone(),
            });
        Ok(())
    }
}
