//! The persisted job record and its notification preferences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{JobAction, JobStatus};
use crate::config::PrefDefaults;
use crate::credential::NotificationClaims;

/// Kind of notification email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    Submitted,
    Done,
    Failed,
}

impl std::fmt::Display for EmailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One attempt to send a notification email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailHistoryEntry {
    pub kind: EmailKind,
    pub timestamp: DateTime<Utc>,
    /// Whether the adapter confirmed delivery.
    pub sent: bool,
}

/// A worker callback as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub node_id: String,
    pub action: JobAction,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Notification preferences resolved from the submitter's credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub email_enabled: bool,
    pub recipient: Option<String>,
    /// `tem`
    pub threshold_minutes: u32,
    /// `mstout`
    pub notify_on_submit: bool,
    /// `mssub`
    pub notify_on_terminal: bool,
    /// `intsub`
    pub resubmit_interval_minutes: u32,
}

impl NotificationPrefs {
    /// Resolve preferences from optional credential claims.
    ///
    /// No credential means a public request: email is disabled.
    pub fn from_claims(claims: Option<&NotificationClaims>, defaults: &PrefDefaults) -> Self {
        match claims {
            None => Self {
                email_enabled: false,
                recipient: None,
                ..Self::with_defaults(defaults)
            },
            Some(claims) => Self {
                email_enabled: true,
                recipient: claims.email.clone(),
                threshold_minutes: claims.tem.unwrap_or(defaults.threshold_minutes),
                notify_on_submit: claims.mstout.unwrap_or(defaults.notify_on_submit),
                notify_on_terminal: claims.mssub.unwrap_or(defaults.notify_on_terminal),
                resubmit_interval_minutes: claims
                    .intsub
                    .unwrap_or(defaults.resubmit_interval_minutes),
            },
        }
    }

    /// Preferences of a request made without a credential.
    pub fn public() -> Self {
        Self::from_claims(None, &PrefDefaults::default())
    }

    fn with_defaults(defaults: &PrefDefaults) -> Self {
        Self {
            email_enabled: true,
            recipient: None,
            threshold_minutes: defaults.threshold_minutes,
            notify_on_submit: defaults.notify_on_submit,
            notify_on_terminal: defaults.notify_on_terminal,
            resubmit_interval_minutes: defaults.resubmit_interval_minutes,
        }
    }
}

/// One job as seen by a single session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub status: JobStatus,
    /// Session context that submitted the job.
    pub owner_context: Option<String>,
    /// Semantic request parameters the job id was derived from.
    pub params: serde_json::Value,
    /// Original submission time as reported by the client.
    pub time_request: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub prefs: NotificationPrefs,
    /// Outcome of the last delivery attempt, absent until one is made.
    pub email_status: Option<String>,
    pub callback_events: Vec<CallbackEvent>,
    pub email_history: Vec<EmailHistoryEntry>,
}

impl JobRecord {
    /// A freshly submitted job.
    pub fn new(
        owner_context: Option<String>,
        params: serde_json::Value,
        prefs: NotificationPrefs,
        time_request: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: JobStatus::Submitted,
            owner_context,
            params,
            time_request,
            created_at: now,
            updated_at: now,
            prefs,
            email_status: None,
            callback_events: Vec::new(),
            email_history: Vec::new(),
        }
    }

    /// Most recent successfully delivered email of `kind`.
    pub fn last_sent(&self, kind: EmailKind) -> Option<&EmailHistoryEntry> {
        self.email_history
            .iter()
            .rev()
            .find(|entry| entry.kind == kind && entry.sent)
    }

    /// Number of successfully delivered emails of `kind`.
    pub fn sent_count(&self, kind: EmailKind) -> usize {
        self.email_history
            .iter()
            .filter(|entry| entry.kind == kind && entry.sent)
            .count()
    }

    /// Start of the job for elapsed-time checks: the client-reported request
    /// time when known, otherwise when the record was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.time_request.unwrap_or(self.created_at)
    }

    /// Take newer credential claims into account.
    ///
    /// Only records submitted with a credential are updated; a public job
    /// stays public.
    pub fn refresh_prefs(&mut self, claims: &NotificationClaims, defaults: &PrefDefaults) {
        if !self.prefs.email_enabled {
            return;
        }
        let mut prefs = NotificationPrefs::from_claims(Some(claims), defaults);
        if prefs.recipient.is_none() {
            prefs.recipient = self.prefs.recipient.take();
        }
        self.prefs = prefs;
    }
}
