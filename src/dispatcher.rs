//! Job dispatcher — the entry point for submissions, polls, and worker callbacks.
//!
//! Every mutation of one record runs inside that record's critical section:
//! load → transition → throttle → persist → notify. The section is held both
//! in-process and through the store, so dispatchers sharing a store root
//! exclude each other. The status change is made durable before any email is
//! attempted, so a delivery failure never rolls it back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DispatcherConfig, PrefDefaults};
use crate::credential::NotificationClaims;
use crate::error::{DispatchError, NotifyError};
use crate::job::identity::{self, IdentityRequest, IdentityResolver};
use crate::job::{
    CallbackEvent, EmailHistoryEntry, EmailKind, JobAction, JobKey, JobRecord, JobStatus,
    NotificationPrefs, state,
};
use crate::notify::email::{BodyParams, EmailSender, SubjectParams};
use crate::notify::throttle::{self, NotificationDecision};
use crate::store::{JobStore, KeyGuard, KeyedLocks, StoreLock};

/// Recorded in `email_status` after a successful delivery.
pub const EMAIL_SENT: &str = "email sent";
/// Recorded in `email_status` after a failed or timed-out delivery.
pub const EMAIL_FAILED: &str = "sending email failed";

/// A client submission or poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    /// Semantic request parameters.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Decoded notification claims; absent for public requests.
    #[serde(default)]
    pub credential: Option<NotificationClaims>,
    /// Session context of the submitter, used to detect colliding submissions.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub time_request: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    /// Neither id given: the key is derived from the parameters.
    fn is_fresh(&self) -> bool {
        self.session_id.as_deref().is_none_or(str::is_empty)
            && self.job_id.as_deref().is_none_or(str::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_key: JobKey,
    pub status: JobStatus,
    /// Present only when an email was attempted for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_status: Option<String>,
}

/// A worker progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRequest {
    pub job_id: String,
    pub session_id: String,
    pub action: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub credential: Option<NotificationClaims>,
    #[serde(default)]
    pub time_original_request: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAck {
    pub job_key: JobKey,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_status: Option<String>,
}

/// A held critical section. Fields drop in order, so the store lock is
/// released before the in-process guard.
struct CriticalSection {
    _store: StoreLock,
    _local: KeyGuard,
}

/// Coordinates identity resolution, record mutation, and notification.
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    sender: Arc<dyn EmailSender>,
    locks: KeyedLocks,
    pref_defaults: PrefDefaults,
    email_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        sender: Arc<dyn EmailSender>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            store,
            sender,
            locks: KeyedLocks::new(),
            pref_defaults: config.pref_defaults.clone(),
            email_timeout: config.email_timeout,
        }
    }

    /// Submit a new request or poll an existing one.
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitResponse, DispatchError> {
        self.submit_at(req, Utc::now()).await
    }

    /// Apply a worker callback.
    pub async fn callback(&self, req: CallbackRequest) -> Result<CallbackAck, DispatchError> {
        self.callback_at(req, Utc::now()).await
    }

    /// Read-only view of a record.
    pub async fn status(&self, session_id: &str, job_id: &str) -> Result<JobRecord, DispatchError> {
        identity::validate_id("session_id", session_id)?;
        identity::validate_id("job_id", job_id)?;
        let key = self.find_key(session_id, job_id).await?;
        Ok(self.store.load(&key).await?)
    }

    /// [`submit`](Self::submit) with an explicit clock.
    pub async fn submit_at(
        &self,
        req: SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitResponse, DispatchError> {
        let key = self.resolve_submission(&req, now).await?;

        let _section = self.lock_record(&key).await?;
        let mut record = self.store.load(&key).await?;

        // A fresh submission may land on another context's finished record;
        // only its owner, or a caller naming the record, may change its prefs.
        let owns = !req.is_fresh() || record.owner_context == req.context;
        if owns {
            if record.time_request.is_none() {
                record.time_request = req.time_request;
            }
            if let Some(claims) = &req.credential {
                record.refresh_prefs(claims, &self.pref_defaults);
            }
        }

        if record.status != JobStatus::Submitted {
            debug!(job = %key, status = %record.status, "Poll of a job past submission");
            self.store.save(&key, &record).await?;
            return Ok(SubmitResponse {
                job_key: key,
                status: record.status,
                email_status: None,
            });
        }

        let transition = state::apply_submission(&mut record, now);
        let decision = throttle::evaluate(&record, &transition, now);
        self.store.save(&key, &record).await?;

        let email_status = self.notify(&key, &mut record, &decision, None, now).await?;

        Ok(SubmitResponse {
            job_key: key,
            status: record.status,
            email_status,
        })
    }

    /// [`callback`](Self::callback) with an explicit clock.
    pub async fn callback_at(
        &self,
        req: CallbackRequest,
        now: DateTime<Utc>,
    ) -> Result<CallbackAck, DispatchError> {
        let action = JobAction::parse_callback(&req.action)?;
        identity::validate_id("session_id", &req.session_id)?;
        identity::validate_id("job_id", &req.job_id)?;
        let key = self.find_key(&req.session_id, &req.job_id).await?;

        let _section = self.lock_record(&key).await?;
        let mut record = self.store.load(&key).await?;

        if record.time_request.is_none() {
            record.time_request = req.time_original_request;
        }
        if let Some(claims) = &req.credential {
            record.refresh_prefs(claims, &self.pref_defaults);
        }

        let event = CallbackEvent {
            node_id: req.node_id.clone(),
            action,
            message: req.message.clone(),
            timestamp: now,
        };
        let transition = state::apply(&mut record, event.clone());
        self.store.append_event(&key, &event).await?;

        if !transition.reached_target() {
            warn!(
                job = %key,
                from = %transition.from,
                action = %action,
                "Ignoring status change not allowed by the job lifecycle"
            );
        }
        info!(
            job = %key,
            action = %action,
            from = %transition.from,
            to = %transition.to,
            changed = transition.changed(),
            node = %req.node_id,
            "Callback applied"
        );

        let decision = throttle::evaluate(&record, &transition, now);
        self.store.save(&key, &record).await?;

        let message = Some(req.message.as_str());
        let email_status = self.notify(&key, &mut record, &decision, message, now).await?;

        Ok(CallbackAck {
            job_key: key,
            status: record.status,
            email_status,
        })
    }

    /// Resolve the key for a submission, creating the record if it is new.
    async fn resolve_submission(
        &self,
        req: &SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<JobKey, DispatchError> {
        let resolver = IdentityResolver::new(self.store.as_ref());
        let request = IdentityRequest {
            session_id: req.session_id.as_deref(),
            job_id: req.job_id.as_deref(),
            params: &req.params,
            context: req.context.as_deref(),
        };

        if !req.is_fresh() {
            return Ok(resolver.resolve(request).await?.key);
        }

        let job_id = identity::compute_job_id(&req.params);
        let _section = self.lock_identity(&job_id).await?;

        let resolved = resolver.resolve(request).await?;
        if resolved.is_new {
            let prefs = NotificationPrefs::from_claims(req.credential.as_ref(), &self.pref_defaults);
            let record = JobRecord::new(
                req.context.clone(),
                req.params.clone(),
                prefs,
                req.time_request,
                now,
            );
            self.store.create(&resolved.key, record).await?;
        }
        Ok(resolved.key)
    }

    async fn lock_record(&self, key: &JobKey) -> Result<CriticalSection, DispatchError> {
        let local = self.locks.lock(&key.lock_name()).await;
        let store = self.store.lock_record(key).await?;
        Ok(CriticalSection {
            _store: store,
            _local: local,
        })
    }

    async fn lock_identity(&self, job_id: &str) -> Result<CriticalSection, DispatchError> {
        let local = self.locks.lock(&identity::identity_lock_name(job_id)).await;
        let store = self.store.lock_identity(job_id).await?;
        Ok(CriticalSection {
            _store: store,
            _local: local,
        })
    }

    async fn find_key(&self, session_id: &str, job_id: &str) -> Result<JobKey, DispatchError> {
        self.store
            .find(session_id, job_id)
            .await?
            .ok_or_else(|| DispatchError::RecordNotFound {
                session_id: session_id.to_string(),
                job_id: job_id.to_string(),
            })
    }

    /// Act on a throttling decision. Delivery failures are recorded in the
    /// record, never returned; only persistence failures are.
    async fn notify(
        &self,
        key: &JobKey,
        record: &mut JobRecord,
        decision: &NotificationDecision,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, DispatchError> {
        let kind = match decision.kind {
            Some(kind) if decision.send => kind,
            _ => {
                debug!(job = %key, reason = %decision.reason, "Notification suppressed");
                return Ok(None);
            }
        };

        let sent = match self.deliver(key, record, kind, message, now).await {
            Ok(()) => {
                info!(job = %key, kind = %kind, reason = %decision.reason, "Notification sent");
                true
            }
            Err(e) => {
                let err = DispatchError::NotificationDeliveryFailed(e);
                warn!(job = %key, kind = %kind, error = %err, "Notification not delivered");
                false
            }
        };

        let entry = EmailHistoryEntry {
            kind,
            timestamp: now,
            sent,
        };
        self.store.append_email_history(key, &entry).await?;
        record.email_history.push(entry);

        let email_status = if sent { EMAIL_SENT } else { EMAIL_FAILED };
        record.email_status = Some(email_status.to_string());
        self.store.save(key, record).await?;

        Ok(Some(email_status.to_string()))
    }

    async fn deliver(
        &self,
        key: &JobKey,
        record: &JobRecord,
        kind: EmailKind,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        let to = record
            .prefs
            .recipient
            .as_deref()
            .ok_or_else(|| NotifyError::NoRecipient {
                job_id: key.job_id.clone(),
            })?;

        let subject = SubjectParams::for_job(key, record, kind);
        let body = BodyParams::for_job(key, record, kind, message, now);

        match tokio::time::timeout(self.email_timeout, self.sender.send(to, &subject, &body)).await
        {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout {
                timeout: self.email_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::email::RecordingEmailSender;
    use crate::store::FileJobStore;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use serde_json::json;

    /// Sender that never finishes within any reasonable timeout.
    struct StalledEmailSender;

    #[async_trait]
    impl EmailSender for StalledEmailSender {
        async fn send(
            &self,
            _to: &str,
            _subject: &SubjectParams,
            _body: &BodyParams,
        ) -> Result<(), NotifyError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        dispatcher: JobDispatcher,
        sender: Arc<RecordingEmailSender>,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path().join("jobs")).await.unwrap();
        let sender = Arc::new(RecordingEmailSender::new());
        let dispatcher = JobDispatcher::new(
            Arc::new(store),
            sender.clone(),
            &DispatcherConfig::default(),
        );
        Harness {
            _dir: dir,
            dispatcher,
            sender,
        }
    }

    fn claims() -> NotificationClaims {
        NotificationClaims {
            email: Some("user@example.org".into()),
            tem: Some(0),
            mstout: Some(true),
            mssub: Some(true),
            intsub: Some(15),
        }
    }

    fn submission(credential: Option<NotificationClaims>) -> SubmitRequest {
        SubmitRequest {
            params: json!({"instrument": "isgri", "product_type": "isgri_image"}),
            credential,
            context: Some("browser-1".into()),
            ..SubmitRequest::default()
        }
    }

    fn callback(key: &JobKey, action: &str) -> CallbackRequest {
        CallbackRequest {
            job_id: key.job_id.clone(),
            session_id: key.session_id.clone(),
            action: action.into(),
            node_id: "node-1".into(),
            message: String::new(),
            credential: None,
            time_original_request: None,
        }
    }

    #[tokio::test]
    async fn half_given_identity_is_rejected() {
        let h = harness().await;
        let req = SubmitRequest {
            job_id: Some("ABC".into()),
            ..submission(None)
        };
        assert!(matches!(
            h.dispatcher.submit(req).await,
            Err(DispatchError::InvalidIdentity { .. })
        ));
    }

    #[tokio::test]
    async fn session_id_without_job_id_is_rejected() {
        let h = harness().await;
        let req = SubmitRequest {
            session_id: Some("S1".into()),
            ..submission(None)
        };
        let err = h.dispatcher.submit(req).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidIdentity { .. }));
        assert!(err.to_string().contains("session_id given without job_id"));
    }

    #[tokio::test]
    async fn poll_of_unknown_key_is_not_found() {
        let h = harness().await;
        let req = SubmitRequest {
            session_id: Some("S1".into()),
            job_id: Some("J1".into()),
            ..submission(None)
        };
        assert!(matches!(
            h.dispatcher.submit(req).await,
            Err(DispatchError::RecordNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_action_does_not_mutate() {
        let h = harness().await;
        let resp = h.dispatcher.submit(submission(None)).await.unwrap();
        let err = h
            .dispatcher
            .callback(callback(&resp.job_key, "explode"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownAction { .. }));

        let rec = h
            .dispatcher
            .status(&resp.job_key.session_id, &resp.job_key.job_id)
            .await
            .unwrap();
        assert!(rec.callback_events.is_empty());
        assert_eq!(rec.status, JobStatus::Submitted);
    }

    #[tokio::test]
    async fn public_submission_has_no_email_status() {
        let h = harness().await;
        let resp = h.dispatcher.submit(submission(None)).await.unwrap();
        assert_eq!(resp.status, JobStatus::Submitted);
        assert!(resp.email_status.is_none());

        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("email_status").is_none());

        let ack = h
            .dispatcher
            .callback(callback(&resp.job_key, "failed"))
            .await
            .unwrap();
        assert_eq!(ack.status, JobStatus::Failed);
        assert!(ack.email_status.is_none());

        let rec = h
            .dispatcher
            .status(&resp.job_key.session_id, &resp.job_key.job_id)
            .await
            .unwrap();
        assert!(rec.email_history.is_empty());
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_is_recorded_not_raised() {
        let h = harness().await;
        h.sender.set_failing(true);
        let t0 = Utc::now();

        let resp = h
            .dispatcher
            .submit_at(submission(Some(claims())), t0)
            .await
            .unwrap();
        assert_eq!(resp.status, JobStatus::Submitted);
        assert_eq!(resp.email_status.as_deref(), Some(EMAIL_FAILED));

        let rec = h
            .dispatcher
            .status(&resp.job_key.session_id, &resp.job_key.job_id)
            .await
            .unwrap();
        assert_eq!(rec.email_status.as_deref(), Some(EMAIL_FAILED));
        assert_eq!(rec.email_history.len(), 1);
        assert!(!rec.email_history[0].sent);

        // The kind was not marked sent, so the next submission tries again.
        h.sender.set_failing(false);
        let again = h
            .dispatcher
            .submit_at(submission(Some(claims())), t0 + TimeDelta::minutes(1))
            .await
            .unwrap();
        assert_eq!(again.job_key, resp.job_key);
        assert_eq!(again.email_status.as_deref(), Some(EMAIL_SENT));
        assert_eq!(h.sender.count(EmailKind::Submitted), 1);
    }

    #[tokio::test]
    async fn missing_recipient_counts_as_failed_delivery() {
        let h = harness().await;
        let credential = NotificationClaims {
            email: None,
            ..claims()
        };
        let resp = h
            .dispatcher
            .submit(submission(Some(credential)))
            .await
            .unwrap();
        assert_eq!(resp.email_status.as_deref(), Some(EMAIL_FAILED));
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn poll_after_progress_sends_nothing() {
        let h = harness().await;
        let t0 = Utc::now();
        let resp = h
            .dispatcher
            .submit_at(submission(Some(claims())), t0)
            .await
            .unwrap();
        h.dispatcher
            .callback_at(callback(&resp.job_key, "progress"), t0)
            .await
            .unwrap();

        let poll = SubmitRequest {
            session_id: Some(resp.job_key.session_id.clone()),
            job_id: Some(resp.job_key.job_id.clone()),
            ..submission(Some(claims()))
        };
        let polled = h
            .dispatcher
            .submit_at(poll, t0 + TimeDelta::hours(2))
            .await
            .unwrap();
        assert_eq!(polled.status, JobStatus::Progress);
        assert!(polled.email_status.is_none());
        assert_eq!(h.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn callback_fills_missing_request_time() {
        let h = harness().await;
        let t0 = Utc::now();
        let resp = h.dispatcher.submit_at(submission(None), t0).await.unwrap();

        let mut req = callback(&resp.job_key, "progress");
        req.time_original_request = Some(t0 - TimeDelta::minutes(3));
        h.dispatcher.callback_at(req, t0).await.unwrap();

        let rec = h
            .dispatcher
            .status(&resp.job_key.session_id, &resp.job_key.job_id)
            .await
            .unwrap();
        assert_eq!(rec.time_request, Some(t0 - TimeDelta::minutes(3)));
    }

    #[tokio::test]
    async fn stalled_delivery_times_out_and_keeps_the_transition() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path().join("jobs")).await.unwrap();
        let config = DispatcherConfig {
            email_timeout: Duration::from_millis(50),
            ..DispatcherConfig::default()
        };
        let dispatcher = JobDispatcher::new(Arc::new(store), Arc::new(StalledEmailSender), &config);
        let t0 = Utc::now();

        let resp = dispatcher
            .submit_at(submission(Some(claims())), t0)
            .await
            .unwrap();
        assert_eq!(resp.email_status.as_deref(), Some(EMAIL_FAILED));

        let ack = dispatcher
            .callback_at(callback(&resp.job_key, "done"), t0 + TimeDelta::minutes(1))
            .await
            .unwrap();
        assert_eq!(ack.status, JobStatus::Done);
        assert_eq!(ack.email_status.as_deref(), Some(EMAIL_FAILED));

        let rec = dispatcher
            .status(&resp.job_key.session_id, &resp.job_key.job_id)
            .await
            .unwrap();
        assert_eq!(rec.status, JobStatus::Done);
        assert_eq!(rec.email_status.as_deref(), Some(EMAIL_FAILED));
        let last = rec.email_history.last().unwrap();
        assert_eq!(last.kind, EmailKind::Done);
        assert!(!last.sent);

        // The section was released: the next callback gets in promptly.
        let next = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.callback_at(callback(&resp.job_key, "done"), t0 + TimeDelta::minutes(2)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(next.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn owner_resubmission_refreshes_prefs() {
        let h = harness().await;
        let t0 = Utc::now();
        let resp = h
            .dispatcher
            .submit_at(submission(Some(claims())), t0)
            .await
            .unwrap();

        let updated = NotificationClaims {
            email: Some("new@example.org".into()),
            tem: Some(45),
            ..claims()
        };
        h.dispatcher
            .submit_at(submission(Some(updated)), t0 + TimeDelta::minutes(1))
            .await
            .unwrap();

        let rec = h
            .dispatcher
            .status(&resp.job_key.session_id, &resp.job_key.job_id)
            .await
            .unwrap();
        assert_eq!(rec.prefs.recipient.as_deref(), Some("new@example.org"));
        assert_eq!(rec.prefs.threshold_minutes, 45);
    }
}
