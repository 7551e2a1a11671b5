//! Notification throttling policy.
//!
//! Decides whether the event just applied to a record warrants an email.
//! The decision only reads the record; recording the outcome is the caller's
//! job.

use chrono::{DateTime, TimeDelta, Utc};

use crate::job::{EmailKind, JobAction, JobRecord, JobStatus, Transition};

/// Pass/suppress verdict for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDecision {
    pub send: bool,
    pub kind: Option<EmailKind>,
    pub reason: String,
}

impl NotificationDecision {
    fn send(kind: EmailKind, reason: impl Into<String>) -> Self {
        Self {
            send: true,
            kind: Some(kind),
            reason: reason.into(),
        }
    }

    fn suppress(kind: Option<EmailKind>, reason: impl Into<String>) -> Self {
        Self {
            send: false,
            kind,
            reason: reason.into(),
        }
    }
}

/// Evaluate the policy for `transition`, already applied to `record`.
pub fn evaluate(
    record: &JobRecord,
    transition: &Transition,
    now: DateTime<Utc>,
) -> NotificationDecision {
    let prefs = &record.prefs;

    if !prefs.email_enabled {
        return NotificationDecision::suppress(None, "public request");
    }

    match (transition.action, transition.to) {
        (JobAction::New, JobStatus::Submitted) => evaluate_submission(record, now),
        (JobAction::Done, JobStatus::Done) => evaluate_terminal(record, EmailKind::Done, now),
        (JobAction::Failed, JobStatus::Failed) => {
            evaluate_terminal(record, EmailKind::Failed, now)
        }
        (JobAction::Progress | JobAction::Ready, _) => NotificationDecision::suppress(
            None,
            format!("no email for {} events", transition.action),
        ),
        (action, status) => NotificationDecision::suppress(
            None,
            format!("{action} event left the job {status}"),
        ),
    }
}

fn evaluate_submission(record: &JobRecord, now: DateTime<Utc>) -> NotificationDecision {
    let prefs = &record.prefs;
    let kind = EmailKind::Submitted;

    if !prefs.notify_on_submit {
        return NotificationDecision::suppress(Some(kind), "submission emails disabled");
    }

    match record.last_sent(kind) {
        None => NotificationDecision::send(kind, "first submission"),
        Some(last) => {
            let interval = minutes(prefs.resubmit_interval_minutes);
            if now - last.timestamp > interval {
                NotificationDecision::send(kind, "resubmission after interval")
            } else {
                NotificationDecision::suppress(Some(kind), "resubmission within interval")
            }
        }
    }
}

fn evaluate_terminal(
    record: &JobRecord,
    kind: EmailKind,
    now: DateTime<Utc>,
) -> NotificationDecision {
    let prefs = &record.prefs;

    if record.last_sent(kind).is_some() {
        return NotificationDecision::suppress(Some(kind), format!("{kind} email already sent"));
    }
    if !prefs.notify_on_terminal {
        return NotificationDecision::suppress(Some(kind), "completion emails disabled");
    }
    if now - record.started_at() < minutes(prefs.threshold_minutes) {
        return NotificationDecision::suppress(Some(kind), "job finished too fast");
    }

    NotificationDecision::send(kind, format!("job {kind}"))
}

fn minutes(value: u32) -> TimeDelta {
    TimeDelta::minutes(i64::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefDefaults;
    use crate::credential::NotificationClaims;
    use crate::job::{EmailHistoryEntry, NotificationPrefs, state};

    fn claims(tem: u32, intsub: u32) -> NotificationClaims {
        NotificationClaims {
            email: Some("user@example.org".into()),
            tem: Some(tem),
            mstout: Some(true),
            mssub: Some(true),
            intsub: Some(intsub),
        }
    }

    fn record_at(claims: Option<&NotificationClaims>, start: DateTime<Utc>) -> JobRecord {
        JobRecord::new(
            None,
            serde_json::json!({}),
            NotificationPrefs::from_claims(claims, &PrefDefaults::default()),
            Some(start),
            start,
        )
    }

    fn transition(action: JobAction, from: JobStatus, to: JobStatus) -> Transition {
        Transition { action, from, to }
    }

    fn sent(rec: &mut JobRecord, kind: EmailKind, at: DateTime<Utc>) {
        rec.email_history.push(EmailHistoryEntry {
            kind,
            timestamp: at,
            sent: true,
        });
    }

    #[test]
    fn public_request_never_sends() {
        let t0 = Utc::now();
        let rec = record_at(None, t0);
        for action in [JobAction::New, JobAction::Done, JobAction::Failed] {
            let to = action.target_status();
            let d = evaluate(&rec, &transition(action, JobStatus::Submitted, to), t0);
            assert!(!d.send);
            assert_eq!(d.reason, "public request");
        }
    }

    #[test]
    fn first_submission_sends() {
        let t0 = Utc::now();
        let rec = record_at(Some(&claims(0, 15)), t0);
        let d = evaluate(
            &rec,
            &transition(JobAction::New, JobStatus::Submitted, JobStatus::Submitted),
            t0,
        );
        assert!(d.send);
        assert_eq!(d.kind, Some(EmailKind::Submitted));
    }

    #[test]
    fn submission_respects_mstout() {
        let t0 = Utc::now();
        let mut c = claims(0, 15);
        c.mstout = Some(false);
        let rec = record_at(Some(&c), t0);
        let d = evaluate(
            &rec,
            &transition(JobAction::New, JobStatus::Submitted, JobStatus::Submitted),
            t0,
        );
        assert!(!d.send);
    }

    #[test]
    fn resubmission_throttled_by_intsub() {
        let t0 = Utc::now();
        let mut rec = record_at(Some(&claims(0, 15)), t0);
        sent(&mut rec, EmailKind::Submitted, t0);
        let t = transition(JobAction::New, JobStatus::Submitted, JobStatus::Submitted);

        assert!(!evaluate(&rec, &t, t0 + TimeDelta::minutes(10)).send);
        assert!(!evaluate(&rec, &t, t0 + TimeDelta::minutes(15)).send);
        assert!(evaluate(&rec, &t, t0 + TimeDelta::minutes(16)).send);
    }

    #[test]
    fn failed_delivery_does_not_count() {
        let t0 = Utc::now();
        let mut rec = record_at(Some(&claims(0, 15)), t0);
        rec.email_history.push(EmailHistoryEntry {
            kind: EmailKind::Submitted,
            timestamp: t0,
            sent: false,
        });
        let t = transition(JobAction::New, JobStatus::Submitted, JobStatus::Submitted);
        let d = evaluate(&rec, &t, t0 + TimeDelta::minutes(1));
        assert!(d.send);
        assert_eq!(d.reason, "first submission");
    }

    #[test]
    fn done_sends_once() {
        let t0 = Utc::now();
        let mut rec = record_at(Some(&claims(0, 15)), t0);
        let t = transition(JobAction::Done, JobStatus::Progress, JobStatus::Done);
        assert!(evaluate(&rec, &t, t0).send);

        sent(&mut rec, EmailKind::Done, t0);
        let dup = transition(JobAction::Done, JobStatus::Done, JobStatus::Done);
        let d = evaluate(&rec, &dup, t0 + TimeDelta::hours(5));
        assert!(!d.send);
        assert_eq!(d.reason, "done email already sent");
    }

    #[test]
    fn too_fast_jobs_are_suppressed() {
        let t0 = Utc::now();
        let rec = record_at(Some(&claims(30, 5)), t0);
        let t = transition(JobAction::Done, JobStatus::Progress, JobStatus::Done);
        let d = evaluate(&rec, &t, t0 + TimeDelta::minutes(10));
        assert!(!d.send);
        assert_eq!(d.reason, "job finished too fast");
        assert!(evaluate(&rec, &t, t0 + TimeDelta::minutes(31)).send);
    }

    #[test]
    fn failed_is_gated_like_done_with_its_own_history() {
        let t0 = Utc::now();
        let mut rec = record_at(Some(&claims(30, 5)), t0);
        sent(&mut rec, EmailKind::Done, t0);
        let t = transition(JobAction::Failed, JobStatus::Ready, JobStatus::Failed);

        assert!(!evaluate(&rec, &t, t0 + TimeDelta::minutes(1)).send);
        let d = evaluate(&rec, &t, t0 + TimeDelta::minutes(45));
        assert!(d.send);
        assert_eq!(d.kind, Some(EmailKind::Failed));
    }

    #[test]
    fn terminal_respects_mssub() {
        let t0 = Utc::now();
        let mut c = claims(0, 5);
        c.mssub = Some(false);
        let rec = record_at(Some(&c), t0);
        let t = transition(JobAction::Done, JobStatus::Progress, JobStatus::Done);
        assert!(!evaluate(&rec, &t, t0).send);
    }

    #[test]
    fn unknown_request_time_falls_back_to_creation() {
        let t0 = Utc::now();
        let mut rec = record_at(Some(&claims(0, 5)), t0);
        rec.time_request = None;
        let t = transition(JobAction::Done, JobStatus::Submitted, JobStatus::Done);
        assert!(evaluate(&rec, &t, t0).send);
    }

    #[test]
    fn progress_never_sends() {
        let t0 = Utc::now();
        let rec = record_at(Some(&claims(0, 5)), t0);
        for action in [JobAction::Progress, JobAction::Ready] {
            let t = transition(action, JobStatus::Submitted, action.target_status());
            assert!(!evaluate(&rec, &t, t0 + TimeDelta::hours(1)).send);
        }
    }

    #[test]
    fn done_after_failed_is_suppressed() {
        let t0 = Utc::now();
        let mut rec = record_at(Some(&claims(0, 5)), t0);
        state::apply_submission(&mut rec, t0);
        rec.status = JobStatus::Failed;
        let t = transition(JobAction::Done, JobStatus::Failed, JobStatus::Failed);
        assert!(!evaluate(&rec, &t, t0).send);
    }
}
