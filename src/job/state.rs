//! Callback state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{CallbackEvent, JobRecord};
use crate::error::DispatchError;

/// Status of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted by the dispatcher, no worker feedback yet.
    Submitted,
    /// A worker reported progress.
    Progress,
    /// Products are ready, finalization pending.
    Ready,
    /// Job completed.
    Done,
    /// Job failed.
    Failed,
}

impl JobStatus {
    /// Check if this status allows moving to `target`.
    ///
    /// Self-transitions are allowed for the non-terminal states so repeated
    /// progress reports and resubmissions are accepted.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Submitted, Submitted | Progress | Ready | Done | Failed)
                | (Progress, Progress | Ready | Done | Failed)
                | (Ready, Ready | Done | Failed)
        )
    }

    /// `done` and `failed` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Progress => "progress",
            Self::Ready => "ready",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Action carried by an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Initial or repeated submission from a client.
    New,
    Progress,
    Ready,
    Done,
    Failed,
}

impl JobAction {
    /// Parse the action of a worker callback.
    ///
    /// `new` is a client submission, never a callback, so it is rejected here.
    pub fn parse_callback(raw: &str) -> Result<Self, DispatchError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "progress" => Ok(Self::Progress),
            "ready" => Ok(Self::Ready),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(DispatchError::UnknownAction {
                action: raw.to_string(),
            }),
        }
    }

    /// Status this action moves a job into.
    pub fn target_status(&self) -> JobStatus {
        match self {
            Self::New => JobStatus::Submitted,
            Self::Progress => JobStatus::Progress,
            Self::Ready => JobStatus::Ready,
            Self::Done => JobStatus::Done,
            Self::Failed => JobStatus::Failed,
        }
    }
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Progress => "progress",
            Self::Ready => "ready",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Outcome of applying one event to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: JobAction,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Transition {
    /// The record ended up in the status the action asked for.
    pub fn reached_target(&self) -> bool {
        self.to == self.action.target_status()
    }

    /// The status value actually changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Apply a worker callback to `record`.
///
/// The event is always appended to the audit log. The status only moves when
/// the transition is valid; terminal re-deliveries and regressions leave it
/// untouched.
pub fn apply(record: &mut JobRecord, event: CallbackEvent) -> Transition {
    let transition = step(record, event.action, event.timestamp);
    record.callback_events.push(event);
    transition
}

/// Apply a client submission to `record`. Submissions are not logged as
/// callback events.
pub fn apply_submission(record: &mut JobRecord, now: DateTime<Utc>) -> Transition {
    step(record, JobAction::New, now)
}

fn step(record: &mut JobRecord, action: JobAction, now: DateTime<Utc>) -> Transition {
    let from = record.status;
    let target = action.target_status();

    let to = if from.can_transition_to(target) {
        target
    } else {
        from
    };

    record.status = to;
    record.updated_at = now;

    Transition { action, from, to }
}
