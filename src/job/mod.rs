//! Job identity, records, and the callback state machine.

pub mod identity;
pub mod record;
pub mod state;

pub use identity::{IdentityRequest, IdentityResolver, JobKey, ResolvedKey, compute_job_id};
pub use record::{
    CallbackEvent, EmailHistoryEntry, EmailKind, JobRecord, NotificationPrefs,
};
pub use state::{JobAction, JobStatus, Transition};
