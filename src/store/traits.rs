//! `JobStore` trait — the async interface to job record persistence.

use async_trait::async_trait;

use super::locks::StoreLock;
use crate::error::StoreError;
use crate::job::{CallbackEvent, EmailHistoryEntry, JobKey, JobRecord};

/// Durable storage of one record per job key.
///
/// Record locations are derived from the key alone, so several dispatcher
/// processes sharing a backend can find each other's records without an index.
/// Callers serialize mutations of one key by holding both a `KeyedLocks`
/// guard and the store lock for that key.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load the full record, logs included.
    async fn load(&self, key: &JobKey) -> Result<JobRecord, StoreError>;

    /// Persist a new record. Fails with `AlreadyExists` if one is present.
    async fn create(&self, key: &JobKey, initial: JobRecord) -> Result<JobRecord, StoreError>;

    /// Atomically replace the status snapshot and make every log entry held by
    /// `record` durable.
    async fn save(&self, key: &JobKey, record: &JobRecord) -> Result<(), StoreError>;

    /// Append one entry to the callback event log.
    async fn append_event(&self, key: &JobKey, event: &CallbackEvent) -> Result<(), StoreError>;

    /// Append one entry to the email history log.
    async fn append_email_history(
        &self,
        key: &JobKey,
        entry: &EmailHistoryEntry,
    ) -> Result<(), StoreError>;

    // ── Cross-process locks ─────────────────────────────────────────

    /// Exclusive lock over mutations of an existing record.
    async fn lock_record(&self, key: &JobKey) -> Result<StoreLock, StoreError>;

    /// Exclusive lock over identity resolution and record creation for `job_id`.
    async fn lock_identity(&self, job_id: &str) -> Result<StoreLock, StoreError>;

    // ── Lookups ─────────────────────────────────────────────────────

    /// Find the record for a session/job pair in either layout.
    async fn find(&self, session_id: &str, job_id: &str) -> Result<Option<JobKey>, StoreError>;

    /// The unaliased record for `job_id`, if any.
    async fn find_canonical(&self, job_id: &str) -> Result<Option<JobKey>, StoreError>;

    /// Every aliased record for `job_id`.
    async fn list_aliases(&self, job_id: &str) -> Result<Vec<JobKey>, StoreError>;
}
