//! Filesystem-backed job record store.
//!
//! Layout under the root directory:
//! - `<job_id>/<session_id>/` canonical record
//! - `<job_id>/<session_id>.aliased/` aliased record
//!
//! Each record directory holds `status.json` (snapshot, replaced atomically),
//! `events.jsonl` and `emails.jsonl` (append-only logs), plus the `.lock`
//! file other processes wait on. `<job_id>/.identity.lock` guards creation of
//! new records for that job id.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use super::locks::StoreLock;
use super::log::AppendLog;
use super::traits::JobStore;
use crate::error::StoreError;
use crate::job::{
    CallbackEvent, EmailHistoryEntry, JobKey, JobRecord, JobStatus, NotificationPrefs,
};

const STATUS_FILE: &str = "status.json";
const EVENTS_FILE: &str = "events.jsonl";
const EMAILS_FILE: &str = "emails.jsonl";
const RECORD_LOCK_FILE: &str = ".lock";
const IDENTITY_LOCK_FILE: &str = ".identity.lock";
const ALIAS_SUFFIX: &str = ".aliased";

/// Everything in a record except its logs.
#[derive(Debug, Serialize, Deserialize)]
struct StatusSnapshot {
    status: JobStatus,
    owner_context: Option<String>,
    params: serde_json::Value,
    time_request: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    prefs: NotificationPrefs,
    email_status: Option<String>,
}

impl From<&JobRecord> for StatusSnapshot {
    fn from(record: &JobRecord) -> Self {
        Self {
            status: record.status,
            owner_context: record.owner_context.clone(),
            params: record.params.clone(),
            time_request: record.time_request,
            created_at: record.created_at,
            updated_at: record.updated_at,
            prefs: record.prefs.clone(),
            email_status: record.email_status.clone(),
        }
    }
}

impl StatusSnapshot {
    fn into_record(
        self,
        callback_events: Vec<CallbackEvent>,
        email_history: Vec<EmailHistoryEntry>,
    ) -> JobRecord {
        JobRecord {
            status: self.status,
            owner_context: self.owner_context,
            params: self.params,
            time_request: self.time_request,
            created_at: self.created_at,
            updated_at: self.updated_at,
            prefs: self.prefs,
            email_status: self.email_status,
            callback_events,
            email_history,
        }
    }
}

/// Job store rooted at a directory, shareable between processes.
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "Job store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the record for `key`.
    pub fn record_dir(&self, key: &JobKey) -> PathBuf {
        let name = if key.aliased {
            format!("{}{ALIAS_SUFFIX}", key.session_id)
        } else {
            key.session_id.clone()
        };
        self.root.join(&key.job_id).join(name)
    }

    fn events_log(&self, key: &JobKey) -> AppendLog<CallbackEvent> {
        AppendLog::new(self.record_dir(key).join(EVENTS_FILE))
    }

    fn emails_log(&self, key: &JobKey) -> AppendLog<EmailHistoryEntry> {
        AppendLog::new(self.record_dir(key).join(EMAILS_FILE))
    }

    async fn read_snapshot(&self, key: &JobKey) -> Result<StatusSnapshot, StoreError> {
        let path = self.record_dir(key).join(STATUS_FILE);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    session_id: key.session_id.clone(),
                    job_id: key.job_id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|e| StoreError::Serialization {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Write the snapshot to a temp file, then rename it over `status.json`.
    async fn write_snapshot(&self, key: &JobKey, record: &JobRecord) -> Result<(), StoreError> {
        let dir = self.record_dir(key);
        let path = dir.join(STATUS_FILE);
        let tmp_path = dir.join(format!("{STATUS_FILE}.{}.tmp", Uuid::new_v4().simple()));

        let json = serde_json::to_vec_pretty(&StatusSnapshot::from(record)).map_err(|e| {
            StoreError::Serialization {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut file = fs::File::create(&tmp_path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &json).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Record keys under `<root>/<job_id>` in the requested layout.
    async fn record_dirs(
        &self,
        job_id: &str,
        aliased: bool,
    ) -> Result<Vec<JobKey>, StoreError> {
        let job_dir = self.root.join(job_id);
        let mut entries = match fs::read_dir(&job_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !fs::try_exists(entry.path().join(STATUS_FILE)).await? {
                continue;
            }
            match (name.strip_suffix(ALIAS_SUFFIX), aliased) {
                (Some(session_id), true) => keys.push(JobKey::aliased(session_id, job_id)),
                (None, false) => keys.push(JobKey::canonical(name.as_str(), job_id)),
                _ => {}
            }
        }
        keys.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(keys)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn load(&self, key: &JobKey) -> Result<JobRecord, StoreError> {
        let snapshot = self.read_snapshot(key).await?;
        let events = self.events_log(key).read_all().await?;
        let emails = self.emails_log(key).read_all().await?;
        Ok(snapshot.into_record(events, emails))
    }

    async fn create(&self, key: &JobKey, initial: JobRecord) -> Result<JobRecord, StoreError> {
        let dir = self.record_dir(key);
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists {
                    session_id: key.session_id.clone(),
                    job_id: key.job_id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.save(key, &initial).await?;
        tracing::info!(
            job_id = %key.job_id,
            session_id = %key.session_id,
            aliased = key.aliased,
            "Job record created"
        );
        Ok(initial)
    }

    async fn save(&self, key: &JobKey, record: &JobRecord) -> Result<(), StoreError> {
        self.events_log(key)
            .append_missing(&record.callback_events)
            .await?;
        self.emails_log(key)
            .append_missing(&record.email_history)
            .await?;
        self.write_snapshot(key, record).await
    }

    async fn append_event(&self, key: &JobKey, event: &CallbackEvent) -> Result<(), StoreError> {
        self.events_log(key).append(event).await
    }

    async fn append_email_history(
        &self,
        key: &JobKey,
        entry: &EmailHistoryEntry,
    ) -> Result<(), StoreError> {
        self.emails_log(key).append(entry).await
    }

    async fn lock_record(&self, key: &JobKey) -> Result<StoreLock, StoreError> {
        StoreLock::acquire(self.record_dir(key).join(RECORD_LOCK_FILE)).await
    }

    async fn lock_identity(&self, job_id: &str) -> Result<StoreLock, StoreError> {
        let job_dir = self.root.join(job_id);
        fs::create_dir_all(&job_dir).await?;
        StoreLock::acquire(job_dir.join(IDENTITY_LOCK_FILE)).await
    }

    async fn find(&self, session_id: &str, job_id: &str) -> Result<Option<JobKey>, StoreError> {
        for key in [
            JobKey::canonical(session_id, job_id),
            JobKey::aliased(session_id, job_id),
        ] {
            if fs::try_exists(self.record_dir(&key).join(STATUS_FILE)).await? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    async fn find_canonical(&self, job_id: &str) -> Result<Option<JobKey>, StoreError> {
        let keys = self.record_dirs(job_id, false).await?;
        if keys.len() > 1 {
            tracing::warn!(
                job_id,
                count = keys.len(),
                "Multiple canonical records for one job id, using the first"
            );
        }
        Ok(keys.into_iter().next())
    }

    async fn list_aliases(&self, job_id: &str) -> Result<Vec<JobKey>, StoreError> {
        self.record_dirs(job_id, true).await
    }
}
