//! Job identity: content-derived job ids, session ids, and collision aliasing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::store::JobStore;

/// Request parameters that scope a request to a session rather than describe
/// the analysis. They never contribute to the job id.
pub const SESSION_SCOPED_PARAMS: &[&str] = &[
    "session_id",
    "job_id",
    "token",
    "time_request",
    "query_status",
    "off_line",
    "api",
    "dry_run",
];

/// Hex characters kept from the parameter digest.
const JOB_ID_LEN: usize = 16;

/// Identity of one job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub session_id: String,
    pub job_id: String,
    /// Derived identity handed out on a collision.
    #[serde(default)]
    pub aliased: bool,
}

impl JobKey {
    pub fn canonical(session_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            job_id: job_id.into(),
            aliased: false,
        }
    }

    pub fn aliased(session_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            aliased: true,
            ..Self::canonical(session_id, job_id)
        }
    }

    /// Name of the per-record critical section.
    pub fn lock_name(&self) -> String {
        format!("record:{}:{}", self.job_id, self.session_id)
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job_id, self.session_id)?;
        if self.aliased {
            write!(f, " (aliased)")?;
        }
        Ok(())
    }
}

/// Name of the critical section guarding identity resolution for `job_id`.
pub fn identity_lock_name(job_id: &str) -> String {
    format!("identity:{job_id}")
}

/// Mint a new session id.
pub fn mint_session_id() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

/// Deterministic job id for a set of semantic request parameters.
///
/// Object keys are hashed in sorted order, so parameter order never matters.
pub fn compute_job_id(params: &serde_json::Value) -> String {
    let significant = match params {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(k, _)| !SESSION_SCOPED_PARAMS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    };

    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&significant).as_bytes());
    let digest = hasher.finalize();

    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<String>()
        .chars()
        .take(JOB_ID_LEN)
        .collect()
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Ids that reach the filesystem must be plain tokens.
pub fn validate_id(field: &str, value: &str) -> Result<(), DispatchError> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DispatchError::InvalidIdentity {
            reason: format!("{field} must be a non-empty alphanumeric token"),
        })
    }
}

/// Outcome of identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: JobKey,
    /// No record exists yet for `key`; the caller creates it.
    pub is_new: bool,
}

/// An identity lookup for one inbound submission.
#[derive(Debug, Clone, Copy)]
pub struct IdentityRequest<'a> {
    pub session_id: Option<&'a str>,
    pub job_id: Option<&'a str>,
    pub params: &'a serde_json::Value,
    /// Session context of the submitter.
    pub context: Option<&'a str>,
}

/// Decides whether a submission is new, a repeat, or a collision.
pub struct IdentityResolver<'a> {
    store: &'a dyn JobStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        Self { store }
    }

    /// Resolve the key for a submission.
    ///
    /// Callers resolving a request without ids must hold the identity lock
    /// for the computed job id until any new record has been created.
    pub async fn resolve(&self, req: IdentityRequest<'_>) -> Result<ResolvedKey, DispatchError> {
        let session_id = req.session_id.filter(|s| !s.is_empty());
        let job_id = req.job_id.filter(|s| !s.is_empty());

        match (session_id, job_id) {
            (Some(session_id), Some(job_id)) => {
                validate_id("session_id", session_id)?;
                validate_id("job_id", job_id)?;
                let key = self.store.find(session_id, job_id).await?.ok_or_else(|| {
                    DispatchError::RecordNotFound {
                        session_id: session_id.to_string(),
                        job_id: job_id.to_string(),
                    }
                })?;
                Ok(ResolvedKey { key, is_new: false })
            }
            (None, None) => self.resolve_fresh(req.params, req.context).await,
            (Some(_), None) => Err(DispatchError::InvalidIdentity {
                reason: "session_id given without job_id".into(),
            }),
            (None, Some(_)) => Err(DispatchError::InvalidIdentity {
                reason: "job_id given without session_id".into(),
            }),
        }
    }

    async fn resolve_fresh(
        &self,
        params: &serde_json::Value,
        context: Option<&str>,
    ) -> Result<ResolvedKey, DispatchError> {
        let job_id = compute_job_id(params);

        let Some(canonical) = self.store.find_canonical(&job_id).await? else {
            return Ok(ResolvedKey {
                key: JobKey::canonical(mint_session_id(), job_id),
                is_new: true,
            });
        };

        let existing = self.store.load(&canonical).await?;
        if existing.owner_context.as_deref() == context || existing.status.is_terminal() {
            return Ok(ResolvedKey {
                key: canonical,
                is_new: false,
            });
        }

        for alias in self.store.list_aliases(&job_id).await? {
            let record = self.store.load(&alias).await?;
            if record.owner_context.as_deref() == context {
                return Ok(ResolvedKey {
                    key: alias,
                    is_new: false,
                });
            }
        }

        let key = JobKey::aliased(mint_session_id(), job_id);
        tracing::info!(
            job_id = %key.job_id,
            session_id = %key.session_id,
            owner_session = %canonical.session_id,
            "Job id collides with an active job of another session, aliasing"
        );
        Ok(ResolvedKey { key, is_new: true })
    }
}
