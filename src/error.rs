//! Error types for the analysis dispatcher.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
}

/// Errors surfaced to callers of `submit`, `callback` and `status`.
///
/// Identity and action errors are raised before any record is touched.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid job identity: {reason}")]
    InvalidIdentity { reason: String },

    #[error("Unknown callback action: {action}")]
    UnknownAction { action: String },

    #[error("Job record not found: session {session_id}, job {job_id}")]
    RecordNotFound { session_id: String, job_id: String },

    #[error("Notification delivery failed: {0}")]
    NotificationDeliveryFailed(#[from] NotifyError),

    #[error("Store IO error: {0}")]
    StoreIo(StoreError),
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { session_id, job_id } => {
                Self::RecordNotFound { session_id, job_id }
            }
            other => Self::StoreIo(other),
        }
    }
}

/// Job record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: session {session_id}, job {job_id}")]
    NotFound { session_id: String, job_id: String },

    #[error("Record already exists: session {session_id}, job {job_id}")]
    AlreadyExists { session_id: String, job_id: String },

    #[error("Serialization error in {path}: {reason}")]
    Serialization { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Email dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("No recipient address for job {job_id}")]
    NoRecipient { job_id: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to send email: {reason}")]
    SendFailed { reason: String },

    #[error("Email sending timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_record_not_found() {
        let err: DispatchError = StoreError::NotFound {
            session_id: "S1".into(),
            job_id: "J1".into(),
        }
        .into();
        assert!(matches!(err, DispatchError::RecordNotFound { .. }));
    }

    #[test]
    fn store_io_maps_to_store_io() {
        let err: DispatchError =
            StoreError::Io(std::io::Error::other("disk full")).into();
        assert!(matches!(err, DispatchError::StoreIo(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
