//! Notification claims carried by a decoded user credential.
//!
//! Token signature checking happens upstream; this module only sees the
//! claims that drive email notifications.

use serde::{Deserialize, Serialize};

/// Decoded notification claims. Missing fields fall back to configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationClaims {
    /// Recipient address.
    #[serde(default)]
    pub email: Option<String>,
    /// Minimum job duration, in minutes, before a terminal email is sent.
    #[serde(default)]
    pub tem: Option<u32>,
    /// Email on submission.
    #[serde(default)]
    pub mstout: Option<bool>,
    /// Email on done/failed.
    #[serde(default)]
    pub mssub: Option<bool>,
    /// Minutes between repeated submission emails.
    #[serde(default)]
    pub intsub: Option<u32>,
}

impl NotificationClaims {
    /// Claims for `email` with every preference left to defaults.
    #[cfg(test)]
    pub(crate) fn for_recipient(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }
}
