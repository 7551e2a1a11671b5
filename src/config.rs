//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Defaults applied when a credential omits a notification claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefDefaults {
    /// `tem`: minimum minutes between submission and a terminal email.
    pub threshold_minutes: u32,
    /// `mstout`: email on submission.
    pub notify_on_submit: bool,
    /// `mssub`: email on done/failed.
    pub notify_on_terminal: bool,
    /// `intsub`: minutes before a repeated submission emails again.
    pub resubmit_interval_minutes: u32,
}

impl Default for PrefDefaults {
    fn default() -> Self {
        Self {
            threshold_minutes: 30,
            notify_on_submit: true,
            notify_on_terminal: true,
            resubmit_interval_minutes: 5,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Root directory of the job record store.
    pub store_root: PathBuf,
    /// HTTP port for the routing adapter.
    pub port: u16,
    /// Upper bound on a single email send.
    pub email_timeout: Duration,
    /// Notification defaults.
    pub pref_defaults: PrefDefaults,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("./data/jobs"),
            port: 8080,
            email_timeout: Duration::from_secs(10),
            pref_defaults: PrefDefaults::default(),
        }
    }
}

impl DispatcherConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let pref_defaults = PrefDefaults {
            threshold_minutes: env_parse(
                "DISPATCHER_DEFAULT_TEM",
                defaults.pref_defaults.threshold_minutes,
            ),
            resubmit_interval_minutes: env_parse(
                "DISPATCHER_DEFAULT_INTSUB",
                defaults.pref_defaults.resubmit_interval_minutes,
            ),
            ..defaults.pref_defaults
        };

        Self {
            store_root: std::env::var("DISPATCHER_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_root),
            port: env_parse("DISPATCHER_PORT", defaults.port),
            email_timeout: Duration::from_secs(env_parse(
                "DISPATCHER_EMAIL_TIMEOUT_SECS",
                defaults.email_timeout.as_secs(),
            )),
            pref_defaults,
        }
    }
}

/// SMTP configuration for outbound notification emails.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    ///
    /// `EMAIL_SMTP_HOST` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let smtp_host = std::env::var("EMAIL_SMTP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_SMTP_HOST".into()))?;
        let smtp_port = env_parse("EMAIL_SMTP_PORT", 587u16);
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Ok(Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

/// Parse an optional environment variable, using `default` when it is unset
/// or invalid.
fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    parse_or_default(key, std::env::var(key).ok().as_deref(), default)
}

fn parse_or_default<T>(key: &str, raw: Option<&str>, default: T) -> T
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                key,
                value = raw,
                error = %e,
                default = %default,
                "Invalid config value, using default"
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DispatcherConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.email_timeout, Duration::from_secs(10));
        assert_eq!(config.pref_defaults.threshold_minutes, 30);
        assert_eq!(config.pref_defaults.resubmit_interval_minutes, 5);
        assert!(config.pref_defaults.notify_on_submit);
        assert!(config.pref_defaults.notify_on_terminal);
    }

    #[test]
    fn env_parse_uses_default_when_unset() {
        let value: u32 = env_parse("DISPATCHER_TEST_SURELY_UNSET_VAR", 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn invalid_values_fall_back_to_default() {
        assert_eq!(parse_or_default("DISPATCHER_DEFAULT_TEM", Some("soon"), 30u32), 30);
        assert_eq!(parse_or_default("DISPATCHER_PORT", Some("-1"), 8080u16), 8080);
        assert_eq!(parse_or_default("DISPATCHER_PORT", Some("99999"), 8080u16), 8080);
    }

    #[test]
    fn valid_values_are_trimmed_and_parsed() {
        assert_eq!(parse_or_default("DISPATCHER_DEFAULT_INTSUB", Some(" 12 "), 5u32), 12);
        assert_eq!(parse_or_default("DISPATCHER_DEFAULT_INTSUB", None, 5u32), 5);
    }
}
