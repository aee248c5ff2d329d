//! Environment configuration for retry policies

use std::env;
use std::str::FromStr;

use crate::policy::RetryPolicy;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

impl RetryPolicy {
    /// Load a policy from `JOB_TRIES`, `JOB_TIMEOUT`,
    /// `JOB_IGNORE_MAX_ATTEMPTS` and `JOB_RETRY_DELAY`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_prefix("JOB")
    }

    /// Same as [`RetryPolicy::from_env`] with `{prefix}_` in front of each key
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| env::var(key).ok())
    }

    /// Unset keys keep their defaults
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |suffix: &str| {
            let key = format!("{prefix}_{suffix}");
            lookup(&key).map(|value| (key, value))
        };

        Ok(Self {
            max_tries: parse_or(get("TRIES"), defaults.max_tries)?,
            timeout_secs: parse_or(get("TIMEOUT"), defaults.timeout_secs)?,
            ignore_max_attempts_exceeded: match get("IGNORE_MAX_ATTEMPTS") {
                Some((key, value)) => {
                    parse_bool(&value).ok_or(ConfigError::Invalid { key, value })?
                }
                None => defaults.ignore_max_attempts_exceeded,
            },
            retry_delay_secs: parse_or(get("RETRY_DELAY"), defaults.retry_delay_secs)?,
        })
    }
}

fn parse_or<T: FromStr>(entry: Option<(String, String)>, default: T) -> Result<T, ConfigError> {
    match entry {
        Some((key, value)) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
