//! Engine configuration, loaded from environment variables with defaults.

use chrono::TimeDelta;
use std::env;
use thiserror::Error;

use crate::store::RetryPolicy;

/// Minutes before the show during which cancellation is refused.
pub const CANCELLATION_WINDOW_ENV: &str = "RSV_CANCELLATION_WINDOW_MINUTES";
/// Attempts per transaction before a serialization conflict is reported.
pub const MAX_TX_ATTEMPTS_ENV: &str = "RSV_MAX_TX_ATTEMPTS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key}: invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Settings shared by every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Cancellation is refused once less than this is left before the show.
    pub cancellation_window: TimeDelta,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancellation_window: TimeDelta::hours(3),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(minutes) = parse::<u32>(&lookup, CANCELLATION_WINDOW_ENV)? {
            config.cancellation_window = TimeDelta::minutes(i64::from(minutes));
        }
        if let Some(max_attempts) = parse::<u32>(&lookup, MAX_TX_ATTEMPTS_ENV)? {
            if max_attempts == 0 {
                return Err(ConfigError::Invalid {
                    key: MAX_TX_ATTEMPTS_ENV,
                    value: max_attempts.to_string(),
                });
            }
            config.retry = RetryPolicy { max_attempts };
        }

        Ok(config)
    }
}

/// Connection settings for [`PgStore`](crate::store::PgStore).
#[cfg(feature = "postgres")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConfig {
    pub url: String,
    pub max_connections: u32,
}

#[cfg(feature = "postgres")]
impl PgConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    /// Load from `DATABASE_URL` (required) and `RSV_PG_MAX_CONNECTIONS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let max_connections = parse::<u32>(&lookup, "RSV_PG_MAX_CONNECTIONS")?
            .unwrap_or(Self::DEFAULT_MAX_CONNECTIONS);
        Ok(Self {
            url,
            max_connections,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
