//! Session configuration parsed from environment variables.

use std::time::Duration;

use crate::model::UserIdentity;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3001/ws";
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_JOIN_RETRY_MS: u64 = 5000;
pub const DEFAULT_SAVE_TIMEOUT_MS: u64 = 8000;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;
pub const DEFAULT_QUEUE_CAP: usize = 500;
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid server url (expected ws:// or wss://): {0}")]
    InvalidUrl(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub server_url: String,
    pub room_id: String,
    pub identity: UserIdentity,
    /// How long a join request may go unanswered.
    pub join_timeout: Duration,
    /// Delay before re-sending a rejected or timed-out join.
    pub join_retry: Duration,
    pub save_timeout: Duration,
    /// Wait between a full-state emit and its follow-up persist.
    pub settle_delay: Duration,
    /// Pending-emit queue bound; the oldest frame is dropped past it.
    pub queue_cap: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl SyncConfig {
    /// Config with default timings for the given room and user.
    #[must_use]
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>, identity: UserIdentity) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            identity,
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            join_retry: Duration::from_millis(DEFAULT_JOIN_RETRY_MS),
            save_timeout: Duration::from_millis(DEFAULT_SAVE_TIMEOUT_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            queue_cap: DEFAULT_QUEUE_CAP,
            reconnect_initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        }
    }

    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `CLASSBOARD_ROOM_ID`
    /// - `CLASSBOARD_USER_NAME`
    ///
    /// Optional:
    /// - `CLASSBOARD_SERVER_URL`: default `ws://127.0.0.1:3001/ws`
    /// - `CLASSBOARD_USER_ID`, `CLASSBOARD_USER_EMAIL`
    /// - `CLASSBOARD_JOIN_TIMEOUT_MS` (5000), `CLASSBOARD_JOIN_RETRY_MS` (5000)
    /// - `CLASSBOARD_SAVE_TIMEOUT_MS` (8000), `CLASSBOARD_SETTLE_DELAY_MS` (500)
    /// - `CLASSBOARD_QUEUE_CAP` (500)
    /// - `CLASSBOARD_RECONNECT_INITIAL_MS` (1000), `CLASSBOARD_RECONNECT_MAX_MS` (10000)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required variable is missing or a value
    /// is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`], reading values through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`SyncConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let optional = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        let millis = |key: &str, default: u64| Duration::from_millis(parse_or(lookup(key), default));

        let server_url = optional("CLASSBOARD_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_owned());
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(server_url));
        }

        let identity = UserIdentity {
            id: optional("CLASSBOARD_USER_ID"),
            name: required("CLASSBOARD_USER_NAME")?,
            email: optional("CLASSBOARD_USER_EMAIL"),
        };

        let config = Self {
            server_url,
            room_id: required("CLASSBOARD_ROOM_ID")?,
            identity,
            join_timeout: millis("CLASSBOARD_JOIN_TIMEOUT_MS", DEFAULT_JOIN_TIMEOUT_MS),
            join_retry: millis("CLASSBOARD_JOIN_RETRY_MS", DEFAULT_JOIN_RETRY_MS),
            save_timeout: millis("CLASSBOARD_SAVE_TIMEOUT_MS", DEFAULT_SAVE_TIMEOUT_MS),
            settle_delay: millis("CLASSBOARD_SETTLE_DELAY_MS", DEFAULT_SETTLE_DELAY_MS),
            queue_cap: parse_or(lookup("CLASSBOARD_QUEUE_CAP"), DEFAULT_QUEUE_CAP),
            reconnect_initial: millis("CLASSBOARD_RECONNECT_INITIAL_MS", DEFAULT_RECONNECT_INITIAL_MS),
            reconnect_max: millis("CLASSBOARD_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS),
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] for a zero queue cap or reconnect delay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_cap == 0 {
            return Err(ConfigError::Zero("queue_cap"));
        }
        if self.reconnect_initial.is_zero() {
            return Err(ConfigError::Zero("reconnect_initial"));
        }
        Ok(())
    }
}

/// Read an environment variable, falling back to `default` when it is
/// absent or does not parse.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    parse_or(std::env::var(key).ok(), default)
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
