//! Environment-backed runtime configuration for the Matrix client.

use std::env;

use thiserror::Error;

const DEFAULT_PATH_PREFIX: &str = "/_matrix/client/api/v1";
const DEFAULT_EVENT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_POLL_MARGIN_MS: u64 = 5_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 3_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_PAGINATE_LIMIT: u16 = 20;
const DEFAULT_PAGINATION_LIMIT_CAP: u16 = 100;

/// Runtime tuning for a [`crate::MatrixClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Home server base URL, e.g. `https://matrix.example.org`.
    pub server: String,
    /// API path prefix prepended to every request path.
    pub path_prefix: String,
    /// `timeout` value sent with the `/events` long-poll, in milliseconds.
    pub event_timeout_ms: u64,
    /// Extra local wait beyond the server timeout before a poll is abandoned.
    pub poll_margin_ms: u64,
    /// Base backoff delay between failed polls.
    pub backoff_base_ms: u64,
    /// Backoff delay cap.
    pub backoff_max_ms: u64,
    /// Default page size for backward pagination.
    pub paginate_limit: u16,
    /// Upper bound applied to requested pagination limits.
    pub pagination_limit_cap: u16,
}

impl ClientConfig {
    /// Configuration with defaults for the given home server.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            path_prefix: DEFAULT_PATH_PREFIX.to_owned(),
            event_timeout_ms: DEFAULT_EVENT_TIMEOUT_MS,
            poll_margin_ms: DEFAULT_POLL_MARGIN_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            paginate_limit: DEFAULT_PAGINATE_LIMIT,
            pagination_limit_cap: DEFAULT_PAGINATION_LIMIT_CAP,
        }
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let server = optional_trimmed_env("PALAVER_HOMESERVER", &mut lookup)
            .ok_or(ConfigError::Missing {
                key: "PALAVER_HOMESERVER",
            })?;
        let mut config = Self::new(server);

        if let Some(prefix) = optional_trimmed_env("PALAVER_PATH_PREFIX", &mut lookup) {
            config.path_prefix = prefix;
        }
        config.event_timeout_ms = parse_optional_u64(
            "PALAVER_EVENT_TIMEOUT_MS",
            config.event_timeout_ms,
            &mut lookup,
        )?;
        config.poll_margin_ms =
            parse_optional_u64("PALAVER_POLL_MARGIN_MS", config.poll_margin_ms, &mut lookup)?;
        config.backoff_base_ms =
            parse_optional_u64("PALAVER_BACKOFF_BASE_MS", config.backoff_base_ms, &mut lookup)?;
        config.backoff_max_ms =
            parse_optional_u64("PALAVER_BACKOFF_MAX_MS", config.backoff_max_ms, &mut lookup)?;
        config.paginate_limit =
            parse_optional_u16("PALAVER_PAGINATE_LIMIT", config.paginate_limit, &mut lookup)?;
        config.pagination_limit_cap = parse_optional_u16(
            "PALAVER_PAGINATION_LIMIT_CAP",
            config.pagination_limit_cap,
            &mut lookup,
        )?;

        if config.paginate_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PALAVER_PAGINATE_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if config.event_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PALAVER_EVENT_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(config)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("missing required {key}")]
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u64<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u16<F>(
    key: &'static str,
    default: u16,
    lookup: &mut F,
) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u16>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}
