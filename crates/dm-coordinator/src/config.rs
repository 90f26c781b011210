//! Coordinator configuration

use std::time::Duration;

use dm_common::{Error, Result};

use crate::outcome::BackoffPolicy;

/// Environment variable for the default monitor polling interval (seconds)
pub const MONITOR_INTERVAL_ENV: &str = "DM_MONITOR_INTERVAL_SECS";
/// Environment variable for the default monitor timeout (seconds, 0 disables)
pub const MONITOR_TIMEOUT_ENV: &str = "DM_MONITOR_TIMEOUT_SECS";
/// Environment variable for the initial reconcile backoff (milliseconds)
pub const BACKOFF_INITIAL_ENV: &str = "DM_BACKOFF_INITIAL_MS";
/// Environment variable for the maximum reconcile backoff (seconds)
pub const BACKOFF_MAX_ENV: &str = "DM_BACKOFF_MAX_SECS";

/// Runtime configuration shared by all controllers
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Default polling interval for monitors
    pub monitor_interval: Duration,
    /// Default monitor timeout; `None` polls until cancelled
    pub monitor_timeout: Option<Duration>,
    /// Requeue backoff for failed reconciles
    pub backoff: BackoffPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(10),
            monitor_timeout: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from the process environment
    ///
    /// Unset variables keep their defaults. Set but malformed values are
    /// rejected.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = parse_u64(&lookup, MONITOR_INTERVAL_ENV)? {
            if secs == 0 {
                return Err(Error::configuration(MONITOR_INTERVAL_ENV, "must be greater than 0"));
            }
            config.monitor_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, MONITOR_TIMEOUT_ENV)? {
            config.monitor_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = parse_u64(&lookup, BACKOFF_INITIAL_ENV)? {
            config.backoff.initial = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, BACKOFF_MAX_ENV)? {
            config.backoff.max = Duration::from_secs(secs);
        }

        if config.backoff.initial > config.backoff.max {
            return Err(Error::configuration(
                BACKOFF_INITIAL_ENV,
                format!("exceeds {}", BACKOFF_MAX_ENV),
            ));
        }

        Ok(config)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::configuration(key, format!("{:?} is not a number: {}", raw, e))),
    }
}
