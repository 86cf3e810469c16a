use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const GLARE_DELAY_ENV: &str = "VOICECALL_GLARE_DELAY_MS";
pub const MAX_BUFFERED_CANDIDATES_ENV: &str = "VOICECALL_MAX_BUFFERED_CANDIDATES";
pub const TOMBSTONES_ENV: &str = "VOICECALL_TOMBSTONES";
pub const MAX_ORPHAN_CALLS_ENV: &str = "VOICECALL_MAX_ORPHAN_CALLS";
pub const EVENT_CAPACITY_ENV: &str = "VOICECALL_EVENT_CAPACITY";

/// Tunables for one call controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    /// How long `start_call` waits for a competing offer before sending its own.
    pub glare_delay: Duration,
    /// Early candidates kept per call id; extra ones are dropped.
    pub max_buffered_candidates: usize,
    /// Distinct unknown call ids whose candidates are held in case an offer
    /// for them follows; the oldest is dropped first.
    pub max_orphan_calls: usize,
    /// Terminated call ids remembered so late messages are recognised as stale.
    pub tombstone_capacity: usize,
    /// Capacity of the broadcast channel behind `CallController::subscribe`.
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            glare_delay: Duration::from_millis(500),
            max_buffered_candidates: 64,
            max_orphan_calls: 8,
            tombstone_capacity: 32,
            event_capacity: 64,
        }
    }
}

impl CallConfig {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let defaults = Self::default();
        let glare_delay = match parse_var::<u64, _>(&lookup, GLARE_DELAY_ENV)? {
            Some(ms) => Duration::from_millis(ms),
            None => defaults.glare_delay,
        };
        let max_buffered_candidates = parse_var(&lookup, MAX_BUFFERED_CANDIDATES_ENV)?
            .unwrap_or(defaults.max_buffered_candidates);
        let max_orphan_calls =
            parse_var(&lookup, MAX_ORPHAN_CALLS_ENV)?.unwrap_or(defaults.max_orphan_calls);
        let tombstone_capacity =
            parse_var(&lookup, TOMBSTONES_ENV)?.unwrap_or(defaults.tombstone_capacity);
        let event_capacity = match parse_var::<usize, _>(&lookup, EVENT_CAPACITY_ENV)? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    var: EVENT_CAPACITY_ENV,
                    value: "0".into(),
                    reason: "must be greater than zero".into(),
                });
            }
            Some(value) => value,
            None => defaults.event_capacity,
        };

        Ok(Self {
            glare_delay,
            max_buffered_candidates,
            max_orphan_calls,
            tombstone_capacity,
            event_capacity,
        })
    }

    pub fn with_glare_delay(mut self, delay: Duration) -> Self {
        self.glare_delay = delay;
        self
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&'static str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            var,
            value: raw.clone(),
            reason: err.to_string(),
        })
}
