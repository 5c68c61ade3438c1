//! Connection manager configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use syncwarden_durable::serde_duration::duration_millis;
use syncwarden_durable::RetryPolicy;

/// Errors from loading configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be used
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration shared by every connection manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerConfig {
    /// Control loop passes an incarnation runs before handing off to a
    /// fresh one
    ///
    /// Every wake-up counts: runs, elapsed waits and signals alike.
    pub cycles_before_handoff: u32,

    /// Wait used when the schedule cannot be computed or a job cannot be
    /// created
    #[serde(with = "duration_millis")]
    pub schedule_retry_interval: Duration,

    /// Max attempts per job when the policy lookup fails
    pub default_max_attempt: u32,

    /// Backoff between attempts of one job
    ///
    /// Only the delay curve is used; the attempt cap comes from the max
    /// attempt policy.
    pub attempt_backoff: RetryPolicy,

    /// Retry policy wrapped around every activity call
    pub activity_retry: RetryPolicy,

    /// How long an interrupted attempt may take to unwind
    #[serde(with = "duration_millis")]
    pub cancellation_grace_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cycles_before_handoff: 10,
            schedule_retry_interval: Duration::from_secs(60),
            default_max_attempt: 3,
            attempt_backoff: RetryPolicy::exponential()
                .with_initial_interval(Duration::from_secs(10))
                .with_max_interval(Duration::from_secs(300))
                .with_jitter(0.1),
            activity_retry: RetryPolicy::exponential(),
            cancellation_grace_period: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    /// Create configuration from `SYNCWARDEN_*` environment variables
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(cycles) = parse::<u32>(&lookup, "SYNCWARDEN_CYCLES_BEFORE_HANDOFF")? {
            config.cycles_before_handoff =
                at_least_one("SYNCWARDEN_CYCLES_BEFORE_HANDOFF", cycles)?;
        }
        if let Some(ms) = parse::<u64>(&lookup, "SYNCWARDEN_SCHEDULE_RETRY_INTERVAL_MS")? {
            config.schedule_retry_interval = Duration::from_millis(ms);
        }
        if let Some(max) = parse::<u32>(&lookup, "SYNCWARDEN_DEFAULT_MAX_ATTEMPT")? {
            config.default_max_attempt = at_least_one("SYNCWARDEN_DEFAULT_MAX_ATTEMPT", max)?;
        }
        if let Some(ms) = parse::<u64>(&lookup, "SYNCWARDEN_ATTEMPT_BACKOFF_INITIAL_MS")? {
            config.attempt_backoff = config
                .attempt_backoff
                .with_initial_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parse::<u64>(&lookup, "SYNCWARDEN_ATTEMPT_BACKOFF_MAX_MS")? {
            config.attempt_backoff = config
                .attempt_backoff
                .with_max_interval(Duration::from_millis(ms));
        }
        if let Some(attempts) = parse::<u32>(&lookup, "SYNCWARDEN_ACTIVITY_MAX_ATTEMPTS")? {
            config.activity_retry = config.activity_retry.with_max_attempts(attempts);
        }
        if let Some(ms) = parse::<u64>(&lookup, "SYNCWARDEN_CANCELLATION_GRACE_MS")? {
            config.cancellation_grace_period = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Set the control loop passes before hand-off
    pub fn with_cycles_before_handoff(mut self, cycles: u32) -> Self {
        self.cycles_before_handoff = cycles.max(1);
        self
    }

    /// Set the schedule fallback interval
    pub fn with_schedule_retry_interval(mut self, interval: Duration) -> Self {
        self.schedule_retry_interval = interval;
        self
    }

    /// Set the fallback max attempt
    pub fn with_default_max_attempt(mut self, max_attempt: u32) -> Self {
        self.default_max_attempt = max_attempt.max(1);
        self
    }

    /// Set the backoff between attempts
    pub fn with_attempt_backoff(mut self, policy: RetryPolicy) -> Self {
        self.attempt_backoff = policy;
        self
    }

    /// Set the retry policy for activity calls
    pub fn with_activity_retry(mut self, policy: RetryPolicy) -> Self {
        self.activity_retry = policy;
        self
    }

    /// Set the cancellation grace period
    pub fn with_cancellation_grace_period(mut self, grace: Duration) -> Self {
        self.cancellation_grace_period = grace;
        self
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    match parsed {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => Err(ConfigError::InvalidValue {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}

fn at_least_one(var: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}
