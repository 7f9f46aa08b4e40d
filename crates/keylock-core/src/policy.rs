use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Sentinel for "no fixed lease" and "wait until acquired".
pub const UNBOUNDED: i64 = -1;
pub const DEFAULT_LEASE_TIME: i64 = UNBOUNDED;
pub const DEFAULT_WAIT_TIME: i64 = 500;

/// Unit of `lease_time` and `wait_time` in [`LockOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    #[default]
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert an amount of this unit into a duration.
    pub fn to_duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(amount),
            TimeUnit::Microseconds => Duration::from_micros(amount),
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(3_600)),
            TimeUnit::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeUnit::Nanoseconds => write!(f, "ns"),
            TimeUnit::Microseconds => write!(f, "us"),
            TimeUnit::Milliseconds => write!(f, "ms"),
            TimeUnit::Seconds => write!(f, "s"),
            TimeUnit::Minutes => write!(f, "min"),
            TimeUnit::Hours => write!(f, "h"),
            TimeUnit::Days => write!(f, "d"),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ns" | "nanos" | "nanoseconds" => Ok(TimeUnit::Nanoseconds),
            "us" | "micros" | "microseconds" => Ok(TimeUnit::Microseconds),
            "ms" | "millis" | "milliseconds" => Ok(TimeUnit::Milliseconds),
            "s" | "secs" | "seconds" => Ok(TimeUnit::Seconds),
            "min" | "mins" | "minutes" => Ok(TimeUnit::Minutes),
            "h" | "hours" => Ok(TimeUnit::Hours),
            "d" | "days" => Ok(TimeUnit::Days),
            other => Err(LockError::InvalidArgument(format!(
                "unknown time unit '{}'",
                other
            ))),
        }
    }
}

/// How long an acquired lock stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    /// Held until released; the provider keeps renewing it while the owner lives.
    Watchdog,
    /// Expires on its own after the duration, no renewal.
    Fixed(Duration),
}

/// How long to wait for a lock before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until the lock is held.
    Forever,
    /// Give up after the duration; zero means a single attempt.
    Bounded(Duration),
}

/// Everything needed to lock for one guarded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    keys: Vec<String>,
    fair: bool,
    lease: Lease,
    wait: Wait,
}

impl LockPolicy {
    pub fn new(keys: Vec<String>, fair: bool, lease: Lease, wait: Wait) -> Result<Self, LockError> {
        if keys.is_empty() {
            return Err(LockError::InvalidArgument(
                "a lock policy needs at least one key".to_string(),
            ));
        }
        if lease == Lease::Fixed(Duration::ZERO) {
            return Err(LockError::InvalidArgument(
                "lease time must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            keys,
            fair,
            lease,
            wait,
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }

    pub fn lease(&self) -> Lease {
        self.lease
    }

    pub fn wait(&self) -> Wait {
        self.wait
    }
}

/// Declarative lock configuration for one guarded operation.
///
/// Mirrors what callers annotate an operation with: key templates, fairness,
/// lease and wait time. `-1` is the only accepted negative value for both
/// times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    #[serde(alias = "key")]
    pub keys: Vec<String>,
    #[serde(default, alias = "isFair")]
    pub fair: bool,
    #[serde(default = "default_lease_time", alias = "leaseTime")]
    pub lease_time: i64,
    #[serde(default, alias = "timeUnit")]
    pub time_unit: TimeUnit,
    #[serde(default = "default_wait_time", alias = "waitTime")]
    pub wait_time: i64,
}

fn default_lease_time() -> i64 {
    DEFAULT_LEASE_TIME
}

fn default_wait_time() -> i64 {
    DEFAULT_WAIT_TIME
}

impl LockOptions {
    /// Options for a single key template with default policy.
    pub fn key(template: impl Into<String>) -> Self {
        Self::keys([template])
    }

    /// Options for several key templates locked together.
    pub fn keys<I, S>(templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: templates.into_iter().map(Into::into).collect(),
            fair: false,
            lease_time: DEFAULT_LEASE_TIME,
            time_unit: TimeUnit::default(),
            wait_time: DEFAULT_WAIT_TIME,
        }
    }

    pub fn fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    pub fn lease_time(mut self, lease_time: i64) -> Self {
        self.lease_time = lease_time;
        self
    }

    pub fn wait_time(mut self, wait_time: i64) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn time_unit(mut self, time_unit: TimeUnit) -> Self {
        self.time_unit = time_unit;
        self
    }

    pub fn lease(&self) -> Result<Lease, LockError> {
        match self.lease_time {
            UNBOUNDED => Ok(Lease::Watchdog),
            0 => Err(LockError::InvalidArgument(
                "lease time must be greater than zero".to_string(),
            )),
            t if t > 0 => Ok(Lease::Fixed(self.time_unit.to_duration(t as u64))),
            t => Err(LockError::InvalidArgument(format!(
                "lease time {} is negative (use -1 for no fixed lease)",
                t
            ))),
        }
    }

    pub fn wait(&self) -> Result<Wait, LockError> {
        match self.wait_time {
            UNBOUNDED => Ok(Wait::Forever),
            t if t >= 0 => Ok(Wait::Bounded(self.time_unit.to_duration(t as u64))),
            t => Err(LockError::InvalidArgument(format!(
                "wait time {} is negative (use -1 to wait forever)",
                t
            ))),
        }
    }

    /// Build the policy for already resolved keys.
    pub fn to_policy(&self, keys: Vec<String>) -> Result<LockPolicy, LockError> {
        LockPolicy::new(keys, self.fair, self.lease()?, self.wait()?)
    }
}
