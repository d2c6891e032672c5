//! Consumption-rate policy model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Time unit a policy's limit is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateUnit {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
    /// Arbitrary window length
    Custom(Duration),
}

impl RateUnit {
    /// Get the window length of this unit.
    pub fn duration(&self) -> Duration {
        match self {
            RateUnit::Second => Duration::from_secs(1),
            RateUnit::Minute => Duration::from_secs(60),
            RateUnit::Hour => Duration::from_secs(3600),
            RateUnit::Day => Duration::from_secs(86400),
            RateUnit::Custom(period) => *period,
        }
    }
}

/// An immutable description of one allowed consumption rate.
///
/// Equality and hashing only look at the effective window length and the
/// limit, so `60/minute` equals `60 per custom period of 60s` regardless of
/// how the window was declared or what burst was configured.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    limit: u64,
    unit: RateUnit,
    max_burst: Option<u64>,
}

impl RatePolicy {
    /// Declare a policy with a fixed unit.
    pub fn new(limit: u64, unit: RateUnit) -> Result<Self> {
        if limit == 0 {
            return Err(WardenError::Configuration(
                "limit has to be greater than 0".to_string(),
            ));
        }
        if unit.duration().is_zero() {
            return Err(WardenError::Configuration(
                "period has to be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            limit,
            unit,
            max_burst: None,
        })
    }

    /// Declare a policy over a custom period.
    pub fn per_period(limit: u64, period: Duration) -> Result<Self> {
        Self::new(limit, RateUnit::Custom(period))
    }

    /// Set the burst capacity of this policy.
    pub fn with_max_burst(mut self, max_burst: u64) -> Result<Self> {
        if max_burst == 0 {
            return Err(WardenError::Configuration(
                "max_burst has to be greater than 0".to_string(),
            ));
        }
        self.max_burst = Some(max_burst);
        Ok(self)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn unit(&self) -> RateUnit {
        self.unit
    }

    /// Effective window length, whether declared by unit or custom period.
    pub fn window(&self) -> Duration {
        self.unit.duration()
    }

    /// Bucket capacity; defaults to the limit when no burst was declared.
    pub fn max_burst(&self) -> u64 {
        self.max_burst.unwrap_or(self.limit)
    }

    /// Parameters the token store needs to account for this policy.
    pub fn bucket(&self) -> BucketSpec {
        BucketSpec {
            max_burst: self.max_burst(),
            refill_per_window: self.limit,
            window: self.window(),
        }
    }
}

impl PartialEq for RatePolicy {
    fn eq(&self, other: &Self) -> bool {
        self.limit == other.limit && self.window() == other.window()
    }
}

impl Eq for RatePolicy {}

impl Hash for RatePolicy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.limit.hash(state);
        self.window().hash(state);
    }
}

impl fmt::Display for RatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let window = self.window();
        if window.subsec_nanos() == 0 {
            write!(f, "{} tokens per {} seconds", self.limit, window.as_secs())
        } else {
            write!(f, "{} tokens per {} ms", self.limit, window.as_millis())
        }
    }
}

/// Token bucket parameters derived from a [`RatePolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    /// Bucket capacity
    pub max_burst: u64,
    /// Tokens credited per full window
    pub refill_per_window: u64,
    /// Window length
    pub window: Duration,
}

impl BucketSpec {
    /// Time it takes to credit `tokens` tokens, rounded up to the nanosecond.
    pub fn time_for_tokens(&self, tokens: u64) -> Duration {
        let window = self.window.as_nanos();
        let rate = u128::from(self.refill_per_window.max(1));
        let nanos = (u128::from(tokens) * window).div_ceil(rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Idle time after which an empty bucket would be full again.
    pub fn time_to_full(&self) -> Duration {
        self.time_for_tokens(self.max_burst).max(self.window)
    }
}

/// Time unit keyword used in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Custom,
}

/// A policy as written in configuration, validated into a [`RatePolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDeclaration {
    /// Number of tokens allowed per window
    pub limit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Window length in milliseconds, only for `unit: custom`
    #[serde(default)]
    pub period_ms: Option<u64>,
    /// Optional burst capacity
    #[serde(default)]
    pub max_burst: Option<u64>,
}

impl TryFrom<&PolicyDeclaration> for RatePolicy {
    type Error = WardenError;

    fn try_from(decl: &PolicyDeclaration) -> Result<Self> {
        let unit = match (decl.unit, decl.period_ms) {
            (TimeUnit::Custom, Some(ms)) => RateUnit::Custom(Duration::from_millis(ms)),
            (TimeUnit::Custom, None) => {
                return Err(WardenError::Configuration(
                    "period_ms is required for unit 'custom'".to_string(),
                ))
            }
            (_, Some(_)) => {
                return Err(WardenError::Configuration(
                    "period_ms is only allowed for unit 'custom'".to_string(),
                ))
            }
            (TimeUnit::Second, None) => RateUnit::Second,
            (TimeUnit::Minute, None) => RateUnit::Minute,
            (TimeUnit::Hour, None) => RateUnit::Hour,
            (TimeUnit::Day, None) => RateUnit::Day,
        };

        let policy = RatePolicy::new(decl.limit, unit)?;
        match decl.max_burst {
            Some(burst) => policy.with_max_burst(burst),
            None => Ok(policy),
        }
    }
}
