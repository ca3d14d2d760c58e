//! Configuration for the query cache and the sibling reorder engine
//!
//! Both configs are checked once, when the cache or engine is built from them.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Smallest gap accepted between two neighbor positions before a scope is renumbered
const DEFAULT_MIN_GAP: f64 = 0.0001;

/// Spacing between positions after a renumbering pass, and the step used when
/// appending or prepending
pub const POSITION_GAP: f64 = 1000.0;

/// Upper bound on automatic read retries
pub const MAX_READ_RETRY: u32 = 10;

/// Rejected cache or ordering configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("gc_time ({gc_time:?}) must not be shorter than stale_time ({stale_time:?})")]
    GcShorterThanStale {
        stale_time: Duration,
        gc_time: Duration,
    },

    #[error("event_capacity must be greater than 0")]
    ZeroEventCapacity,

    #[error("read_retry cannot exceed 10 (got {0})")]
    ReadRetryTooHigh(u32),

    #[error("gap must be a positive finite number (got {0})")]
    InvalidGap(f64),

    #[error("min_gap must be a positive finite number (got {0})")]
    InvalidMinGap(f64),

    #[error("min_gap ({min_gap}) must be smaller than gap ({gap})")]
    MinGapNotBelowGap { min_gap: f64, gap: f64 },
}

/// Configuration for the process-wide query cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a settled read is trusted before the next read refetches it
    #[serde(with = "duration_millis")]
    pub stale_time: Duration,

    /// How long an unobserved entry is kept before garbage collection drops it
    #[serde(with = "duration_millis")]
    pub gc_time: Duration,

    /// Automatic retries for reads failing with a transient error
    ///
    /// Mutations are never retried.
    pub read_retry: u32,

    /// Base delay between read retries, doubled on each attempt
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,

    /// Refetch observed entries in the background when they are invalidated
    pub refetch_on_invalidate: bool,

    /// Capacity of the cache event broadcast channel
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(30),
            gc_time: Duration::from_secs(20 * 60),
            read_retry: 1,
            retry_delay: Duration::from_millis(1000),
            refetch_on_invalidate: true,
            event_capacity: 256,
        }
    }
}

impl CacheConfig {
    /// Load overrides from `CMDSHELF_*` environment variables on top of the defaults
    ///
    /// Recognized variables: `CMDSHELF_STALE_TIME_MS`, `CMDSHELF_GC_TIME_MS`,
    /// `CMDSHELF_READ_RETRY`, `CMDSHELF_RETRY_DELAY_MS`,
    /// `CMDSHELF_REFETCH_ON_INVALIDATE`. Unparseable values are ignored with a
    /// warning; parseable but invalid combinations are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("CMDSHELF_STALE_TIME_MS") {
            config.stale_time = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CMDSHELF_GC_TIME_MS") {
            config.gc_time = Duration::from_millis(ms);
        }
        if let Some(retry) = env_parse::<u32>("CMDSHELF_READ_RETRY") {
            config.read_retry = retry;
        }
        if let Some(ms) = env_parse::<u64>("CMDSHELF_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(refetch) = env_parse::<bool>("CMDSHELF_REFETCH_ON_INVALIDATE") {
            config.refetch_on_invalidate = refetch;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc_time < self.stale_time {
            return Err(ConfigError::GcShorterThanStale {
                stale_time: self.stale_time,
                gc_time: self.gc_time,
            });
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }

        if self.read_retry > MAX_READ_RETRY {
            return Err(ConfigError::ReadRetryTooHigh(self.read_retry));
        }

        Ok(())
    }
}

/// Configuration for the ordered-sibling reorder engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// Spacing between evenly renumbered positions
    pub gap: f64,

    /// Neighbor gaps below this trigger a renumbering pass
    pub min_gap: f64,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            gap: POSITION_GAP,
            min_gap: DEFAULT_MIN_GAP,
        }
    }
}

impl OrderingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.gap.is_finite() && self.gap > 0.0) {
            return Err(ConfigError::InvalidGap(self.gap));
        }

        if !(self.min_gap.is_finite() && self.min_gap > 0.0) {
            return Err(ConfigError::InvalidMinGap(self.min_gap));
        }

        if self.min_gap >= self.gap {
            return Err(ConfigError::MinGapNotBelowGap {
                min_gap: self.min_gap,
                gap: self.gap,
            });
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
