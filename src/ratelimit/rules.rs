//! Rate limiter definitions.
//!
//! A definition names a limiter, sets how many permits it grants per refresh
//! period, and picks the window algorithm. Definitions are usually loaded
//! from the `rate_limiters` section of the Gatekeeper configuration:
//!
//! ```yaml
//! rate_limiters:
//!   - name: api
//!     capacity: 5
//!     refresh_period_ms: 5000
//!     algorithm: sliding_window
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{duration_millis, MAX_EXPIRY};
use crate::error::{GatekeeperError, Result};

/// Window algorithm used by a limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter that resets when its window expires. The window starts at
    /// the first permit, so up to twice the capacity can pass in a short
    /// span around a window boundary.
    #[default]
    FixedWindow,
    /// Timestamped events counted over the trailing period. No boundary
    /// bursts, at the cost of one stored entry per granted permit.
    SlidingWindow,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::FixedWindow => f.write_str("fixed_window"),
            Algorithm::SlidingWindow => f.write_str("sliding_window"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" | "fixed" => Ok(Algorithm::FixedWindow),
            "sliding_window" | "sliding" => Ok(Algorithm::SlidingWindow),
            other => Err(GatekeeperError::Config(format!(
                "unknown rate limiter algorithm '{}'",
                other
            ))),
        }
    }
}

/// Definition of a single rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Limiter name; also the store key holding its state.
    pub name: String,
    /// Maximum permits per refresh period.
    pub capacity: u64,
    /// Length of the window.
    #[serde(rename = "refresh_period_ms", with = "duration_ms")]
    pub refresh_period: Duration,
    /// Window algorithm.
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl RateLimiterConfig {
    /// Create a fixed window definition.
    pub fn new(name: impl Into<String>, capacity: u64, refresh_period: Duration) -> Self {
        Self {
            name: name.into(),
            capacity,
            refresh_period,
            algorithm: Algorithm::default(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Check that the definition can be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatekeeperError::Config(
                "rate limiter name must not be empty".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(GatekeeperError::Config(format!(
                "rate limiter '{}': capacity must be positive",
                self.name
            )));
        }
        if self.refresh_period < Duration::from_millis(1) {
            return Err(GatekeeperError::Config(format!(
                "rate limiter '{}': refresh period must be at least 1ms",
                self.name
            )));
        }
        if self.refresh_period > MAX_EXPIRY {
            return Err(GatekeeperError::Config(format!(
                "rate limiter '{}': refresh period must not exceed {}ms",
                self.name,
                duration_millis(MAX_EXPIRY)
            )));
        }
        Ok(())
    }
}

/// Serialize a `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
