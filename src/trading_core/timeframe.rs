//! Timeframe clock
//!
//! Pure mapping from a trade timestamp to the start of its candle bucket.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// A fixed-width candle interval, e.g. `1m` or `4h`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    label: String,
    interval_ms: i64,
}

impl Timeframe {
    /// Parse a label of the form `<n><unit>` where unit is one of `s`, `m`, `h`, `d`
    pub fn parse(label: &str) -> Result<Self, ConfigError> {
        let label = label.trim();
        let unknown = || ConfigError::UnknownTimeframe(label.to_string());

        if label.len() < 2 || !label.is_ascii() {
            return Err(unknown());
        }
        let (value, unit) = label.split_at(label.len() - 1);
        let value: i64 = value.parse().map_err(|_| unknown())?;
        if value <= 0 {
            return Err(unknown());
        }

        let unit_ms = match unit {
            "s" => SECOND_MS,
            "m" => MINUTE_MS,
            "h" => HOUR_MS,
            "d" => DAY_MS,
            _ => return Err(unknown()),
        };

        let interval_ms = value.checked_mul(unit_ms).ok_or_else(unknown)?;
        Ok(Self {
            label: label.to_string(),
            interval_ms,
        })
    }

    /// `<n>m`; zero is bumped to one minute
    pub fn minutes(n: u32) -> Self {
        let n = n.max(1);
        Self {
            label: format!("{n}m"),
            interval_ms: i64::from(n) * MINUTE_MS,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// `floor(ts / interval) * interval`, flooring toward negative infinity
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.interval_ms) * self.interval_ms
    }

    /// Number of whole buckets covered by `elapsed_ms`
    pub fn buckets_in(&self, elapsed_ms: i64) -> i64 {
        elapsed_ms.max(0) / self.interval_ms
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.label
    }
}
