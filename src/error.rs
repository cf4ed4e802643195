//! Error taxonomy
//!
//! - `EngineError`: per-event failures inside the trading pipeline. They never
//!   cross the per-trade boundary; `SymbolTrader` logs them and moves on.
//! - `PersistError`: storage failures. Swallowed by the persistence worker and
//!   retried on the next cycle.
//! - `ConfigError`: fatal at startup, before any trade is ingested.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed trade: {0}")]
    MalformedInput(String),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock {path:?} not acquired within {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt persisted state in {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl PersistError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required parameter '{0}'")]
    Missing(&'static str),

    #[error("parameter '{name}' out of range: {reason}")]
    OutOfRange { name: &'static str, reason: String },

    #[error("unknown timeframe '{0}' (expected e.g. 30s, 1m, 15m, 1h, 1d)")]
    UnknownTimeframe(String),

    #[error("failed to parse config file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
}
