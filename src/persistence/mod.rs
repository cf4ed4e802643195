//! Persistence of candles, indicators and signals
//!
//! Every series has a `<name>_live` (or `candle_current_<tf>`) single-record
//! file, overwritten on update, and an append-only `<name>_history` (or
//! `candles_<tf>`) JSON array ordered by key. The hot path never touches the
//! filesystem: records go to a background worker which batches and throttles
//! them.

pub mod store;
pub mod worker;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::execution::journal::SignalRecord;
use crate::trading_core::candles::Candle;
use crate::trading_core::indicators::{CvdSignal, Fvg};
use crate::trading_core::timeframe::Timeframe;

pub use store::PersistenceStore;
pub use worker::{PersistenceHandle, PersistenceWorker};

/// Append-only record. History files hold at most one record per key,
/// sorted ascending.
pub trait HistoryRecord: Serialize + DeserializeOwned + Clone + Send + 'static {
    fn history_key(&self) -> i64;
}

impl HistoryRecord for Candle {
    fn history_key(&self) -> i64 {
        self.timestamp
    }
}

impl HistoryRecord for Fvg {
    fn history_key(&self) -> i64 {
        self.start_time
    }
}

/// ATR of the primary timeframe at a candle close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtrRecord {
    pub timestamp: i64,
    pub timeframe: Timeframe,
    pub period: usize,
    pub value: f64,
}

impl HistoryRecord for AtrRecord {
    fn history_key(&self) -> i64 {
        self.timestamp
    }
}

/// Anchor CVD at a candle close, with the divergence it produced if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvdRecord {
    pub timestamp: i64,
    pub timeframe: Timeframe,
    pub cvd: f64,
    pub signal: Option<CvdSignal>,
}

impl HistoryRecord for CvdRecord {
    fn history_key(&self) -> i64 {
        self.timestamp
    }
}

/// Trades of the last few hundred milliseconds, summarised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedTrade {
    pub timestamp: i64,
    /// Mean trade price over the window
    pub price: f64,
    pub volume_buy: f64,
    pub volume_sell: f64,
    /// `volume_buy - volume_sell`
    pub cvd: f64,
    pub trades: usize,
}

/// Logical series names shared with the chart
pub mod names {
    use crate::trading_core::timeframe::Timeframe;

    pub const ATR: &str = "atr";
    pub const CVD: &str = "cvd";
    pub const FVG: &str = "fvg";
    pub const SIGNALS: &str = "signals";
    pub const POSITION_LIVE: &str = "position_live";
    pub const LAST_AGGREGATED_TRADE_LIVE: &str = "last_aggregated_trade_live";
    pub const SIGNALS_LOG: &str = "signals.log";

    pub fn candles(tf: &Timeframe) -> String {
        format!("candles_{tf}")
    }

    pub fn candle_current(tf: &Timeframe) -> String {
        format!("candle_current_{tf}")
    }

    pub fn live(indicator: &str) -> String {
        format!("{indicator}_live")
    }

    pub fn history(indicator: &str) -> String {
        format!("{indicator}_history")
    }
}

/// History records handed to the worker
#[derive(Debug, Clone)]
pub enum HistoryBatch {
    Candles(Vec<Candle>),
    Atr(Vec<AtrRecord>),
    Cvd(Vec<CvdRecord>),
    Fvg(Vec<Fvg>),
    Signals(Vec<SignalRecord>),
}

impl HistoryBatch {
    pub fn len(&self) -> usize {
        match self {
            Self::Candles(r) => r.len(),
            Self::Atr(r) => r.len(),
            Self::Cvd(r) => r.len(),
            Self::Fvg(r) => r.len(),
            Self::Signals(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `other` if it holds the same kind of record. Returns it back otherwise.
    pub fn merge(&mut self, other: HistoryBatch) -> Option<HistoryBatch> {
        match (self, other) {
            (Self::Candles(a), Self::Candles(b)) => a.extend(b),
            (Self::Atr(a), Self::Atr(b)) => a.extend(b),
            (Self::Cvd(a), Self::Cvd(b)) => a.extend(b),
            (Self::Fvg(a), Self::Fvg(b)) => a.extend(b),
            (Self::Signals(a), Self::Signals(b)) => a.extend(b),
            (_, other) => return Some(other),
        }
        None
    }

    /// Write through the store, merging by key
    pub fn write(&self, store: &PersistenceStore, name: &str) -> Result<usize, crate::error::PersistError> {
        match self {
            Self::Candles(r) => store.append_history(name, r),
            Self::Atr(r) => store.append_history(name, r),
            Self::Cvd(r) => store.append_history(name, r),
            Self::Fvg(r) => store.append_history(name, r),
            Self::Signals(r) => store.append_history(name, r),
        }
    }
}
