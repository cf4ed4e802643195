//! Engine configuration
//!
//! Built once at startup and shared read-only (behind an `Arc`) by every
//! per-symbol task. Deserializes from a JSON file where every field is
//! optional; missing fields take the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::trading_core::timeframe::Timeframe;

/// How strictly a CVD sign flip must be confirmed by the candle body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CvdMode {
    /// Sign flip alone
    #[serde(alias = "raw", alias = "RAW")]
    Raw,
    /// Sign flip plus a body moving against the new CVD sign
    #[serde(alias = "advanced", alias = "ADVANCED")]
    Advanced,
}

impl Default for CvdMode {
    fn default() -> Self {
        Self::Raw
    }
}

impl std::fmt::Display for CvdMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => write!(f, "Raw"),
            Self::Advanced => write!(f, "Advanced"),
        }
    }
}

/// Take-profit placement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeProfitPolicy {
    /// `entry ± ATR * multiple`
    AtrMultiple(f64),
    /// `entry ± |entry - stop| * ratio`
    RiskReward(f64),
}

impl TakeProfitPolicy {
    fn parameter(&self) -> f64 {
        match self {
            Self::AtrMultiple(m) => *m,
            Self::RiskReward(r) => *r,
        }
    }
}

/// Signal detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Entry confirmation and position management timeframe
    pub primary_timeframe: Timeframe,
    /// Coarser timeframe for divergence detection
    pub anchor_timeframe: Timeframe,
    pub cvd_mode: CvdMode,
    /// Gap is accepted when `gap * sensitivity > ATR`
    pub fvg_sensitivity: f64,
    pub fvg_atr_period: usize,
    /// Minimum scorer probability; `None` disables the gate
    pub min_score_probability: Option<f64>,
}

/// Position and capital parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// ATR period used for stop, target and trailing distances
    pub risk_atr_period: usize,
    pub sl_atr_multiplier: f64,
    pub take_profit: TakeProfitPolicy,
    /// Trailing engages once unrealized profit exceeds this many ATRs
    pub trail_activation_atr: f64,
    /// Trailing distance is `ATR * sl_atr_multiplier * trail_tightening`
    pub trail_tightening: f64,
    /// Force-close after this many primary candles
    pub max_hold_candles: usize,
    pub initial_capital: f64,
    /// Breaker trips when capital < initial * (1 - fraction)
    pub max_drawdown_fraction: f64,
    /// Capital fraction risked per trade (position sizing)
    pub risk_fraction: f64,
    /// Also check stop/target on every trade tick, not just on closed candles
    pub intrabar_exits: bool,
}

/// Persistence parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    /// Minimum gap between two history writes of the same series
    pub throttle_ms: u64,
    pub lock_timeout_ms: u64,
    /// A lock file older than this is treated as abandoned
    pub stale_lock_ms: u64,
    /// Flush tick of the background writer
    pub flush_interval_ms: u64,
    /// Window summarised into `last_aggregated_trade_live`
    pub recent_trade_window_ms: i64,
    /// Bounded hand-off between the hot path and the writer
    pub channel_capacity: usize,
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Every timeframe aggregated; must include primary and anchor
    pub timeframes: Vec<Timeframe>,
    /// Closed candles kept in memory per timeframe
    pub max_candle_history: usize,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub persistence: PersistenceConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            primary_timeframe: Timeframe::minutes(1),
            anchor_timeframe: Timeframe::minutes(3),
            cvd_mode: CvdMode::Raw,
            fvg_sensitivity: 1.5,
            fvg_atr_period: 7,
            min_score_probability: None,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_atr_period: 7,
            sl_atr_multiplier: 6.5,
            take_profit: TakeProfitPolicy::RiskReward(0.57),
            trail_activation_atr: 0.5,
            trail_tightening: 0.8,
            max_hold_candles: 60,
            initial_capital: 10_000.0,
            max_drawdown_fraction: 0.2,
            risk_fraction: 0.02,
            intrabar_exits: false,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            throttle_ms: 3_000,
            lock_timeout_ms: 10_000,
            stale_lock_ms: 60_000,
            flush_interval_ms: 1_000,
            recent_trade_window_ms: 500,
            channel_capacity: 4_096,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::minutes(1), Timeframe::minutes(3)],
            max_candle_history: 500,
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl PersistenceConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl EngineConfig {
    /// Load from a JSON file; absent fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Tighter stops and an ATR-multiple target, the other observed variant
    pub fn atr_target() -> Self {
        let mut config = Self::default();
        config.risk.sl_atr_multiplier = 1.0;
        config.risk.take_profit = TakeProfitPolicy::AtrMultiple(2.0);
        config
    }

    /// Make sure primary and anchor are aggregated, keeping configured order
    pub fn ensure_strategy_timeframes(&mut self) {
        for tf in [
            self.strategy.anchor_timeframe.clone(),
            self.strategy.primary_timeframe.clone(),
        ] {
            if !self.timeframes.contains(&tf) {
                self.timeframes.push(tf);
            }
        }
    }

    /// Reject configurations the engine cannot run with. Called before any
    /// trade source is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeframes.is_empty() {
            return Err(ConfigError::Missing("timeframes"));
        }
        if !self.timeframes.contains(&self.strategy.primary_timeframe) {
            return Err(out_of_range(
                "strategy.primary_timeframe",
                format!("{} is not in timeframes", self.strategy.primary_timeframe),
            ));
        }
        if !self.timeframes.contains(&self.strategy.anchor_timeframe) {
            return Err(out_of_range(
                "strategy.anchor_timeframe",
                format!("{} is not in timeframes", self.strategy.anchor_timeframe),
            ));
        }
        if self.max_candle_history < 3 {
            return Err(out_of_range("max_candle_history", "must be at least 3".into()));
        }

        let s = &self.strategy;
        positive("strategy.fvg_sensitivity", s.fvg_sensitivity)?;
        if s.fvg_atr_period == 0 {
            return Err(out_of_range("strategy.fvg_atr_period", "must be at least 1".into()));
        }
        if let Some(p) = s.min_score_probability {
            if !(0.0..=1.0).contains(&p) {
                return Err(out_of_range("strategy.min_score_probability", format!("{p} not in [0, 1]")));
            }
        }

        let r = &self.risk;
        if r.risk_atr_period == 0 {
            return Err(out_of_range("risk.risk_atr_period", "must be at least 1".into()));
        }
        positive("risk.sl_atr_multiplier", r.sl_atr_multiplier)?;
        positive("risk.take_profit", r.take_profit.parameter())?;
        positive("risk.trail_activation_atr", r.trail_activation_atr)?;
        positive("risk.trail_tightening", r.trail_tightening)?;
        positive("risk.initial_capital", r.initial_capital)?;
        if r.max_hold_candles == 0 {
            return Err(out_of_range("risk.max_hold_candles", "must be at least 1".into()));
        }
        if !(r.max_drawdown_fraction > 0.0 && r.max_drawdown_fraction < 1.0) {
            return Err(out_of_range(
                "risk.max_drawdown_fraction",
                format!("{} not in (0, 1)", r.max_drawdown_fraction),
            ));
        }
        if !(r.risk_fraction > 0.0 && r.risk_fraction <= 1.0) {
            return Err(out_of_range("risk.risk_fraction", format!("{} not in (0, 1]", r.risk_fraction)));
        }

        let p = &self.persistence;
        if p.throttle_ms == 0 {
            return Err(out_of_range("persistence.throttle_ms", "must be positive".into()));
        }
        if p.lock_timeout_ms == 0 {
            return Err(out_of_range("persistence.lock_timeout_ms", "must be positive".into()));
        }
        if p.stale_lock_ms == 0 {
            return Err(out_of_range("persistence.stale_lock_ms", "must be positive".into()));
        }
        if p.flush_interval_ms == 0 {
            return Err(out_of_range("persistence.flush_interval_ms", "must be positive".into()));
        }
        if p.recent_trade_window_ms < 0 {
            return Err(out_of_range(
                "persistence.recent_trade_window_ms",
                format!("{} is negative", p.recent_trade_window_ms),
            ));
        }
        if p.channel_capacity == 0 {
            return Err(out_of_range("persistence.channel_capacity", "must be positive".into()));
        }

        Ok(())
    }
}

fn out_of_range(name: &'static str, reason: String) -> ConfigError {
    ConfigError::OutOfRange { name, reason }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(out_of_range(name, format!("{value} must be positive")))
    }
}
