//! Position management, capital tracking and the drawdown breaker
//!
//! At most one open position per symbol. Exits are evaluated on every closed
//! primary candle (and optionally on every tick):
//! - stop-loss before take-profit when one bar touches both
//! - timeout at the close after `max_hold_candles`
//! - trailing ratchet last, using the bar's close

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RiskConfig, TakeProfitPolicy};
use crate::trading_core::candles::Candle;
use crate::trading_core::indicators::atr;
use crate::trading_core::state_machine::{Direction, TradeIntent};

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    /// Stop hit after it was ratcheted away from the initial level
    TrailingStop,
    TakeProfit,
    Timeout,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP"),
            ExitReason::TrailingStop => write!(f, "TRAIL"),
            ExitReason::TakeProfit => write!(f, "TARGET"),
            ExitReason::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Why an intent did not become a position
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum OpenRejection {
    #[error("a position is already open")]
    PositionOpen,
    #[error("drawdown breaker tripped")]
    BreakerTripped,
    #[error("ATR is zero, no stop distance")]
    ZeroVolatility,
    #[error("no capital left to size a position")]
    InsufficientCapital,
}

/// Open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time: i64,
    pub stop_loss: f64,
    pub initial_stop: f64,
    pub take_profit: f64,
    pub size: f64,
    pub atr_at_entry: f64,
    /// Primary candles closed since entry
    pub candles_held: usize,
    pub highest_favorable_excursion: f64,
}

impl Position {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price) * self.size
    }

    fn stop_reason(&self) -> ExitReason {
        if self.stop_loss == self.initial_stop {
            ExitReason::StopLoss
        } else {
            ExitReason::TrailingStop
        }
    }
}

/// Completed trade record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedTrade {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
    pub pnl: f64,
    /// P&L relative to capital before the trade, in percent
    pub pnl_pct: f64,
    pub reason: ExitReason,
    pub capital_after: f64,
}

/// Events produced while managing an open position
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Closed(ClosedTrade),
    StopMoved { from: f64, to: f64 },
    BreakerTripped { capital: f64 },
}

/// Summary of trading results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradingSummary {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Peak-to-trough, as a fraction of the peak
    pub max_drawdown: f64,
    /// Mean over standard deviation of per-trade returns
    pub sharpe_ratio: f64,
    pub initial_capital: f64,
    pub final_capital: f64,
}

impl std::fmt::Display for TradingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Capital: {:.2} -> {:.2} | Trades: {} | WR: {:.1}% | PF: {:.2} | MaxDD: {:.1}% | Sharpe: {:.2}",
            self.initial_capital,
            self.final_capital,
            self.total_trades,
            self.win_rate * 100.0,
            self.profit_factor,
            self.max_drawdown * 100.0,
            self.sharpe_ratio
        )
    }
}

/// Position manager for one symbol
#[derive(Debug)]
pub struct PositionManager {
    symbol: String,
    config: RiskConfig,
    position: Option<Position>,

    capital: f64,
    peak_capital: f64,
    max_drawdown: f64,
    breaker_tripped: bool,

    total_trades: u32,
    wins: u32,
    losses: u32,
    gross_profit: f64,
    gross_loss: f64,
    /// Per-trade returns, fractions of capital
    returns: Vec<f64>,
}

impl PositionManager {
    pub fn new(symbol: &str, config: RiskConfig) -> Self {
        let capital = config.initial_capital;
        Self {
            symbol: symbol.to_string(),
            config,
            position: None,
            capital,
            peak_capital: capital,
            max_drawdown: 0.0,
            breaker_tripped: false,
            total_trades: 0,
            wins: 0,
            losses: 0,
            gross_profit: 0.0,
            gross_loss: 0.0,
            returns: Vec::new(),
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn breaker_tripped(&self) -> bool {
        self.breaker_tripped
    }

    /// Re-arm entries after a breaker trip. Never happens on its own.
    pub fn reset_breaker(&mut self) {
        if self.breaker_tripped {
            info!(
                "{} drawdown breaker reset by operator (capital {:.2})",
                self.symbol, self.capital
            );
        }
        self.breaker_tripped = false;
    }

    /// Open a position from an intent. `primary` is the closed primary series
    /// including the confirming candle.
    pub fn open(&mut self, intent: &TradeIntent, primary: &[Candle]) -> Result<&Position, OpenRejection> {
        if self.position.is_some() {
            return Err(OpenRejection::PositionOpen);
        }
        if self.breaker_tripped {
            return Err(OpenRejection::BreakerTripped);
        }
        if self.capital <= 0.0 {
            return Err(OpenRejection::InsufficientCapital);
        }

        let volatility = atr(primary, self.config.risk_atr_period);
        if !(volatility.is_finite() && volatility > 0.0) {
            return Err(OpenRejection::ZeroVolatility);
        }

        let sign = intent.direction.sign();
        let entry = intent.entry_price;
        let stop_distance = volatility * self.config.sl_atr_multiplier;
        let stop_loss = entry - sign * stop_distance;
        let take_profit = match self.config.take_profit {
            TakeProfitPolicy::AtrMultiple(m) => entry + sign * volatility * m,
            TakeProfitPolicy::RiskReward(r) => entry + sign * (entry - stop_loss).abs() * r,
        };
        let size = self.capital * self.config.risk_fraction / stop_distance;

        info!(
            "ENTRY: {} {} @ {:.2} | Size: {:.4} | SL: {:.2} | TP: {:.2} | ATR: {:.2}",
            self.symbol, intent.direction, entry, size, stop_loss, take_profit, volatility
        );

        Ok(self.position.insert(Position {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            direction: intent.direction,
            entry_price: entry,
            entry_time: intent.entry_time,
            stop_loss,
            initial_stop: stop_loss,
            take_profit,
            size,
            atr_at_entry: volatility,
            candles_held: 0,
            highest_favorable_excursion: 0.0,
        }))
    }

    /// Manage the open position on a closed primary candle. `primary` is the
    /// closed primary series ending with `candle`.
    pub fn on_candle_closed(&mut self, candle: &Candle, primary: &[Candle]) -> Vec<PositionEvent> {
        let Some(pos) = self.position.as_mut() else {
            return Vec::new();
        };

        pos.candles_held += 1;
        let excursion = match pos.direction {
            Direction::Long => candle.high - pos.entry_price,
            Direction::Short => pos.entry_price - candle.low,
        };
        pos.highest_favorable_excursion = pos.highest_favorable_excursion.max(excursion);

        let exit = match pos.direction {
            Direction::Long if candle.low <= pos.stop_loss => Some((pos.stop_loss, pos.stop_reason())),
            Direction::Short if candle.high >= pos.stop_loss => Some((pos.stop_loss, pos.stop_reason())),
            Direction::Long if candle.high >= pos.take_profit => Some((pos.take_profit, ExitReason::TakeProfit)),
            Direction::Short if candle.low <= pos.take_profit => Some((pos.take_profit, ExitReason::TakeProfit)),
            _ if pos.candles_held >= self.config.max_hold_candles => Some((candle.close, ExitReason::Timeout)),
            _ => None,
        };

        if let Some((price, reason)) = exit {
            return self.close_position(price, candle.timestamp, reason);
        }

        // Trailing ratchet, never loosens
        let volatility = atr(primary, self.config.risk_atr_period);
        let profit = pos.direction.sign() * (candle.close - pos.entry_price);
        if volatility > 0.0 && profit > self.config.trail_activation_atr * volatility {
            let distance = volatility * self.config.sl_atr_multiplier * self.config.trail_tightening;
            let candidate = candle.close - pos.direction.sign() * distance;
            let tighter = match pos.direction {
                Direction::Long => candidate > pos.stop_loss,
                Direction::Short => candidate < pos.stop_loss,
            };
            if tighter {
                let from = pos.stop_loss;
                pos.stop_loss = candidate;
                debug!("{} stop ratcheted {:.2} -> {:.2}", self.symbol, from, candidate);
                return vec![PositionEvent::StopMoved { from, to: candidate }];
            }
        }

        Vec::new()
    }

    /// Intrabar check against a trade price; exits fill at that price
    pub fn on_price(&mut self, price: f64, timestamp: i64) -> Vec<PositionEvent> {
        let Some(pos) = self.position.as_mut() else {
            return Vec::new();
        };

        let excursion = pos.direction.sign() * (price - pos.entry_price);
        pos.highest_favorable_excursion = pos.highest_favorable_excursion.max(excursion);

        let reason = match pos.direction {
            Direction::Long if price <= pos.stop_loss => Some(pos.stop_reason()),
            Direction::Short if price >= pos.stop_loss => Some(pos.stop_reason()),
            Direction::Long if price >= pos.take_profit => Some(ExitReason::TakeProfit),
            Direction::Short if price <= pos.take_profit => Some(ExitReason::TakeProfit),
            _ => None,
        };

        match reason {
            Some(reason) => self.close_position(price, timestamp, reason),
            None => Vec::new(),
        }
    }

    fn close_position(&mut self, exit_price: f64, exit_time: i64, reason: ExitReason) -> Vec<PositionEvent> {
        let Some(pos) = self.position.take() else {
            return Vec::new();
        };

        let pnl = pos.unrealized_pnl(exit_price);
        let capital_before = self.capital;
        self.capital += pnl;
        let pnl_pct = if capital_before != 0.0 {
            pnl / capital_before * 100.0
        } else {
            0.0
        };

        self.total_trades += 1;
        self.returns.push(pnl_pct / 100.0);
        if pnl > 0.0 {
            self.wins += 1;
            self.gross_profit += pnl;
        } else {
            self.losses += 1;
            self.gross_loss += pnl.abs();
        }

        if self.capital > self.peak_capital {
            self.peak_capital = self.capital;
        }
        if self.peak_capital > 0.0 {
            let drawdown = (self.peak_capital - self.capital) / self.peak_capital;
            self.max_drawdown = self.max_drawdown.max(drawdown);
        }

        info!(
            "EXIT {}: {} {} @ {:.2} | P&L: {:+.2} ({:+.2}%) | Capital: {:.2}",
            reason, self.symbol, pos.direction, exit_price, pnl, pnl_pct, self.capital
        );

        let record = ClosedTrade {
            id: pos.id,
            symbol: pos.symbol,
            direction: pos.direction,
            entry_price: pos.entry_price,
            exit_price,
            entry_time: pos.entry_time,
            exit_time,
            stop_loss: pos.stop_loss,
            take_profit: pos.take_profit,
            size: pos.size,
            pnl,
            pnl_pct,
            reason,
            capital_after: self.capital,
        };

        let mut events = vec![PositionEvent::Closed(record)];

        let floor = self.config.initial_capital * (1.0 - self.config.max_drawdown_fraction);
        if !self.breaker_tripped && self.capital < floor {
            self.breaker_tripped = true;
            warn!(
                "{} DRAWDOWN LIMIT ({:.0}%) reached: capital {:.2} < {:.2}, entries paused until reset",
                self.symbol,
                self.config.max_drawdown_fraction * 100.0,
                self.capital,
                floor
            );
            events.push(PositionEvent::BreakerTripped { capital: self.capital });
        }

        events
    }

    pub fn summary(&self) -> TradingSummary {
        let total = self.total_trades;
        let win_rate = if total > 0 { self.wins as f64 / total as f64 } else { 0.0 };

        let profit_factor = if self.gross_loss > 0.0 {
            self.gross_profit / self.gross_loss
        } else if self.gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win = if self.wins > 0 { self.gross_profit / self.wins as f64 } else { 0.0 };
        let avg_loss = if self.losses > 0 { -(self.gross_loss / self.losses as f64) } else { 0.0 };

        let sharpe_ratio = if self.returns.len() > 1 {
            let n = self.returns.len() as f64;
            let mean = self.returns.iter().sum::<f64>() / n;
            let variance = self.returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
            let std_dev = variance.sqrt();
            if std_dev > 0.0 { mean / std_dev } else { 0.0 }
        } else {
            0.0
        };

        TradingSummary {
            total_trades: total,
            wins: self.wins,
            losses: self.losses,
            win_rate,
            gross_profit: self.gross_profit,
            gross_loss: self.gross_loss,
            profit_factor,
            avg_win,
            avg_loss,
            max_drawdown: self.max_drawdown,
            sharpe_ratio,
            initial_capital: self.config.initial_capital,
            final_capital: self.capital,
        }
    }
}
