//! Signal journal
//!
//! Every intent, entry, rejection and exit becomes both a structured
//! `SignalRecord` (for `signals_history`) and a `[timestamp] ...` line in the
//! human-readable `signals.log`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::position::{ClosedTrade, OpenRejection, Position};
use crate::persistence::HistoryRecord;
use crate::trading_core::state_machine::{Direction, TradeIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalEvent {
    Intent,
    Entry,
    Rejected,
    Exit,
}

impl SignalEvent {
    fn ordinal(&self) -> i64 {
        match self {
            SignalEvent::Intent => 0,
            SignalEvent::Entry => 1,
            SignalEvent::Rejected => 2,
            SignalEvent::Exit => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRecord {
    pub event: SignalEvent,
    /// Candle bucket (or tick time for intrabar exits), epoch ms
    pub timestamp: i64,
    pub symbol: String,
    pub direction: Direction,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub pnl: Option<f64>,
    pub reason: Option<String>,
}

/// One record per event kind per timestamp
impl HistoryRecord for SignalRecord {
    fn history_key(&self) -> i64 {
        self.timestamp.saturating_mul(4).saturating_add(self.event.ordinal())
    }
}

impl SignalRecord {
    pub fn intent(intent: &TradeIntent) -> Self {
        Self {
            event: SignalEvent::Intent,
            timestamp: intent.entry_time,
            symbol: intent.symbol.clone(),
            direction: intent.direction,
            price: intent.entry_price,
            stop_loss: None,
            take_profit: None,
            pnl: None,
            reason: None,
        }
    }

    pub fn entry(position: &Position) -> Self {
        Self {
            event: SignalEvent::Entry,
            timestamp: position.entry_time,
            symbol: position.symbol.clone(),
            direction: position.direction,
            price: position.entry_price,
            stop_loss: Some(position.stop_loss),
            take_profit: Some(position.take_profit),
            pnl: None,
            reason: None,
        }
    }

    pub fn rejected(intent: &TradeIntent, reason: &str) -> Self {
        Self {
            event: SignalEvent::Rejected,
            reason: Some(reason.to_string()),
            ..Self::intent(intent)
        }
    }

    pub fn rejection(intent: &TradeIntent, rejection: OpenRejection) -> Self {
        Self::rejected(intent, &rejection.to_string())
    }

    pub fn exit(trade: &ClosedTrade) -> Self {
        Self {
            event: SignalEvent::Exit,
            timestamp: trade.exit_time,
            symbol: trade.symbol.clone(),
            direction: trade.direction,
            price: trade.exit_price,
            stop_loss: Some(trade.stop_loss),
            take_profit: Some(trade.take_profit),
            pnl: Some(trade.pnl),
            reason: Some(trade.reason.to_string()),
        }
    }

    /// Log line body, without the leading wall-clock stamp
    pub fn describe(&self) -> String {
        let at = format_ms(self.timestamp);
        let levels = match (self.stop_loss, self.take_profit) {
            (Some(sl), Some(tp)) => format!(" | SL: {sl:.2} | TP: {tp:.2}"),
            _ => String::new(),
        };

        match self.event {
            SignalEvent::Intent => {
                let side = match self.direction {
                    Direction::Long => "Buy",
                    Direction::Short => "Sell",
                };
                format!("{} {} Signal @ {} - Price: {:.2}", self.symbol, side, at, self.price)
            }
            SignalEvent::Entry => format!(
                "{} ENTRY {} @ {} - Price: {:.2}{}",
                self.symbol, self.direction, at, self.price, levels
            ),
            SignalEvent::Rejected => format!(
                "{} SKIPPED {} @ {} - Price: {:.2} ({})",
                self.symbol,
                self.direction,
                at,
                self.price,
                self.reason.as_deref().unwrap_or("rejected")
            ),
            SignalEvent::Exit => format!(
                "{} EXIT {} {} @ {} - Price: {:.2}{} | P&L: {:+.2}",
                self.symbol,
                self.reason.as_deref().unwrap_or(""),
                self.direction,
                at,
                self.price,
                levels,
                self.pnl.unwrap_or(0.0)
            ),
        }
    }
}

/// `[<wall clock ISO>] <body>`
pub fn log_line(body: &str, now: DateTime<Utc>) -> String {
    format!("[{}] {}", now.to_rfc3339_opts(SecondsFormat::Millis, true), body)
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}
