//! Trade types for trading core

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{Side, TradeEvent};

/// A trade that passed input validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    /// Epoch milliseconds
    pub timestamp: i64,
}

/// Latest accepted trade time, 9999-12-31T23:59:59.999Z
const MAX_TIMESTAMP_MS: f64 = 253_402_300_799_999.0;

impl TryFrom<TradeEvent> for Trade {
    type Error = EngineError;

    fn try_from(event: TradeEvent) -> Result<Self, Self::Error> {
        if event.symbol.trim().is_empty() {
            return Err(EngineError::MalformedInput("empty symbol".to_string()));
        }

        let timestamp = match event.timestamp {
            Some(ts) if ts.is_finite() && (0.0..=MAX_TIMESTAMP_MS).contains(&ts) => ts.floor() as i64,
            Some(ts) => {
                return Err(EngineError::MalformedInput(format!("invalid timestamp {ts}")));
            }
            None => return Err(EngineError::MalformedInput("missing timestamp".to_string())),
        };

        if !event.price.is_finite() || event.price <= 0.0 {
            return Err(EngineError::MalformedInput(format!(
                "non-positive price {}",
                event.price
            )));
        }

        if !event.size.is_finite() || event.size < 0.0 {
            return Err(EngineError::MalformedInput(format!("invalid size {}", event.size)));
        }

        Ok(Self {
            symbol: event.symbol,
            side: event.side,
            price: event.price,
            size: event.size,
            timestamp,
        })
    }
}
