use serde::{Deserialize, Serialize};

/// Aggressor side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(alias = "buy", alias = "BUY")]
    Buy,
    #[serde(alias = "sell", alias = "SELL")]
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

/// Normalized trade event as delivered by an exchange collaborator.
///
/// Fields are deliberately loose: the timestamp may be missing or non-finite
/// and the price may be garbage. `Trade::try_from` decides what gets through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(default)]
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    #[serde(alias = "volume", alias = "qty")]
    pub size: f64,
    /// Epoch milliseconds
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl TradeEvent {
    pub fn new(symbol: &str, side: Side, price: f64, size: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            price,
            size,
            timestamp: Some(timestamp as f64),
        }
    }
}
