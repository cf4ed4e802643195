//! Trading Core - per-symbol signal logic
//!
//! This module contains the strategy components:
//! - Timeframe parsing and bucketing
//! - Trade validation
//! - Multi-timeframe candle aggregation with running CVD
//! - ATR, CVD divergence and fair value gap detection
//! - Divergence / gap state machine
//! - Optional external score gate
//! - Per-symbol orchestration

pub mod timeframe;
pub mod trades;
pub mod candles;
pub mod indicators;
pub mod state_machine;
pub mod scorer;
pub mod trader;

// Re-export commonly used types
pub use timeframe::Timeframe;
pub use trades::Trade;
pub use candles::{Candle, CandleAggregator, CandleClosed, SeriesHealth};
pub use indicators::{CvdSignal, Fvg, FvgKind, FvgTracker};
pub use state_machine::{Direction, SignalState, SignalStateMachine, StateTransition, TradeIntent};
pub use scorer::{DirectionalScore, ScoreCategory, ScoreGate};
pub use trader::{SymbolTrader, TradeAction, TraderControl};
