//! Execution module: simulated positions and the signal journal
//!
//! Positions are opened from confirmed intents and managed on closed
//! primary candles (and optionally on every tick). No orders leave the
//! process.

pub mod journal;
pub mod position;

pub use journal::{SignalEvent, SignalRecord};
pub use position::{ClosedTrade, ExitReason, OpenRejection, Position, PositionEvent, PositionManager, TradingSummary};
