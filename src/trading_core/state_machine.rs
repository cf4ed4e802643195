//! Signal state machine for the CVD divergence strategy
//!
//! Cyclic, one instance per symbol:
//! 1. WAITING_FOR_DIVERGENCE - wait for a CVD sign flip on the anchor timeframe
//! 2. WAITING_FOR_CONFIRMATION - wait for a fair value gap of matching polarity
//!    on the primary timeframe, then emit a `TradeIntent` and go back to 1
//!
//! A newer divergence overwrites the pending one. A gap of the wrong polarity
//! is reported but leaves the state alone.

use serde::{Deserialize, Serialize};

use super::candles::Candle;
use super::indicators::{CvdSignal, Fvg};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "Long"),
            Direction::Short => write!(f, "Short"),
        }
    }
}

/// State of the signal state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalState {
    WaitingForDivergence,
    /// Divergence seen, waiting for a gap in this direction
    WaitingForConfirmation(Direction),
}

impl std::fmt::Display for SignalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalState::WaitingForDivergence => write!(f, "WAITING_DIVERGENCE"),
            SignalState::WaitingForConfirmation(d) => write!(f, "WAITING_FVG({d})"),
        }
    }
}

/// Indicator outputs for one closed candle
#[derive(Debug, Clone, Default)]
pub struct BarSignals {
    /// Set on anchor closes only
    pub divergence: Option<CvdSignal>,
    /// Set on primary closes only
    pub fvg: Option<Fvg>,
}

/// Entry request handed to the position manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub symbol: String,
    pub direction: Direction,
    /// Close of the confirming candle
    pub entry_price: f64,
    /// Bucket start of the confirming candle
    pub entry_time: i64,
    pub fvg: Fvg,
}

/// State transitions reported to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum StateTransition {
    DivergenceDetected { signal: CvdSignal },
    /// Pending divergence overwritten by a newer one
    DivergenceReplaced { previous: Direction, signal: CvdSignal },
    /// Gap detected while waiting for the other polarity
    FvgMismatch { waiting_for: Direction, fvg: Fvg },
    Confirmed(TradeIntent),
}

/// Per-symbol divergence -> gap -> intent cycle
#[derive(Debug)]
pub struct SignalStateMachine {
    symbol: String,
    state: SignalState,
    intents_emitted: u64,
}

impl SignalStateMachine {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            state: SignalState::WaitingForDivergence,
            intents_emitted: 0,
        }
    }

    pub fn state(&self) -> SignalState {
        self.state
    }

    pub fn intents_emitted(&self) -> u64 {
        self.intents_emitted
    }

    /// Evaluate once per closed candle. Divergence is applied before the gap,
    /// so a timeframe serving as both anchor and primary sees its own flip.
    pub fn on_closed_bar(&mut self, candle: &Candle, signals: BarSignals) -> Vec<StateTransition> {
        let mut transitions = Vec::new();

        if let Some(signal) = signals.divergence {
            let direction = signal.direction();
            match self.state {
                SignalState::WaitingForDivergence => {
                    transitions.push(StateTransition::DivergenceDetected { signal });
                }
                SignalState::WaitingForConfirmation(previous) => {
                    transitions.push(StateTransition::DivergenceReplaced { previous, signal });
                }
            }
            self.state = SignalState::WaitingForConfirmation(direction);
        }

        if let (Some(fvg), SignalState::WaitingForConfirmation(direction)) = (signals.fvg, self.state) {
            if fvg.kind.direction() == direction {
                let intent = TradeIntent {
                    symbol: self.symbol.clone(),
                    direction,
                    entry_price: candle.close,
                    entry_time: candle.timestamp,
                    fvg,
                };
                self.state = SignalState::WaitingForDivergence;
                self.intents_emitted += 1;
                transitions.push(StateTransition::Confirmed(intent));
            } else {
                transitions.push(StateTransition::FvgMismatch {
                    waiting_for: direction,
                    fvg,
                });
            }
        }

        transitions
    }

    /// Drop any pending divergence
    pub fn reset(&mut self) {
        self.state = SignalState::WaitingForDivergence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::indicators::FvgKind;
    use proptest::prelude::*;

    fn bar(ts: i64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume_buy: 0.0,
            volume_sell: 0.0,
            cvd: 0.0,
        }
    }

    fn fvg(kind: FvgKind, ts: i64) -> Fvg {
        Fvg {
            kind,
            top: 101.0,
            bottom: 100.0,
            start_time: ts,
            end_time: None,
        }
    }

    fn divergence(signal: CvdSignal) -> BarSignals {
        BarSignals {
            divergence: Some(signal),
            fvg: None,
        }
    }

    fn gap(kind: FvgKind, ts: i64) -> BarSignals {
        BarSignals {
            divergence: None,
            fvg: Some(fvg(kind, ts)),
        }
    }

    #[test]
    fn test_state_machine_init() {
        let sm = SignalStateMachine::new("BTCUSDT");
        assert_eq!(sm.state(), SignalState::WaitingForDivergence);
        assert_eq!(sm.intents_emitted(), 0);
    }

    #[test]
    fn test_divergence_then_matching_gap() {
        let mut sm = SignalStateMachine::new("BTCUSDT");

        let t = sm.on_closed_bar(&bar(0, 100.0), divergence(CvdSignal::Bear));
        assert_eq!(t, vec![StateTransition::DivergenceDetected { signal: CvdSignal::Bear }]);
        assert_eq!(sm.state(), SignalState::WaitingForConfirmation(Direction::Short));

        let t = sm.on_closed_bar(&bar(60_000, 99.0), gap(FvgKind::Bearish, 60_000));
        match t.as_slice() {
            [StateTransition::Confirmed(intent)] => {
                assert_eq!(intent.direction, Direction::Short);
                assert_eq!(intent.entry_price, 99.0);
                assert_eq!(intent.entry_time, 60_000);
                assert_eq!(intent.symbol, "BTCUSDT");
            }
            other => panic!("unexpected transitions {other:?}"),
        }
        assert_eq!(sm.state(), SignalState::WaitingForDivergence);
    }

    #[test]
    fn test_gap_without_divergence_ignored() {
        let mut sm = SignalStateMachine::new("BTCUSDT");
        assert!(sm.on_closed_bar(&bar(0, 100.0), gap(FvgKind::Bullish, 0)).is_empty());
        assert_eq!(sm.state(), SignalState::WaitingForDivergence);
    }

    #[test]
    fn test_wrong_polarity_gap_keeps_state() {
        let mut sm = SignalStateMachine::new("BTCUSDT");
        sm.on_closed_bar(&bar(0, 100.0), divergence(CvdSignal::Bull));

        let t = sm.on_closed_bar(&bar(60_000, 100.0), gap(FvgKind::Bearish, 60_000));
        assert!(matches!(
            t.as_slice(),
            [StateTransition::FvgMismatch { waiting_for: Direction::Long, .. }]
        ));
        assert_eq!(sm.state(), SignalState::WaitingForConfirmation(Direction::Long));
    }

    #[test]
    fn test_latest_divergence_wins() {
        let mut sm = SignalStateMachine::new("BTCUSDT");
        sm.on_closed_bar(&bar(0, 100.0), divergence(CvdSignal::Bull));
        let t = sm.on_closed_bar(&bar(180_000, 100.0), divergence(CvdSignal::Bear));
        assert_eq!(
            t,
            vec![StateTransition::DivergenceReplaced {
                previous: Direction::Long,
                signal: CvdSignal::Bear
            }]
        );

        // The earlier bullish divergence is gone
        let t = sm.on_closed_bar(&bar(240_000, 100.0), gap(FvgKind::Bullish, 240_000));
        assert!(matches!(t.as_slice(), [StateTransition::FvgMismatch { .. }]));
    }

    #[test]
    fn test_divergence_and_gap_on_same_bar() {
        let mut sm = SignalStateMachine::new("BTCUSDT");
        let signals = BarSignals {
            divergence: Some(CvdSignal::Bull),
            fvg: Some(fvg(FvgKind::Bullish, 0)),
        };
        let t = sm.on_closed_bar(&bar(0, 100.0), signals);
        assert_eq!(t.len(), 2);
        assert!(matches!(t[1], StateTransition::Confirmed(_)));
        assert_eq!(sm.state(), SignalState::WaitingForDivergence);
    }

    #[test]
    fn test_reset_drops_pending() {
        let mut sm = SignalStateMachine::new("BTCUSDT");
        sm.on_closed_bar(&bar(0, 100.0), divergence(CvdSignal::Bear));
        sm.reset();
        assert!(sm.on_closed_bar(&bar(60_000, 99.0), gap(FvgKind::Bearish, 60_000)).is_empty());
    }

    fn arb_signals() -> impl Strategy<Value = BarSignals> {
        let div = prop_oneof![Just(None), Just(Some(CvdSignal::Bull)), Just(Some(CvdSignal::Bear))];
        let kind = prop_oneof![Just(None), Just(Some(FvgKind::Bullish)), Just(Some(FvgKind::Bearish))];
        (div, kind).prop_map(|(divergence, kind)| BarSignals {
            divergence,
            fvg: kind.map(|k| fvg(k, 0)),
        })
    }

    proptest! {
        #[test]
        fn prop_no_back_to_back_intents(seq in prop::collection::vec(arb_signals(), 0..200)) {
            let mut sm = SignalStateMachine::new("BTCUSDT");
            let mut armed = false;
            for (i, signals) in seq.into_iter().enumerate() {
                for t in sm.on_closed_bar(&bar(i as i64 * 60_000, 100.0), signals) {
                    match t {
                        StateTransition::DivergenceDetected { .. }
                        | StateTransition::DivergenceReplaced { .. } => armed = true,
                        StateTransition::Confirmed(_) => {
                            prop_assert!(armed);
                            armed = false;
                            prop_assert_eq!(sm.state(), SignalState::WaitingForDivergence);
                        }
                        StateTransition::FvgMismatch { .. } => {}
                    }
                }
            }
        }
    }
}
