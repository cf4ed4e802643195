//! Per-symbol trading pipeline
//!
//! trade -> candles -> indicators -> state machine -> position manager.
//! Each trade is processed to completion before the next one and nothing in
//! here waits on I/O; persistence goes through a non-blocking handle.

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::candles::{CandleAggregator, CandleClosed};
use super::indicators::{atr, detect_cvd_divergence, detect_fvg, FvgTracker};
use super::scorer::{DirectionalScore, ScoreGate};
use super::state_machine::{BarSignals, Direction, SignalState, SignalStateMachine, StateTransition, TradeIntent};
use super::timeframe::Timeframe;
use super::trades::Trade;
use crate::config::EngineConfig;
use crate::execution::journal::{log_line, SignalRecord};
use crate::execution::position::{ClosedTrade, Position, PositionEvent, PositionManager, TradingSummary};
use crate::persistence::{names, AggregatedTrade, AtrRecord, CvdRecord, HistoryBatch, PersistenceHandle};
use crate::types::{Side, TradeEvent};

/// Out-of-band messages for a running symbol
#[derive(Debug, Clone, PartialEq)]
pub enum TraderControl {
    /// Re-arm entries after the drawdown breaker tripped
    ResetBreaker,
    /// Latest opinion of the external scorer
    Score(DirectionalScore),
    Shutdown,
}

/// What happened while processing one trade
#[derive(Debug, Clone, PartialEq)]
pub enum TradeAction {
    CandleClosed(CandleClosed),
    Signal(StateTransition),
    Entered(Position),
    Rejected { intent: TradeIntent, reason: String },
    Exited(ClosedTrade),
    StopMoved { from: f64, to: f64 },
    BreakerTripped { capital: f64 },
}

/// Optional persistence; tests and dry runs go without
struct Sink {
    handle: Option<PersistenceHandle>,
}

impl Sink {
    fn history(&mut self, name: String, batch: HistoryBatch) {
        if let Some(handle) = self.handle.as_mut() {
            handle.submit_history(name, batch);
        }
    }

    fn live<T: Serialize + ?Sized>(&mut self, name: impl Into<String>, value: &T) {
        if let Some(handle) = self.handle.as_mut() {
            handle.submit_live(name, value);
        }
    }

    fn log(&mut self, body: &str) {
        if let Some(handle) = self.handle.as_mut() {
            handle.submit_log(log_line(body, Utc::now()));
        }
    }

    fn signal(&mut self, record: SignalRecord) {
        self.log(&record.describe());
        self.live(names::live(names::SIGNALS), &record);
        self.history(names::history(names::SIGNALS), HistoryBatch::Signals(vec![record]));
    }
}

/// Trades inside the recent-trade window
#[derive(Debug, Default)]
struct RecentTrades {
    window_ms: i64,
    trades: VecDeque<(i64, f64, Side, f64)>,
}

impl RecentTrades {
    fn push(&mut self, trade: &Trade) {
        self.trades.push_back((trade.timestamp, trade.price, trade.side, trade.size));
        let cutoff = trade.timestamp - self.window_ms;
        while self.trades.front().is_some_and(|(ts, ..)| *ts < cutoff) {
            self.trades.pop_front();
        }
    }

    fn summary(&self) -> Option<AggregatedTrade> {
        let latest = self.trades.iter().map(|(ts, ..)| *ts).max()?;
        let count = self.trades.len();
        let (mut price_sum, mut buy, mut sell) = (0.0, 0.0, 0.0);
        for (_, price, side, size) in &self.trades {
            price_sum += price;
            match side {
                Side::Buy => buy += size,
                Side::Sell => sell += size,
            }
        }
        Some(AggregatedTrade {
            timestamp: latest,
            price: price_sum / count as f64,
            volume_buy: buy,
            volume_sell: sell,
            cvd: buy - sell,
            trades: count,
        })
    }
}

/// Trading state for one symbol
pub struct SymbolTrader {
    symbol: String,
    config: Arc<EngineConfig>,
    primary: Timeframe,
    anchor: Timeframe,

    aggregator: CandleAggregator,
    state_machine: SignalStateMachine,
    fvgs: FvgTracker,
    gate: ScoreGate,
    latest_score: Option<DirectionalScore>,
    positions: PositionManager,
    recent: RecentTrades,

    sink: Sink,
    live_interval: Duration,
    last_live: Option<Instant>,

    trades_processed: u64,
    malformed_dropped: u64,
}

impl SymbolTrader {
    pub fn new(symbol: &str, config: Arc<EngineConfig>) -> Self {
        let primary = config.strategy.primary_timeframe.clone();
        let anchor = config.strategy.anchor_timeframe.clone();

        Self {
            symbol: symbol.to_string(),
            primary,
            anchor,
            aggregator: CandleAggregator::new(&config.timeframes, config.max_candle_history),
            state_machine: SignalStateMachine::new(symbol),
            fvgs: FvgTracker::new(config.max_candle_history),
            gate: ScoreGate::new(config.strategy.min_score_probability),
            latest_score: None,
            positions: PositionManager::new(symbol, config.risk.clone()),
            recent: RecentTrades {
                window_ms: config.persistence.recent_trade_window_ms,
                trades: VecDeque::new(),
            },
            sink: Sink { handle: None },
            live_interval: config.persistence.flush_interval(),
            last_live: None,
            trades_processed: 0,
            malformed_dropped: 0,
            config,
        }
    }

    /// Persist candles, indicators and signals through `handle`
    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.sink.handle = Some(handle);
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> SignalState {
        self.state_machine.state()
    }

    pub fn position(&self) -> Option<&Position> {
        self.positions.position()
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn aggregator(&self) -> &CandleAggregator {
        &self.aggregator
    }

    pub fn summary(&self) -> TradingSummary {
        self.positions.summary()
    }

    pub fn trades_processed(&self) -> u64 {
        self.trades_processed
    }

    pub fn malformed_dropped(&self) -> u64 {
        self.malformed_dropped
    }

    /// Process one trade to completion. Never fails: bad input is logged and
    /// ignored.
    pub fn process_trade(&mut self, event: TradeEvent) -> Vec<TradeAction> {
        let trade = match Trade::try_from(event) {
            Ok(trade) => trade,
            Err(e) => {
                self.malformed_dropped += 1;
                warn!("{} dropping trade: {}", self.symbol, e);
                return Vec::new();
            }
        };
        if trade.symbol != self.symbol {
            self.malformed_dropped += 1;
            warn!("{} dropping trade routed for {}", self.symbol, trade.symbol);
            return Vec::new();
        }

        self.trades_processed += 1;
        self.recent.push(&trade);

        let mut actions = Vec::new();
        let mut closes = self.aggregator.process(&trade);
        // Divergence first, so a gap closing on the same trade can confirm it
        closes.sort_by_key(|c| if c.timeframe == self.anchor { 0 } else { 1 });

        for closed in closes {
            self.on_candle_closed(&closed, &mut actions);
            actions.push(TradeAction::CandleClosed(closed));
        }

        if self.config.risk.intrabar_exits {
            let events = self.positions.on_price(trade.price, trade.timestamp);
            self.on_position_events(events, &mut actions);
        }

        self.publish_live(false);
        actions
    }

    /// Returns false once the symbol should stop
    pub fn apply_control(&mut self, control: TraderControl) -> bool {
        match control {
            TraderControl::ResetBreaker => {
                self.positions.reset_breaker();
                self.sink.log(&format!("{} drawdown breaker reset", self.symbol));
                true
            }
            TraderControl::Score(score) => {
                debug!("{} scorer update: {:?}", self.symbol, score);
                self.latest_score = Some(score);
                true
            }
            TraderControl::Shutdown => false,
        }
    }

    /// Flush closed candles and stop the persistence worker. The open candle
    /// is only written as its live snapshot.
    pub async fn shutdown(mut self) -> anyhow::Result<TradingSummary> {
        self.publish_live(true);
        let summary = self.positions.summary();
        info!(
            "{} shutting down | {} | intents {} | FVGs {} ({} open)",
            self.symbol,
            summary,
            self.state_machine.intents_emitted(),
            self.fvgs.recorded(),
            self.fvgs.active().len()
        );
        if !self.positions.is_flat() {
            warn!("{} position still open at shutdown", self.symbol);
        }

        if let Some(handle) = self.sink.handle.take() {
            handle.shutdown().await?;
        }
        Ok(summary)
    }

    fn on_candle_closed(&mut self, closed: &CandleClosed, actions: &mut Vec<TradeAction>) {
        let tf = &closed.timeframe;
        let candle = &closed.candle;
        let is_primary = *tf == self.primary;
        let is_anchor = *tf == self.anchor;

        self.sink.history(names::candles(tf), HistoryBatch::Candles(vec![candle.clone()]));
        debug!(
            "{} {} closed @ {} | O {:.2} H {:.2} L {:.2} C {:.2} | CVD {:.2}",
            self.symbol, tf, candle.timestamp, candle.open, candle.high, candle.low, candle.close, candle.cvd
        );

        let mut signals = BarSignals::default();

        if is_primary {
            // Exits on this bar come before any entry it confirms
            let primary = self.aggregator.closed(&self.primary);
            let events = self.positions.on_candle_closed(candle, primary);
            self.on_position_events(events, actions);

            let primary = self.aggregator.closed(&self.primary);
            let strategy = &self.config.strategy;

            let record = AtrRecord {
                timestamp: candle.timestamp,
                timeframe: tf.clone(),
                period: self.config.risk.risk_atr_period,
                value: atr(primary, self.config.risk.risk_atr_period),
            };
            self.sink.live(names::live(names::ATR), &record);
            self.sink.history(names::history(names::ATR), HistoryBatch::Atr(vec![record]));

            let filled = self.fvgs.invalidate(candle);
            if !filled.is_empty() {
                debug!("{} {} FVG(s) filled", self.symbol, filled.len());
                self.sink.history(names::history(names::FVG), HistoryBatch::Fvg(filled));
            }

            signals.fvg = detect_fvg(primary, strategy.fvg_sensitivity, strategy.fvg_atr_period);
            if let Some(fvg) = &signals.fvg {
                debug!(
                    "{} {:?} FVG {:.2}-{:.2} @ {}",
                    self.symbol, fvg.kind, fvg.bottom, fvg.top, fvg.start_time
                );
                if let Some(stale) = self.fvgs.record(fvg.clone()) {
                    debug!("{} oldest open FVG @ {} no longer tracked", self.symbol, stale.start_time);
                }
                self.sink.live(names::live(names::FVG), fvg);
                self.sink.history(names::history(names::FVG), HistoryBatch::Fvg(vec![fvg.clone()]));
            }
        }

        if is_anchor {
            let anchor = self.aggregator.closed(&self.anchor);
            signals.divergence = detect_cvd_divergence(anchor, self.config.strategy.cvd_mode);
            let record = CvdRecord {
                timestamp: candle.timestamp,
                timeframe: tf.clone(),
                cvd: candle.cvd,
                signal: signals.divergence,
            };
            self.sink.live(names::live(names::CVD), &record);
            self.sink.history(names::history(names::CVD), HistoryBatch::Cvd(vec![record]));
        }

        if is_primary || is_anchor {
            for transition in self.state_machine.on_closed_bar(candle, signals) {
                match &transition {
                    StateTransition::DivergenceDetected { signal } => {
                        info!("{} STATE: {} divergence -> {}", self.symbol, signal, self.state_machine.state());
                        self.sink.log(&format!(
                            "{} Waiting For {} FVG @ {}",
                            self.symbol,
                            match signal.direction() {
                                Direction::Long => "Bullish",
                                Direction::Short => "Bearish",
                            },
                            candle.timestamp
                        ));
                    }
                    StateTransition::DivergenceReplaced { previous, signal } => {
                        info!("{} STATE: {} divergence replaces pending {}", self.symbol, signal, previous);
                    }
                    StateTransition::FvgMismatch { waiting_for, fvg } => {
                        debug!("{} {:?} FVG ignored, waiting for {}", self.symbol, fvg.kind, waiting_for);
                    }
                    StateTransition::Confirmed(intent) => {
                        info!(
                            "{} SIGNAL: {} @ {:.2} (FVG {:.2}-{:.2})",
                            self.symbol, intent.direction, intent.entry_price, intent.fvg.bottom, intent.fvg.top
                        );
                        self.on_intent(intent, actions);
                    }
                }
                actions.push(TradeAction::Signal(transition));
            }
        }

        for health in self.aggregator.health() {
            debug!(
                "{} {}: {} closed / {} expected {}",
                self.symbol,
                health.timeframe,
                health.closed,
                health.expected,
                if health.is_behind() { "BEHIND" } else { "OK" }
            );
        }
    }

    fn on_intent(&mut self, intent: &TradeIntent, actions: &mut Vec<TradeAction>) {
        self.sink.signal(SignalRecord::intent(intent));

        if !self.gate.allows(intent.direction, self.latest_score.as_ref()) {
            info!("{} SKIPPED: {} signal vetoed by scorer", self.symbol, intent.direction);
            let reason = "scorer veto";
            self.sink.signal(SignalRecord::rejected(intent, reason));
            actions.push(TradeAction::Rejected {
                intent: intent.clone(),
                reason: reason.to_string(),
            });
            return;
        }

        let primary = self.aggregator.closed(&self.primary);
        match self.positions.open(intent, primary) {
            Ok(position) => {
                let position = position.clone();
                self.sink.signal(SignalRecord::entry(&position));
                self.sink.live(names::POSITION_LIVE, &Some(&position));
                actions.push(TradeAction::Entered(position));
            }
            Err(rejection) => {
                info!("{} SKIPPED: {} signal ({})", self.symbol, intent.direction, rejection);
                self.sink.signal(SignalRecord::rejection(intent, rejection));
                actions.push(TradeAction::Rejected {
                    intent: intent.clone(),
                    reason: rejection.to_string(),
                });
            }
        }
    }

    fn on_position_events(&mut self, events: Vec<PositionEvent>, actions: &mut Vec<TradeAction>) {
        for event in events {
            match event {
                PositionEvent::Closed(trade) => {
                    self.sink.signal(SignalRecord::exit(&trade));
                    self.sink.live(names::POSITION_LIVE, &Option::<Position>::None);
                    actions.push(TradeAction::Exited(trade));
                }
                PositionEvent::StopMoved { from, to } => {
                    self.sink.live(names::POSITION_LIVE, &self.positions.position());
                    actions.push(TradeAction::StopMoved { from, to });
                }
                PositionEvent::BreakerTripped { capital } => {
                    self.sink.log(&format!(
                        "{} DRAWDOWN LIMIT reached, capital {:.2}, trading paused",
                        self.symbol, capital
                    ));
                    actions.push(TradeAction::BreakerTripped { capital });
                }
            }
        }
    }

    /// Open-candle and recent-trade snapshots, at most once per flush interval
    fn publish_live(&mut self, force: bool) {
        if self.sink.handle.is_none() {
            return;
        }
        let due = force || self.last_live.map_or(true, |at| at.elapsed() >= self.live_interval);
        if !due {
            return;
        }
        self.last_live = Some(Instant::now());

        for tf in self.aggregator.timeframes() {
            if let Some(candle) = self.aggregator.current(tf) {
                self.sink.live(names::candle_current(tf), candle);
            }
        }
        if let Some(summary) = self.recent.summary() {
            self.sink.live(names::LAST_AGGREGATED_TRADE_LIVE, &summary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CvdMode;
    use crate::execution::position::OpenRejection;
    use crate::persistence::{PersistenceStore, PersistenceWorker};
    use crate::trading_core::candles::Candle;
    use crate::trading_core::scorer::ScoreCategory;

    const MIN: i64 = 60_000;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.strategy.cvd_mode = CvdMode::Raw;
        config
    }

    fn ev(side: Side, price: f64, size: f64, ts: i64) -> TradeEvent {
        TradeEvent::new("BTCUSDT", side, price, size, ts)
    }

    /// Anchor CVD +5 then -3 (bear flip), then a bearish 3-bar gap on the
    /// 1m series that closes at 95 on the first trade of minute 9.
    fn bear_scenario() -> Vec<TradeEvent> {
        let mut trades = Vec::new();
        let quiet = |m: i64, trades: &mut Vec<TradeEvent>| {
            trades.push(ev(Side::Buy, 100.0, 1.0, m * MIN + 1_000));
            trades.push(ev(Side::Sell, 100.5, 1.0, m * MIN + 2_000));
        };

        trades.push(ev(Side::Buy, 100.0, 3.0, 1_000));
        trades.push(ev(Side::Buy, 100.5, 2.0, 2_000));
        quiet(1, &mut trades);
        quiet(2, &mut trades);

        trades.push(ev(Side::Sell, 100.0, 4.0, 3 * MIN + 1_000));
        trades.push(ev(Side::Sell, 100.5, 4.0, 3 * MIN + 2_000));
        quiet(4, &mut trades);
        quiet(5, &mut trades);

        trades.push(ev(Side::Buy, 100.0, 1.0, 6 * MIN + 1_000));
        trades.push(ev(Side::Sell, 100.5, 2.0, 6 * MIN + 2_000));
        trades.push(ev(Side::Sell, 99.0, 2.0, 7 * MIN + 1_000));
        trades.push(ev(Side::Sell, 97.0, 2.0, 7 * MIN + 2_000));
        trades.push(ev(Side::Sell, 96.0, 2.0, 8 * MIN + 1_000));
        trades.push(ev(Side::Sell, 95.0, 2.0, 8 * MIN + 2_000));
        trades.push(ev(Side::Sell, 95.0, 1.0, 9 * MIN + 1_000));
        trades
    }

    fn run(trader: &mut SymbolTrader, trades: Vec<TradeEvent>) -> Vec<TradeAction> {
        trades.into_iter().flat_map(|t| trader.process_trade(t)).collect()
    }

    #[test]
    fn test_bear_divergence_then_bearish_gap_enters_short() {
        let mut trader = SymbolTrader::new("BTCUSDT", Arc::new(config()));
        let actions = run(&mut trader, bear_scenario());

        let anchor = trader.aggregator().closed(&Timeframe::minutes(3));
        let cvds: Vec<f64> = anchor.iter().map(|c| c.cvd).collect();
        assert_eq!(cvds[..2], [5.0, -3.0]);

        let detected = actions.iter().position(|a| {
            matches!(a, TradeAction::Signal(StateTransition::DivergenceDetected { signal }) if signal.direction() == Direction::Short)
        });
        let confirmed = actions.iter().position(|a| matches!(a, TradeAction::Signal(StateTransition::Confirmed(_))));
        assert!(detected.unwrap() < confirmed.unwrap());

        let entered = actions
            .iter()
            .find_map(|a| match a {
                TradeAction::Entered(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap();

        let atr = 8.0 / 7.0;
        assert_eq!(entered.direction, Direction::Short);
        assert_eq!(entered.entry_price, 95.0);
        assert_eq!(entered.entry_time, 8 * MIN);
        assert!((entered.stop_loss - (95.0 + atr * 6.5)).abs() < 1e-9);
        assert!((entered.take_profit - (95.0 - atr * 6.5 * 0.57)).abs() < 1e-9);

        assert_eq!(trader.state(), SignalState::WaitingForDivergence);
        assert!(trader.position().is_some());
    }

    #[test]
    fn test_atr_multiple_policy_in_scenario() {
        let mut trader = SymbolTrader::new("BTCUSDT", Arc::new(EngineConfig::atr_target()));
        run(&mut trader, bear_scenario());

        let position = trader.position().unwrap();
        let atr = 8.0 / 7.0;
        assert!((position.stop_loss - (95.0 + atr)).abs() < 1e-9);
        assert!((position.take_profit - (95.0 - 2.0 * atr)).abs() < 1e-9);
    }

    #[test]
    fn test_scorer_hold_vetoes_entry() {
        let mut trader = SymbolTrader::new("BTCUSDT", Arc::new(config()));
        assert!(trader.apply_control(TraderControl::Score(DirectionalScore::Category(ScoreCategory::Hold))));

        let actions = run(&mut trader, bear_scenario());
        assert!(actions.iter().any(|a| matches!(a, TradeAction::Rejected { reason, .. } if reason == "scorer veto")));
        assert!(trader.position().is_none());
        // The cycle still completes
        assert_eq!(trader.state(), SignalState::WaitingForDivergence);
    }

    #[test]
    fn test_malformed_trades_leave_state_untouched() {
        let mut trader = SymbolTrader::new("BTCUSDT", Arc::new(config()));
        trader.process_trade(ev(Side::Buy, 100.0, 1.0, 1_000));

        let mut bad = ev(Side::Buy, 100.0, 1.0, 2_000);
        bad.timestamp = Some(f64::NAN);
        assert!(trader.process_trade(bad).is_empty());
        assert!(trader.process_trade(ev(Side::Buy, -1.0, 1.0, 3_000)).is_empty());
        assert!(trader.process_trade(TradeEvent::new("ETHUSDT", Side::Buy, 10.0, 1.0, 4_000)).is_empty());

        assert_eq!(trader.malformed_dropped(), 3);
        assert_eq!(trader.trades_processed(), 1);
        let current: &Candle = trader.aggregator().current(&Timeframe::minutes(1)).unwrap();
        assert_eq!(current.volume_buy, 1.0);
    }

    #[test]
    fn test_shutdown_control_stops() {
        let mut trader = SymbolTrader::new("BTCUSDT", Arc::new(config()));
        assert!(trader.apply_control(TraderControl::ResetBreaker));
        assert!(!trader.apply_control(TraderControl::Shutdown));
    }

    #[test]
    fn test_second_intent_rejected_while_position_open() {
        let mut trader = SymbolTrader::new("BTCUSDT", Arc::new(config()));
        run(&mut trader, bear_scenario());
        let first = trader.position().unwrap().id;

        let pm = &mut trader.positions;
        let intent = TradeIntent {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: 95.0,
            entry_time: 9 * MIN,
            fvg: trader.fvgs.active()[0].clone(),
        };
        let primary = trader.aggregator.closed(&trader.primary);
        assert_eq!(pm.open(&intent, primary).unwrap_err(), OpenRejection::PositionOpen);
        assert_eq!(trader.position().unwrap().id, first);
    }

    #[tokio::test]
    async fn test_scenario_persists_series() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let store = PersistenceStore::from_config(dir.path(), &config.persistence);
        store.ensure_layout().unwrap();
        let handle = PersistenceWorker::spawn(store.clone(), &config.persistence);

        let mut trader = SymbolTrader::new("BTCUSDT", Arc::new(config)).with_persistence(handle);
        run(&mut trader, bear_scenario());
        let summary = trader.shutdown().await.unwrap();
        assert_eq!(summary.total_trades, 0);

        let candles: Vec<Candle> = store.read_history("candles_1m").unwrap();
        assert_eq!(candles.len(), 9);
        assert!(candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        let anchor: Vec<Candle> = store.read_history("candles_3m").unwrap();
        assert_eq!(anchor.len(), 3);

        let signals: Vec<SignalRecord> = store.read_history("signals_history").unwrap();
        assert_eq!(signals.len(), 2);

        let position: Option<Position> = store.read_live("position_live").unwrap().flatten();
        assert_eq!(position.unwrap().direction, Direction::Short);

        // The open 9th minute only exists as a snapshot
        let current: Option<Candle> = store.read_live("candle_current_1m").unwrap();
        assert_eq!(current.unwrap().timestamp, 9 * MIN);

        let log = std::fs::read_to_string(store.signals_log_path()).unwrap();
        assert!(log.contains("Sell Signal"));
        assert!(log.contains("ENTRY Short"));
    }
}
