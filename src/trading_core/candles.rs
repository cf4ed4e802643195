//! Candle aggregation from trades
//!
//! One open candle per timeframe. A trade for a later bucket closes the open
//! candle and starts the next one, which inherits the cumulative volume delta
//! of the candle it replaced. Late trades (bucket already closed) are folded
//! into the open candle rather than rewriting history.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::timeframe::Timeframe;
use super::trades::Trade;
use crate::types::Side;

/// OHLC candle with buy/sell volume and cumulative volume delta.
///
/// Serialized with the record layout the chart reads:
/// `{timestamp, open, high, low, close, volumeBuy, volumeSell, cvd}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Bucket start, epoch milliseconds
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume_buy: f64,
    pub volume_sell: f64,
    /// Cumulative volume delta including every earlier closed candle
    pub cvd: f64,
}

impl Candle {
    /// Volume delta of this candle alone
    pub fn delta(&self) -> f64 {
        self.volume_buy - self.volume_sell
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Emitted exactly once per timeframe per bucket
#[derive(Debug, Clone, PartialEq)]
pub struct CandleClosed {
    pub timeframe: Timeframe,
    pub candle: Candle,
}

/// Candle under construction. `base_cvd` is the cumulative delta of the
/// previously closed candle.
#[derive(Debug, Clone)]
struct CandleBuilder {
    candle: Candle,
    base_cvd: f64,
}

impl CandleBuilder {
    fn new(bucket: i64, trade: &Trade, base_cvd: f64) -> Self {
        let mut builder = Self {
            candle: Candle {
                timestamp: bucket,
                open: trade.price,
                high: trade.price,
                low: trade.price,
                close: trade.price,
                volume_buy: 0.0,
                volume_sell: 0.0,
                cvd: base_cvd,
            },
            base_cvd,
        };
        builder.add_volume(trade);
        builder
    }

    fn add_trade(&mut self, trade: &Trade) {
        self.candle.high = self.candle.high.max(trade.price);
        self.candle.low = self.candle.low.min(trade.price);
        self.candle.close = trade.price;
        self.add_volume(trade);
    }

    fn add_volume(&mut self, trade: &Trade) {
        match trade.side {
            Side::Buy => self.candle.volume_buy += trade.size,
            Side::Sell => self.candle.volume_sell += trade.size,
        }
        self.candle.cvd = (self.candle.volume_buy - self.candle.volume_sell) + self.base_cvd;
    }
}

/// Per-timeframe candle series
#[derive(Debug)]
struct Series {
    timeframe: Timeframe,
    current: Option<CandleBuilder>,
    closed: Vec<Candle>,
    closed_total: u64,
    last_closed_cvd: f64,
    late_trades: u64,
}

impl Series {
    fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            current: None,
            closed: Vec::new(),
            closed_total: 0,
            last_closed_cvd: 0.0,
            late_trades: 0,
        }
    }
}

/// Aggregation health for one timeframe
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesHealth {
    pub timeframe: Timeframe,
    pub closed: u64,
    pub expected: u64,
    pub late_trades: u64,
}

impl SeriesHealth {
    pub fn is_behind(&self) -> bool {
        self.closed + 1 < self.expected
    }
}

/// Aggregates trades into candles for several independent timeframes
#[derive(Debug)]
pub struct CandleAggregator {
    series: Vec<Series>,
    /// Closed candles kept in memory per timeframe
    max_history: usize,
    first_trade_ts: Option<i64>,
    last_trade_ts: Option<i64>,
}

impl CandleAggregator {
    pub fn new(timeframes: &[Timeframe], max_history: usize) -> Self {
        let mut series: Vec<Series> = Vec::with_capacity(timeframes.len());
        for tf in timeframes {
            if !series.iter().any(|s| &s.timeframe == tf) {
                series.push(Series::new(tf.clone()));
            }
        }

        Self {
            series,
            max_history: max_history.max(3),
            first_trade_ts: None,
            last_trade_ts: None,
        }
    }

    /// Fold a trade into every timeframe. Returns the candles it closed, in
    /// configured timeframe order.
    pub fn process(&mut self, trade: &Trade) -> Vec<CandleClosed> {
        self.first_trade_ts.get_or_insert(trade.timestamp);
        self.last_trade_ts = Some(self.last_trade_ts.map_or(trade.timestamp, |ts| ts.max(trade.timestamp)));

        let mut closed_events = Vec::new();
        let max_history = self.max_history;

        for series in &mut self.series {
            let bucket = series.timeframe.bucket_start(trade.timestamp);

            match &mut series.current {
                Some(open) if open.candle.timestamp < bucket => {
                    let finished = open.candle.clone();
                    series.last_closed_cvd = finished.cvd;
                    series.closed_total += 1;
                    series.closed.push(finished.clone());
                    if series.closed.len() > max_history {
                        let excess = series.closed.len() - max_history;
                        series.closed.drain(..excess);
                    }

                    series.current = Some(CandleBuilder::new(bucket, trade, series.last_closed_cvd));
                    closed_events.push(CandleClosed {
                        timeframe: series.timeframe.clone(),
                        candle: finished,
                    });
                }
                Some(open) => {
                    if bucket < open.candle.timestamp {
                        series.late_trades += 1;
                        debug!(
                            "{} late trade @ {} folded into open candle {}",
                            series.timeframe, trade.timestamp, open.candle.timestamp
                        );
                    }
                    open.add_trade(trade);
                }
                None => {
                    series.current = Some(CandleBuilder::new(bucket, trade, series.last_closed_cvd));
                }
            }
        }

        closed_events
    }

    /// Configured timeframes, in order
    pub fn timeframes(&self) -> impl Iterator<Item = &Timeframe> {
        self.series.iter().map(|s| &s.timeframe)
    }

    /// Closed candles held in memory, oldest first
    pub fn closed(&self, timeframe: &Timeframe) -> &[Candle] {
        self.find(timeframe).map(|s| s.closed.as_slice()).unwrap_or(&[])
    }

    /// The open candle, if any trade has arrived for this timeframe
    pub fn current(&self, timeframe: &Timeframe) -> Option<&Candle> {
        self.find(timeframe).and_then(|s| s.current.as_ref()).map(|b| &b.candle)
    }

    /// Number of closed candles held in memory
    pub fn history_len(&self, timeframe: &Timeframe) -> usize {
        self.closed(timeframe).len()
    }

    /// Total candles closed since start, including ones evicted from memory
    pub fn closed_total(&self, timeframe: &Timeframe) -> u64 {
        self.find(timeframe).map(|s| s.closed_total).unwrap_or(0)
    }

    /// Closed candle counts against what elapsed stream time implies
    pub fn health(&self) -> Vec<SeriesHealth> {
        let elapsed = match (self.first_trade_ts, self.last_trade_ts) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        };

        self.series
            .iter()
            .map(|s| SeriesHealth {
                timeframe: s.timeframe.clone(),
                closed: s.closed_total,
                expected: s.timeframe.buckets_in(elapsed) as u64,
                late_trades: s.late_trades,
            })
            .collect()
    }

    fn find(&self, timeframe: &Timeframe) -> Option<&Series> {
        self.series.iter().find(|s| &s.timeframe == timeframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tf(label: &str) -> Timeframe {
        Timeframe::parse(label).unwrap()
    }

    fn trade(side: Side, price: f64, size: f64, ts: i64) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            side,
            price,
            size,
            timestamp: ts,
        }
    }

    #[test]
    fn test_first_trade_opens_candle() {
        let mut agg = CandleAggregator::new(&[tf("1m")], 100);
        let closed = agg.process(&trade(Side::Buy, 100.0, 2.0, 61_000));
        assert!(closed.is_empty());

        let current = agg.current(&tf("1m")).unwrap();
        assert_eq!(current.timestamp, 60_000);
        assert_eq!(current.open, 100.0);
        assert_eq!(current.volume_buy, 2.0);
        assert_eq!(current.cvd, 2.0);
    }

    #[test]
    fn test_ohlc_and_volume_within_bucket() {
        let mut agg = CandleAggregator::new(&[tf("1m")], 100);
        agg.process(&trade(Side::Buy, 100.0, 1.0, 0));
        agg.process(&trade(Side::Sell, 103.0, 4.0, 10_000));
        agg.process(&trade(Side::Buy, 98.0, 2.0, 20_000));
        agg.process(&trade(Side::Sell, 101.0, 1.0, 30_000));

        let c = agg.current(&tf("1m")).unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 103.0, 98.0, 101.0));
        assert_eq!(c.volume_buy, 3.0);
        assert_eq!(c.volume_sell, 5.0);
        assert_eq!(c.cvd, -2.0);
    }

    #[test]
    fn test_close_on_later_bucket_and_cvd_carry() {
        let mut agg = CandleAggregator::new(&[tf("1m")], 100);
        agg.process(&trade(Side::Buy, 100.0, 5.0, 0));
        let closed = agg.process(&trade(Side::Sell, 101.0, 2.0, 60_000));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].candle.timestamp, 0);
        assert_eq!(closed[0].candle.cvd, 5.0);

        // New candle seeded from the closed candle's cumulative delta
        let current = agg.current(&tf("1m")).unwrap();
        assert_eq!(current.timestamp, 60_000);
        assert_eq!(current.cvd, 3.0);
    }

    #[test]
    fn test_gap_closes_once() {
        let mut agg = CandleAggregator::new(&[tf("1m")], 100);
        agg.process(&trade(Side::Buy, 100.0, 1.0, 0));
        // Five empty minutes; only the one open candle closes
        let closed = agg.process(&trade(Side::Buy, 100.0, 1.0, 6 * 60_000));
        assert_eq!(closed.len(), 1);
        assert_eq!(agg.current(&tf("1m")).unwrap().timestamp, 360_000);
    }

    #[test]
    fn test_late_trade_folded_into_open_candle() {
        let mut agg = CandleAggregator::new(&[tf("1m")], 100);
        agg.process(&trade(Side::Buy, 100.0, 1.0, 0));
        agg.process(&trade(Side::Buy, 101.0, 1.0, 60_000));
        let closed = agg.process(&trade(Side::Sell, 90.0, 3.0, 30_000));

        assert!(closed.is_empty());
        assert_eq!(agg.closed(&tf("1m")).len(), 1);
        let current = agg.current(&tf("1m")).unwrap();
        assert_eq!(current.timestamp, 60_000);
        assert_eq!(current.low, 90.0);
        assert_eq!(current.volume_sell, 3.0);
        assert_eq!(agg.health()[0].late_trades, 1);
    }

    #[test]
    fn test_multiple_timeframes_independent() {
        let mut agg = CandleAggregator::new(&[tf("1m"), tf("3m")], 100);
        for minute in 0..7 {
            agg.process(&trade(Side::Buy, 100.0 + minute as f64, 1.0, minute * 60_000));
        }
        assert_eq!(agg.closed(&tf("1m")).len(), 6);
        assert_eq!(agg.closed(&tf("3m")).len(), 2);
        assert_eq!(agg.closed(&tf("3m"))[1].timestamp, 180_000);
        assert_eq!(agg.closed(&tf("3m"))[1].cvd, 6.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut agg = CandleAggregator::new(&[tf("1s")], 5);
        for s in 0..20 {
            agg.process(&trade(Side::Buy, 100.0, 1.0, s * 1_000));
        }
        assert_eq!(agg.history_len(&tf("1s")), 5);
        assert_eq!(agg.closed_total(&tf("1s")), 19);
        assert_eq!(agg.closed(&tf("1s"))[4].timestamp, 18_000);
    }

    #[test]
    fn test_duplicate_timeframes_collapse() {
        let agg = CandleAggregator::new(&[tf("1m"), tf("1m")], 10);
        assert_eq!(agg.timeframes().count(), 1);
    }

    fn arb_trades(max_gap: i64) -> impl Strategy<Value = Vec<Trade>> {
        prop::collection::vec(
            (any::<bool>(), 1u32..1_000, 0u32..50, 0..=max_gap),
            1..300,
        )
        .prop_map(|rows| {
            let mut ts = 1_700_000_000_000i64;
            rows.into_iter()
                .map(|(buy, price, size, gap)| {
                    ts += gap;
                    let side = if buy { Side::Buy } else { Side::Sell };
                    trade(side, price as f64, size as f64, ts)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_closed_count_tracks_duration(trades in arb_trades(30_000)) {
            let timeframe = tf("1m");
            let mut agg = CandleAggregator::new(&[timeframe.clone()], 10_000);
            let mut closes = Vec::new();
            for t in &trades {
                closes.extend(agg.process(t));
            }

            let duration = trades.last().unwrap().timestamp - trades[0].timestamp;
            let expected = duration / timeframe.interval_ms();
            prop_assert!((closes.len() as i64 - expected).abs() <= 1);

            for pair in closes.windows(2) {
                prop_assert!(pair[0].candle.timestamp < pair[1].candle.timestamp);
            }
        }

        #[test]
        fn prop_candles_respect_ohlc_bounds(trades in arb_trades(90_000)) {
            let mut agg = CandleAggregator::new(&[tf("1m"), tf("3m")], 10_000);
            for t in &trades {
                for closed in agg.process(t) {
                    let c = closed.candle;
                    prop_assert!(c.high >= c.open.max(c.close));
                    prop_assert!(c.low <= c.open.min(c.close));
                    prop_assert!(c.high >= c.low);
                }
            }
        }

        #[test]
        fn prop_cvd_recomputes_from_raw_trades(trades in arb_trades(45_000)) {
            let timeframe = tf("1m");
            let mut agg = CandleAggregator::new(&[timeframe.clone()], 10_000);
            for t in &trades {
                agg.process(t);
            }

            let mut prev_cvd = 0.0;
            for candle in agg.closed(&timeframe) {
                let mut buy = 0.0;
                let mut sell = 0.0;
                for t in trades.iter().filter(|t| timeframe.bucket_start(t.timestamp) == candle.timestamp) {
                    match t.side {
                        Side::Buy => buy += t.size,
                        Side::Sell => sell += t.size,
                    }
                }
                prop_assert_eq!(candle.volume_buy, buy);
                prop_assert_eq!(candle.volume_sell, sell);
                prop_assert_eq!(candle.cvd, (buy - sell) + prev_cvd);
                prev_cvd = candle.cvd;
            }
        }

        #[test]
        fn prop_unordered_stream_never_duplicates_buckets(
            mut trades in arb_trades(40_000),
            seed in any::<u64>(),
        ) {
            // Local shuffle: swap neighbours pseudo-randomly
            let mut s = seed;
            for i in 1..trades.len() {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                if s >> 63 == 1 {
                    trades.swap(i - 1, i);
                }
            }

            let mut agg = CandleAggregator::new(&[tf("1m")], 10_000);
            let mut closes = Vec::new();
            for t in &trades {
                closes.extend(agg.process(t));
            }
            for pair in closes.windows(2) {
                prop_assert!(pair[0].candle.timestamp < pair[1].candle.timestamp);
            }
        }
    }
}
