//! Indicators over closed-candle sequences
//!
//! Pure functions. Callers pass the closed candles of one timeframe, oldest
//! first; nothing here keeps state except `FvgTracker`, which only remembers
//! which gaps are still open.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::candles::Candle;
use super::state_machine::Direction;
use crate::config::CvdMode;

/// `max(high - low, |high - prev_close|, |low - prev_close|)`
pub fn true_range(candle: &Candle, prev: Option<&Candle>) -> f64 {
    let high_low = candle.high - candle.low;
    match prev {
        Some(p) => high_low
            .max((candle.high - p.close).abs())
            .max((candle.low - p.close).abs()),
        None => high_low,
    }
}

/// Mean true range over the trailing `period` candles.
///
/// Returns 0 while fewer than `period` candles exist.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period {
        return 0.0;
    }

    let start = candles.len() - period;
    let sum: f64 = (start..candles.len())
        .map(|i| {
            let prev = if i > 0 { candles.get(i - 1) } else { None };
            true_range(&candles[i], prev)
        })
        .sum();

    sum / period as f64
}

/// CVD sign flip on the anchor timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CvdSignal {
    Bull,
    Bear,
}

impl CvdSignal {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Bull => Direction::Long,
            Self::Bear => Direction::Short,
        }
    }
}

impl std::fmt::Display for CvdSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "Bull"),
            Self::Bear => write!(f, "Bear"),
        }
    }
}

/// Compare the cumulative CVD of the last two closed anchor candles.
///
/// Bear: `prev >= 0 && cur < 0`. Bull: `prev <= 0 && cur > 0`. Advanced mode
/// also wants the body against the new sign (bearish flip on a green candle,
/// bullish flip on a red one).
pub fn detect_cvd_divergence(anchor: &[Candle], mode: CvdMode) -> Option<CvdSignal> {
    let [.., prev, cur] = anchor else {
        return None;
    };

    if prev.cvd >= 0.0 && cur.cvd < 0.0 {
        if mode == CvdMode::Raw || cur.is_bullish() {
            return Some(CvdSignal::Bear);
        }
    } else if prev.cvd <= 0.0 && cur.cvd > 0.0 && (mode == CvdMode::Raw || cur.is_bearish()) {
        return Some(CvdSignal::Bull);
    }

    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FvgKind {
    Bullish,
    Bearish,
}

impl FvgKind {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Bullish => Direction::Long,
            Self::Bearish => Direction::Short,
        }
    }
}

/// Fair value gap between candles `[-3]` and `[-1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fvg {
    #[serde(rename = "type")]
    pub kind: FvgKind,
    pub top: f64,
    pub bottom: f64,
    /// Bucket start of the candle that completed the gap
    pub start_time: i64,
    /// Set once price trades back through the gap
    pub end_time: Option<i64>,
}

impl Fvg {
    pub fn size(&self) -> f64 {
        self.top - self.bottom
    }

    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Bullish gaps fill on a low under the bottom, bearish on a high over the top
    pub fn is_filled_by(&self, candle: &Candle) -> bool {
        match self.kind {
            FvgKind::Bullish => candle.low < self.bottom,
            FvgKind::Bearish => candle.high > self.top,
        }
    }
}

/// Three-candle gap on the primary timeframe, accepted when
/// `gap * sensitivity > ATR(atr_period)`. Bullish is checked first.
pub fn detect_fvg(primary: &[Candle], sensitivity: f64, atr_period: usize) -> Option<Fvg> {
    let [.., first, middle, last] = primary else {
        return None;
    };
    let volatility = atr(primary, atr_period);

    if last.low > first.high && middle.close > first.high {
        let gap = last.low - first.high;
        if gap * sensitivity > volatility {
            return Some(Fvg {
                kind: FvgKind::Bullish,
                top: last.low,
                bottom: first.high,
                start_time: last.timestamp,
                end_time: None,
            });
        }
    }

    if last.high < first.low && middle.close < first.low {
        let gap = first.low - last.high;
        if gap * sensitivity > volatility {
            return Some(Fvg {
                kind: FvgKind::Bearish,
                top: first.low,
                bottom: last.high,
                start_time: last.timestamp,
                end_time: None,
            });
        }
    }

    None
}

/// Open gaps, closed as price revisits them. At most `capacity` stay open;
/// recording past that forgets the oldest.
#[derive(Debug)]
pub struct FvgTracker {
    active: VecDeque<Fvg>,
    capacity: usize,
    recorded: u64,
}

impl FvgTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: VecDeque::new(),
            capacity: capacity.max(1),
            recorded: 0,
        }
    }

    /// Track a new gap. Returns the oldest open gap if it had to make room.
    pub fn record(&mut self, fvg: Fvg) -> Option<Fvg> {
        self.recorded += 1;
        self.active.push_back(fvg);
        if self.active.len() > self.capacity {
            self.active.pop_front()
        } else {
            None
        }
    }

    /// Close every gap the candle trades through. Returns the closed gaps
    /// with `end_time` set to the candle's bucket.
    pub fn invalidate(&mut self, candle: &Candle) -> Vec<Fvg> {
        let mut filled = Vec::new();
        self.active.retain_mut(|fvg| {
            if fvg.start_time < candle.timestamp && fvg.is_filled_by(candle) {
                fvg.end_time = Some(candle.timestamp);
                filled.push(fvg.clone());
                false
            } else {
                true
            }
        });
        filled
    }

    pub fn active(&self) -> &VecDeque<Fvg> {
        &self.active
    }

    /// Gaps recorded since start, open or not
    pub fn recorded(&self) -> u64 {
        self.recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64, open: f64, high: f64, low: f64, close: f64, cvd: f64) -> Candle {
        Candle {
            timestamp: ts,
            open,
            high,
            low,
            close,
            volume_buy: 0.0,
            volume_sell: 0.0,
            cvd,
        }
    }

    fn flat(ts: i64, price: f64, range: f64) -> Candle {
        candle(ts, price, price + range / 2.0, price - range / 2.0, price, 0.0)
    }

    #[test]
    fn test_true_range_uses_prev_close() {
        let prev = flat(0, 100.0, 2.0);
        let gap_up = candle(60_000, 105.0, 106.0, 104.0, 105.5, 0.0);
        assert_eq!(true_range(&gap_up, None), 2.0);
        assert_eq!(true_range(&gap_up, Some(&prev)), 6.0);
    }

    #[test]
    fn test_atr_cold_start_is_zero() {
        let candles: Vec<Candle> = (0..3).map(|i| flat(i * 60_000, 100.0, 2.0)).collect();
        assert_eq!(atr(&candles, 7), 0.0);
        assert_eq!(atr(&candles, 0), 0.0);
        assert_eq!(atr(&[], 1), 0.0);
    }

    #[test]
    fn test_atr_trailing_window() {
        let mut candles: Vec<Candle> = (0..5).map(|i| flat(i * 60_000, 100.0, 10.0)).collect();
        candles.extend((5..8).map(|i| flat(i * 60_000, 100.0, 2.0)));
        assert_eq!(atr(&candles, 3), 2.0);
        assert_eq!(atr(&candles, 4), 4.0);
    }

    #[test]
    fn test_cvd_divergence_raw() {
        let up = candle(0, 100.0, 101.0, 99.0, 100.5, 5.0);
        let down = candle(180_000, 100.0, 101.0, 99.0, 99.5, -3.0);
        assert_eq!(detect_cvd_divergence(&[up.clone(), down.clone()], CvdMode::Raw), Some(CvdSignal::Bear));
        assert_eq!(detect_cvd_divergence(&[down.clone(), up.clone()], CvdMode::Raw), Some(CvdSignal::Bull));

        let zero = candle(0, 100.0, 101.0, 99.0, 100.0, 0.0);
        assert_eq!(detect_cvd_divergence(&[zero.clone(), down], CvdMode::Raw), Some(CvdSignal::Bear));
        assert_eq!(detect_cvd_divergence(&[zero, up.clone()], CvdMode::Raw), Some(CvdSignal::Bull));

        assert_eq!(detect_cvd_divergence(&[up.clone(), up.clone()], CvdMode::Raw), None);
        assert_eq!(detect_cvd_divergence(&[up], CvdMode::Raw), None);
    }

    #[test]
    fn test_cvd_divergence_advanced_needs_opposing_body() {
        let prev = candle(0, 100.0, 101.0, 99.0, 100.0, 5.0);
        let red_flip = candle(180_000, 100.0, 101.0, 99.0, 99.5, -3.0);
        let green_flip = candle(180_000, 100.0, 101.0, 99.0, 100.5, -3.0);

        assert_eq!(detect_cvd_divergence(&[prev.clone(), red_flip], CvdMode::Advanced), None);
        assert_eq!(
            detect_cvd_divergence(&[prev, green_flip], CvdMode::Advanced),
            Some(CvdSignal::Bear)
        );

        let neg = candle(0, 100.0, 101.0, 99.0, 100.0, -2.0);
        let red_up = candle(180_000, 100.0, 101.0, 99.0, 99.0, 4.0);
        assert_eq!(detect_cvd_divergence(&[neg, red_up], CvdMode::Advanced), Some(CvdSignal::Bull));
    }

    #[test]
    fn test_detect_bullish_fvg() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5, 0.0),
            candle(60_000, 101.0, 106.0, 100.5, 105.0, 0.0),
            candle(120_000, 107.0, 108.0, 106.5, 107.5, 0.0),
        ];
        let fvg = detect_fvg(&candles, 1.5, 2).unwrap();
        assert_eq!(fvg.kind, FvgKind::Bullish);
        assert_eq!((fvg.top, fvg.bottom), (106.5, 101.0));
        assert_eq!(fvg.start_time, 120_000);
        assert!(fvg.is_active());
    }

    #[test]
    fn test_detect_bearish_fvg() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 99.5, 0.0),
            candle(60_000, 99.0, 99.5, 94.0, 95.0, 0.0),
            candle(120_000, 95.0, 96.0, 93.0, 93.5, 0.0),
        ];
        let fvg = detect_fvg(&candles, 1.5, 2).unwrap();
        assert_eq!(fvg.kind, FvgKind::Bearish);
        assert_eq!((fvg.top, fvg.bottom), (99.0, 96.0));
    }

    #[test]
    fn test_small_gap_filtered_by_atr() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5, 0.0),
            candle(60_000, 101.0, 111.0, 100.5, 110.0, 0.0),
            candle(120_000, 110.0, 112.0, 101.2, 111.0, 0.0),
        ];
        // Gap 0.2 * 1.5 is nowhere near the ~10 point ATR
        assert!(detect_fvg(&candles, 1.5, 2).is_none());
        // Under cold start ATR is 0, so any real gap passes
        assert!(detect_fvg(&candles, 1.5, 7).is_some());
    }

    #[test]
    fn test_middle_close_must_clear_gap() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5, 0.0),
            candle(60_000, 101.0, 106.0, 100.5, 100.8, 0.0),
            candle(120_000, 105.0, 108.0, 104.0, 107.0, 0.0),
        ];
        assert!(detect_fvg(&candles, 1.5, 7).is_none());
        assert!(detect_fvg(&candles[..2], 1.5, 7).is_none());
    }

    #[test]
    fn test_tracker_invalidates_on_fill() {
        let mut tracker = FvgTracker::new(10);
        tracker.record(Fvg {
            kind: FvgKind::Bullish,
            top: 104.0,
            bottom: 101.0,
            start_time: 120_000,
            end_time: None,
        });
        tracker.record(Fvg {
            kind: FvgKind::Bearish,
            top: 120.0,
            bottom: 115.0,
            start_time: 120_000,
            end_time: None,
        });

        // Dips into but not through the bullish gap
        assert!(tracker.invalidate(&candle(180_000, 104.0, 105.0, 101.5, 104.5, 0.0)).is_empty());
        assert_eq!(tracker.active().len(), 2);

        let filled = tracker.invalidate(&candle(240_000, 101.5, 102.0, 100.0, 100.5, 0.0));
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].kind, FvgKind::Bullish);
        assert_eq!(filled[0].end_time, Some(240_000));
        assert_eq!(tracker.active().len(), 1);
        assert_eq!(tracker.recorded(), 2);
    }

    #[test]
    fn test_tracker_forgets_oldest_past_capacity() {
        let mut tracker = FvgTracker::new(3);
        let gap = |ts: i64| Fvg {
            kind: FvgKind::Bullish,
            top: 104.0,
            bottom: 101.0,
            start_time: ts,
            end_time: None,
        };
        for i in 0..3 {
            assert!(tracker.record(gap(i * 60_000)).is_none());
        }
        let evicted = tracker.record(gap(180_000)).unwrap();
        assert_eq!(evicted.start_time, 0);

        for i in 4..1_000 {
            tracker.record(gap(i * 60_000));
        }
        assert_eq!(tracker.active().len(), 3);
        assert_eq!(tracker.active()[0].start_time, 997 * 60_000);
        assert_eq!(tracker.recorded(), 1_000);
    }

    #[test]
    fn test_fvg_serializes_chart_layout() {
        let fvg = Fvg {
            kind: FvgKind::Bearish,
            top: 99.0,
            bottom: 96.0,
            start_time: 120_000,
            end_time: None,
        };
        let json = serde_json::to_value(&fvg).unwrap();
        assert_eq!(json["type"], "Bearish");
        assert_eq!(json["startTime"], 120_000);
        assert!(json["endTime"].is_null());
    }
}
