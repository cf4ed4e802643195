//! Trade sources
//!
//! CSV replay for backtests and newline-delimited JSON for live feeds piped
//! in from an exchange adapter. Both normalise into `TradeEvent` and hand it
//! to the router; validation happens per symbol.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use super::router::TradeRouter;
use crate::trading_core::{DirectionalScore, TraderControl};
use crate::types::TradeEvent;

/// Counters for one ingestion run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub trades: u64,
    pub controls: u64,
    pub skipped: u64,
}

/// Out-of-band line in a JSON feed
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlLine {
    ResetBreaker {
        #[serde(default)]
        symbol: Option<String>,
    },
    Score {
        #[serde(default)]
        symbol: Option<String>,
        score: DirectionalScore,
    },
}

/// One line of a JSON feed: a trade, or a control message
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FeedLine {
    Trade(TradeEvent),
    Control(ControlLine),
}

pub fn parse_feed_line(line: &str) -> Result<FeedLine, serde_json::Error> {
    serde_json::from_str(line)
}

/// Replay a CSV with `symbol,side,price,size,timestamp` columns. The symbol
/// column may be omitted when `default_symbol` is given.
pub async fn replay_csv(path: &Path, default_symbol: Option<&str>, router: &mut TradeRouter) -> Result<IngestStats> {
    info!("Replaying trades from {:?}", path);
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV: {:?}", path))?;

    let mut stats = IngestStats::default();
    for (row, result) in reader.deserialize::<TradeEvent>().enumerate() {
        let mut event = match result {
            Ok(event) => event,
            Err(e) => {
                // Header is line 1
                warn!("skipping CSV line {}: {}", row + 2, e);
                stats.skipped += 1;
                continue;
            }
        };
        if event.symbol.is_empty() {
            if let Some(symbol) = default_symbol {
                event.symbol = symbol.to_string();
            }
        }
        router.route(event).await?;
        stats.trades += 1;
    }

    info!(
        "Replay finished: {} trades routed, {} rows skipped",
        stats.trades, stats.skipped
    );
    Ok(stats)
}

/// Read newline-delimited JSON until EOF
pub async fn read_json_lines<R>(reader: R, router: &mut TradeRouter) -> Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = IngestStats::default();

    while let Some(line) = lines.next_line().await.context("Failed to read trade feed")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_feed_line(line) {
            Ok(FeedLine::Trade(event)) => {
                router.route(event).await?;
                stats.trades += 1;
            }
            Ok(FeedLine::Control(control)) => {
                debug!("control: {:?}", control);
                let (symbol, msg) = match control {
                    ControlLine::ResetBreaker { symbol } => (symbol, TraderControl::ResetBreaker),
                    ControlLine::Score { symbol, score } => (symbol, TraderControl::Score(score)),
                };
                router.control(symbol.as_deref(), msg).await;
                stats.controls += 1;
            }
            Err(e) => {
                warn!("skipping feed line: {} ({})", e, line);
                stats.skipped += 1;
            }
        }
    }

    info!(
        "Feed closed: {} trades, {} control messages, {} lines skipped",
        stats.trades, stats.controls, stats.skipped
    );
    Ok(stats)
}
