//! Per-symbol tasks
//!
//! Every symbol gets its own `SymbolTrader`, data directory and persistence
//! worker. Symbols share nothing but the immutable config.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::execution::TradingSummary;
use crate::persistence::{PersistenceStore, PersistenceWorker};
use crate::trading_core::{SymbolTrader, TraderControl};
use crate::types::TradeEvent;

const CONTROL_CAPACITY: usize = 64;

/// Drive one symbol until its trade feed ends or it is told to stop. Control
/// messages take priority over queued trades.
pub async fn run_symbol(
    mut trader: SymbolTrader,
    mut trades: mpsc::Receiver<TradeEvent>,
    mut control: mpsc::Receiver<TraderControl>,
) -> Result<TradingSummary> {
    info!("{} trading started | state {}", trader.symbol(), trader.state());

    loop {
        tokio::select! {
            biased;
            Some(msg) = control.recv() => {
                if !trader.apply_control(msg) {
                    info!("{} shutdown requested", trader.symbol());
                    break;
                }
            }
            next = trades.recv() => match next {
                Some(event) => {
                    trader.process_trade(event);
                }
                None => break,
            },
        }
    }

    info!(
        "{} processed {} trades ({} dropped)",
        trader.symbol(),
        trader.trades_processed(),
        trader.malformed_dropped()
    );
    trader.shutdown().await
}

struct SymbolTask {
    trades: mpsc::Sender<TradeEvent>,
    control: mpsc::Sender<TraderControl>,
    task: JoinHandle<Result<TradingSummary>>,
}

/// Fans trades out to per-symbol tasks, spawning them on first sight
pub struct TradeRouter {
    config: Arc<EngineConfig>,
    data_dir: PathBuf,
    tasks: HashMap<String, SymbolTask>,
}

impl TradeRouter {
    pub fn new(config: Arc<EngineConfig>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            data_dir: data_dir.into(),
            tasks: HashMap::new(),
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Directory holding one symbol's files
    pub fn symbol_dir(&self, symbol: &str) -> PathBuf {
        symbol_dir(&self.data_dir, symbol)
    }

    /// Hand a trade to its symbol. Waits only when that symbol's queue is full.
    pub async fn route(&mut self, event: TradeEvent) -> Result<()> {
        let symbol = event.symbol.trim().to_string();
        if symbol.is_empty() {
            warn!("dropping trade without symbol");
            return Ok(());
        }

        if !self.tasks.contains_key(&symbol) {
            let task = self.spawn_symbol(&symbol)?;
            self.tasks.insert(symbol.clone(), task);
        }

        let Some(task) = self.tasks.get(&symbol) else {
            return Ok(());
        };
        if task.trades.send(event).await.is_err() {
            // The task already stopped (shutdown control or failure)
            warn!("{} is no longer running, trade dropped", symbol);
        }
        Ok(())
    }

    /// Send a control message to one symbol, or to all when `symbol` is None
    pub async fn control(&self, symbol: Option<&str>, msg: TraderControl) {
        for (name, task) in &self.tasks {
            if symbol.is_some_and(|s| s != name.as_str()) {
                continue;
            }
            if task.control.send(msg.clone()).await.is_err() {
                warn!("{} is no longer running, control {:?} dropped", name, msg);
            }
        }
    }

    /// Close every feed and wait for the symbols to flush
    pub async fn shutdown(self) -> Result<Vec<(String, TradingSummary)>> {
        let mut names = Vec::with_capacity(self.tasks.len());
        let mut handles = Vec::with_capacity(self.tasks.len());
        for (name, task) in self.tasks {
            // Dropping the senders ends the symbol loop
            drop(task.trades);
            drop(task.control);
            names.push(name);
            handles.push(task.task);
        }

        let mut summaries = Vec::new();
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(summary)) => summaries.push((name, summary)),
                Ok(Err(e)) => error!("{} shutdown failed: {:#}", name, e),
                Err(e) => error!("{} task panicked: {}", name, e),
            }
        }
        summaries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(summaries)
    }

    fn spawn_symbol(&self, symbol: &str) -> Result<SymbolTask> {
        let dir = self.symbol_dir(symbol);
        let store = PersistenceStore::from_config(&dir, &self.config.persistence);
        store
            .ensure_layout()
            .with_context(|| format!("Failed to prepare data directory {:?}", dir))?;

        let handle = PersistenceWorker::spawn(store, &self.config.persistence);
        let trader = SymbolTrader::new(symbol, self.config.clone()).with_persistence(handle);

        let (trade_tx, trade_rx) = mpsc::channel(self.config.persistence.channel_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let task = tokio::spawn(run_symbol(trader, trade_rx, control_rx));

        info!("{} routed to {:?}", symbol, dir);
        Ok(SymbolTask {
            trades: trade_tx,
            control: control_tx,
            task,
        })
    }
}

/// Symbols like `BTC/USDT` become `BTC_USDT`
fn symbol_dir(root: &Path, symbol: &str) -> PathBuf {
    let safe: String = symbol
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    root.join(safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::Candle;
    use crate::types::Side;

    fn trade(symbol: &str, price: f64, ts: i64) -> TradeEvent {
        TradeEvent::new(symbol, Side::Buy, price, 1.0, ts)
    }

    #[test]
    fn test_symbol_dir_sanitized() {
        let root = Path::new("data");
        assert_eq!(symbol_dir(root, "BTC/USDT"), root.join("BTC_USDT"));
        assert_eq!(symbol_dir(root, "ES.c.0"), root.join("ES.c.0"));
    }

    #[tokio::test]
    async fn test_run_symbol_stops_on_shutdown_control() {
        let trader = SymbolTrader::new("BTCUSDT", Arc::new(EngineConfig::default()));
        let (trade_tx, trade_rx) = mpsc::channel(8);
        let (control_tx, control_rx) = mpsc::channel(8);

        control_tx.send(TraderControl::Shutdown).await.unwrap();
        let summary = run_symbol(trader, trade_rx, control_rx).await.unwrap();
        assert_eq!(summary.total_trades, 0);
        // The loop stopped with the feed still open
        assert!(trade_tx.is_closed());
    }

    #[tokio::test]
    async fn test_router_keeps_symbols_apart() {
        let dir = tempfile::tempdir().unwrap();
        let mut router = TradeRouter::new(Arc::new(EngineConfig::default()), dir.path());

        for minute in 0..3 {
            router.route(trade("BTCUSDT", 100.0, minute * 60_000)).await.unwrap();
            router.route(trade("ETHUSDT", 10.0, minute * 60_000)).await.unwrap();
        }
        router.route(trade("", 1.0, 0)).await.unwrap();

        let mut symbols: Vec<&str> = router.symbols().collect();
        symbols.sort();
        assert_eq!(symbols, ["BTCUSDT", "ETHUSDT"]);

        router.control(Some("BTCUSDT"), TraderControl::ResetBreaker).await;
        let btc_dir = router.symbol_dir("BTCUSDT");
        let eth_dir = router.symbol_dir("ETHUSDT");
        let summaries = router.shutdown().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].0, "BTCUSDT");

        let btc: Vec<Candle> = PersistenceStore::from_config(&btc_dir, &EngineConfig::default().persistence)
            .read_history("candles_1m")
            .unwrap();
        let eth: Vec<Candle> = PersistenceStore::from_config(&eth_dir, &EngineConfig::default().persistence)
            .read_history("candles_1m")
            .unwrap();
        assert_eq!(btc.len(), 2);
        assert!(btc.iter().all(|c| c.close == 100.0));
        assert!(eth.iter().all(|c| c.close == 10.0));
        assert!(btc_dir.join("signals.log").exists());
    }
}
