use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use cvd_divergence_bot::config::{EngineConfig, TakeProfitPolicy};
use cvd_divergence_bot::execution::TradingSummary;
use cvd_divergence_bot::persistence::PersistenceStore;
use cvd_divergence_bot::streams::{read_json_lines, replay_csv, TradeRouter};
use cvd_divergence_bot::trading_core::Timeframe;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file; absent fields keep their defaults
    #[arg(short, long, env = "CVD_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (one subdirectory per symbol)
    #[arg(long, env = "CVD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Empty the data directory before ingesting
    #[arg(long)]
    clear_data: bool,

    /// Entry confirmation timeframe (e.g. 1m)
    #[arg(long, env = "CVD_PRIMARY_TIMEFRAME", value_parser = Timeframe::parse)]
    primary: Option<Timeframe>,

    /// Divergence timeframe (e.g. 3m)
    #[arg(long, env = "CVD_ANCHOR_TIMEFRAME", value_parser = Timeframe::parse)]
    anchor: Option<Timeframe>,

    /// Use the 1x ATR stop / 2x ATR target preset
    #[arg(long)]
    atr_target: bool,

    /// Check stop and target on every trade, not only on closed candles
    #[arg(long)]
    intrabar_exits: bool,

    /// Minimum scorer probability for an entry
    #[arg(long, env = "CVD_MIN_SCORE")]
    min_score: Option<f64>,

    #[command(subcommand)]
    source: Source,
}

#[derive(Subcommand, Debug)]
enum Source {
    /// Replay trades from a CSV file
    ReplayCsv {
        path: PathBuf,

        /// Symbol for files without a symbol column
        #[arg(short, long)]
        symbol: Option<String>,
    },
    /// Read JSON trade lines from stdin
    Stdin,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path).context("Failed to load config")?,
        None => EngineConfig::default(),
    };

    if args.atr_target {
        let preset = EngineConfig::atr_target();
        config.risk.sl_atr_multiplier = preset.risk.sl_atr_multiplier;
        config.risk.take_profit = preset.risk.take_profit;
    }
    if let Some(tf) = &args.primary {
        config.strategy.primary_timeframe = tf.clone();
    }
    if let Some(tf) = &args.anchor {
        config.strategy.anchor_timeframe = tf.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.persistence.data_dir = dir.clone();
    }
    if args.intrabar_exits {
        config.risk.intrabar_exits = true;
    }
    if args.min_score.is_some() {
        config.strategy.min_score_probability = args.min_score;
    }

    config.ensure_strategy_timeframes();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_summary(symbol: &str, summary: &TradingSummary) {
    println!("\n═══════════════════════════════════════════════════════════");
    println!("              {} RESULTS", symbol);
    println!("═══════════════════════════════════════════════════════════\n");

    println!("Total Trades:      {}", summary.total_trades);
    println!("Wins:              {} ({:.1}%)", summary.wins, summary.win_rate * 100.0);
    println!("Losses:            {}", summary.losses);
    println!();
    println!("Gross Profit:      {:.2}", summary.gross_profit);
    println!("Gross Loss:        {:.2}", summary.gross_loss);
    println!("Profit Factor:     {:.2}", summary.profit_factor);
    println!("Avg Win:           {:.2}", summary.avg_win);
    println!("Avg Loss:          {:.2}", summary.avg_loss);
    println!("Max Drawdown:      {:.2}%", summary.max_drawdown * 100.0);
    println!("Sharpe (per trade): {:.2}", summary.sharpe_ratio);
    println!();
    println!("Capital:           {:.2} -> {:.2}", summary.initial_capital, summary.final_capital);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cvd_divergence_bot=info")),
        )
        .init();

    let args = Args::parse();

    // Fatal before any trade source is opened
    let config = load_config(&args)?;
    let data_dir = config.persistence.data_dir.clone();

    info!("Starting CVD divergence bot");
    info!(
        "Timeframes: {} | primary {} | anchor {} | CVD {}",
        config.timeframes.iter().map(|t| t.label()).collect::<Vec<_>>().join(","),
        config.strategy.primary_timeframe,
        config.strategy.anchor_timeframe,
        config.strategy.cvd_mode
    );
    match config.risk.take_profit {
        TakeProfitPolicy::AtrMultiple(m) => info!("SL {}x ATR | TP {}x ATR", config.risk.sl_atr_multiplier, m),
        TakeProfitPolicy::RiskReward(r) => info!("SL {}x ATR | TP {}R", config.risk.sl_atr_multiplier, r),
    }
    info!("Data directory: {:?}", data_dir);

    if args.clear_data {
        let removed = PersistenceStore::from_config(&data_dir, &config.persistence)
            .clear()
            .context("Failed to clear data directory")?;
        info!("Cleared {} entries from {:?}", removed, data_dir);
    }

    let mut router = TradeRouter::new(Arc::new(config), data_dir);

    let ingest = async {
        match &args.source {
            Source::ReplayCsv { path, symbol } => replay_csv(path, symbol.as_deref(), &mut router).await,
            Source::Stdin => {
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                read_json_lines(stdin, &mut router).await
            }
        }
    };

    tokio::select! {
        result = ingest => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, flushing closed candles");
        }
    }

    let summaries = router.shutdown().await?;
    for (symbol, summary) in &summaries {
        info!("{} | {}", symbol, summary);
        print_summary(symbol, summary);
    }

    Ok(())
}
