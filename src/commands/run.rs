use super::{load_inputs, write_json};
use crate::engine::Engine;
use crate::strategy::create_provider;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::info;
use std::collections::HashMap;
use std::path::Path;

pub struct RunOptions<'a> {
    pub data_path: &'a Path,
    pub config_path: Option<&'a Path>,
    pub provider: &'a str,
    pub instruments: &'a [String],
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initial_cash: f64,
    pub output_path: Option<&'a Path>,
}

pub fn run(options: &RunOptions) -> Result<()> {
    let inputs = load_inputs(
        options.data_path,
        options.config_path,
        options.instruments,
        options.start,
        options.end,
    )?;
    let provider = create_provider(options.provider, HashMap::new())?;
    let engine = Engine::new(inputs.config);

    let result = engine.run(
        &inputs.market_data,
        provider.as_ref(),
        &inputs.instruments,
        inputs.start,
        inputs.end,
        options.initial_cash,
    )?;

    let performance = &result.performance;
    info!(
        "Total return {:.2}% (annual {:.2}%), Sharpe {:.3}, Sortino {:.3}, max drawdown {:.2}%, win rate {:.1}% over {} trades",
        performance.total_return_pct,
        performance.annual_return_pct,
        performance.sharpe_ratio,
        performance.sortino_ratio,
        performance.max_drawdown_pct,
        performance.win_rate * 100.0,
        performance.total_trades
    );
    for (instrument, stats) in &result.per_instrument_stats {
        info!(
            "  {}: {} trades, win rate {:.1}%, pnl {:.2}",
            instrument,
            stats.trades,
            stats.win_rate * 100.0,
            stats.total_pnl
        );
    }

    if let Some(path) = options.output_path {
        write_json(path, &result)?;
        info!("Backtest result written to {}", path.display());
    }
    Ok(())
}
