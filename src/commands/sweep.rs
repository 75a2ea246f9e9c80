use super::{load_inputs, write_json};
use crate::strategy::create_provider;
use crate::sweep::{expand_grid, load_grid, run_sweep, SweepRequest};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::info;
use std::collections::HashMap;
use std::path::Path;

pub struct SweepOptions<'a> {
    pub data_path: &'a Path,
    pub config_path: Option<&'a Path>,
    pub grid_path: &'a Path,
    pub provider: &'a str,
    pub instruments: &'a [String],
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initial_cash: f64,
    pub threads: Option<usize>,
    pub output_path: Option<&'a Path>,
}

pub fn run(options: &SweepOptions) -> Result<()> {
    let inputs = load_inputs(
        options.data_path,
        options.config_path,
        options.instruments,
        options.start,
        options.end,
    )?;
    let grid = load_grid(options.grid_path)?;
    let variations = expand_grid(&grid);
    let provider = create_provider(options.provider, HashMap::new())?;

    let request = SweepRequest {
        base_config: &inputs.config,
        instruments: &inputs.instruments,
        start: inputs.start,
        end: inputs.end,
        initial_cash: options.initial_cash,
        threads: options.threads,
    };
    let outcomes = run_sweep(&inputs.market_data, provider.as_ref(), &request, &variations)?;

    for outcome in outcomes.iter().filter(|o| o.error.is_none()).take(5) {
        info!(
            "{}: return {:.2}%, Sharpe {:.4}, max drawdown {:.2}%, {} trades",
            outcome.id,
            outcome.total_return_pct,
            outcome.sharpe_ratio,
            outcome.max_drawdown_pct,
            outcome.total_trades
        );
    }

    if let Some(path) = options.output_path {
        write_json(path, &outcomes)?;
        info!("Sweep results written to {}", path.display());
    }
    Ok(())
}
