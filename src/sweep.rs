use crate::config::BacktestConfig;
use crate::data_context::PriceSeriesStore;
use crate::engine::Engine;
use crate::strategy::SignalProvider;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepVariation {
    pub id: String,
    pub parameters: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutcome {
    pub id: String,
    pub parameters: HashMap<String, f64>,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: usize,
    pub error: Option<String>,
}

/// Parameter name to candidate values, as read from a grid file.
pub type ParameterGrid = BTreeMap<String, Vec<f64>>;

pub fn load_grid(path: &Path) -> Result<ParameterGrid> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameter grid {}", path.display()))?;
    let grid: ParameterGrid = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse parameter grid {}", path.display()))?;
    if let Some((name, _)) = grid.iter().find(|(_, values)| values.is_empty()) {
        return Err(anyhow!("Parameter {} has no values in the grid", name));
    }
    Ok(grid)
}

/// Cartesian product of the grid, in a stable order.
pub fn expand_grid(grid: &ParameterGrid) -> Vec<SweepVariation> {
    let mut combinations: Vec<HashMap<String, f64>> = vec![HashMap::new()];
    for (name, values) in grid {
        combinations = combinations
            .into_iter()
            .flat_map(|base| {
                values.iter().map(move |value| {
                    let mut next = base.clone();
                    next.insert(name.clone(), *value);
                    next
                })
            })
            .collect();
    }
    combinations
        .into_iter()
        .enumerate()
        .map(|(i, parameters)| SweepVariation {
            id: format!("variation_{}", i),
            parameters,
        })
        .collect()
}

pub struct SweepRequest<'a> {
    pub base_config: &'a BacktestConfig,
    pub instruments: &'a [String],
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_cash: f64,
    pub threads: Option<usize>,
}

/// Runs every variation on its own engine and ledger. Best Sharpe first.
pub fn run_sweep(
    store: &(dyn PriceSeriesStore + Sync),
    provider: &(dyn SignalProvider + Sync),
    request: &SweepRequest,
    variations: &[SweepVariation],
) -> Result<Vec<SweepOutcome>> {
    if variations.is_empty() {
        return Ok(Vec::new());
    }

    let num_workers = request
        .threads
        .unwrap_or_else(num_cpus::get)
        .clamp(1, variations.len());
    info!(
        "Running {} backtest variations on {} worker threads",
        variations.len(),
        num_workers
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .build()
        .context("Failed to build sweep thread pool")?;

    let pb = ProgressBar::new(variations.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );

    let mut outcomes: Vec<SweepOutcome> = pool.install(|| {
        variations
            .par_iter()
            .map(|variation| {
                let outcome = run_variation(store, provider, request, variation);
                pb.inc(1);
                outcome
            })
            .collect()
    });

    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
    if failed > 0 {
        warn!("Sweep completed with {} failed variations", failed);
        pb.finish_with_message("Sweep completed with errors");
    } else {
        pb.finish_with_message("Sweep completed");
    }

    outcomes.sort_by(|a, b| {
        a.error
            .is_some()
            .cmp(&b.error.is_some())
            .then_with(|| {
                b.sharpe_ratio
                    .partial_cmp(&a.sharpe_ratio)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(outcomes)
}

fn run_variation(
    store: &dyn PriceSeriesStore,
    provider: &dyn SignalProvider,
    request: &SweepRequest,
    variation: &SweepVariation,
) -> SweepOutcome {
    let start_time = Instant::now();
    let engine = Engine::from_parameters(request.base_config, &variation.parameters);
    let result = engine.run(
        store,
        provider,
        request.instruments,
        request.start,
        request.end,
        request.initial_cash,
    );

    match result {
        Ok(result) => {
            info!(
                "Variation {} finished in {:.1}s. Return: {:.2}%, Max DD: {:.2}%, Sharpe: {:.4}, Params: [{}]",
                variation.id,
                start_time.elapsed().as_secs_f64(),
                result.performance.total_return_pct,
                result.performance.max_drawdown_pct,
                result.performance.sharpe_ratio,
                format_parameters(&variation.parameters)
            );
            SweepOutcome {
                id: variation.id.clone(),
                parameters: variation.parameters.clone(),
                final_equity: result.final_equity,
                total_return_pct: result.performance.total_return_pct,
                sharpe_ratio: result.performance.sharpe_ratio,
                max_drawdown_pct: result.performance.max_drawdown_pct,
                total_trades: result.performance.total_trades,
                error: None,
            }
        }
        Err(err) => {
            warn!("Variation {} failed: {:#}", variation.id, err);
            SweepOutcome {
                id: variation.id.clone(),
                parameters: variation.parameters.clone(),
                final_equity: 0.0,
                total_return_pct: 0.0,
                sharpe_ratio: 0.0,
                max_drawdown_pct: 0.0,
                total_trades: 0,
                error: Some(format!("{:#}", err)),
            }
        }
    }
}

fn format_parameters(parameters: &HashMap<String, f64>) -> String {
    let mut entries: Vec<(&String, &f64)> = parameters.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(k, v)| {
            let formatted = format!("{:.4}", v);
            let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
            let cleaned = if trimmed.is_empty() || trimmed == "-0" {
                "0"
            } else {
                trimmed
            };
            format!("{}: {}", k, cleaned)
        })
        .collect::<Vec<String>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_expands_to_cartesian_product() {
        let mut grid = ParameterGrid::new();
        grid.insert("stopLossRatio".to_string(), vec![-0.05, -0.08]);
        grid.insert("takeProfitRatio".to_string(), vec![0.2, 0.3, 0.4]);
        let variations = expand_grid(&grid);
        assert_eq!(variations.len(), 6);
        assert_eq!(variations[0].parameters["stopLossRatio"], -0.05);
        assert_eq!(variations[0].parameters["takeProfitRatio"], 0.2);
        assert_eq!(variations[5].parameters["stopLossRatio"], -0.08);
        assert_eq!(variations[5].parameters["takeProfitRatio"], 0.4);
        assert_eq!(variations[5].id, "variation_5");
    }

    #[test]
    fn empty_grid_is_a_single_default_variation() {
        let variations = expand_grid(&ParameterGrid::new());
        assert_eq!(variations.len(), 1);
        assert!(variations[0].parameters.is_empty());
    }

    #[test]
    fn parameters_format_without_trailing_zeros() {
        let mut parameters = HashMap::new();
        parameters.insert("b".to_string(), 0.25);
        parameters.insert("a".to_string(), 3.0);
        assert_eq!(format_parameters(&parameters), "a: 3, b: 0.25");
    }
}
