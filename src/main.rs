use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use log::info;
use portfolio_engine::commands::{run, sweep};
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";
const DEFAULT_INITIAL_CASH: f64 = 100_000.0;

#[derive(Parser)]
#[command(name = "portfolio-engine")]
#[command(about = "Portfolio backtesting with layered risk controls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest one configuration and report its performance
    Run {
        /// Path to the market data snapshot file (.bin or .json)
        #[arg(long = "data", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Backtest configuration (JSON); defaults apply when omitted
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Signal provider name
        #[arg(long, default_value = "trend_momentum")]
        provider: String,
        /// Comma separated instrument ids (defaults to every instrument in the snapshot)
        #[arg(long, value_delimiter = ',')]
        instruments: Vec<String>,
        /// First simulated date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        start: Option<DateTime<Utc>>,
        /// Last simulated date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        end: Option<DateTime<Utc>>,
        /// Starting cash
        #[arg(long, default_value_t = DEFAULT_INITIAL_CASH)]
        cash: f64,
        /// Destination for the JSON result
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Run a parameter grid in parallel and rank the variations
    Sweep {
        /// Path to the market data snapshot file (.bin or .json)
        #[arg(long = "data", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Base configuration (JSON) the grid overrides
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Parameter grid: JSON object of parameter name to candidate values
        #[arg(long, value_name = "PATH")]
        grid: PathBuf,
        /// Signal provider name
        #[arg(long, default_value = "trend_momentum")]
        provider: String,
        /// Comma separated instrument ids (defaults to every instrument in the snapshot)
        #[arg(long, value_delimiter = ',')]
        instruments: Vec<String>,
        /// First simulated date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        start: Option<DateTime<Utc>>,
        /// Last simulated date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        end: Option<DateTime<Utc>>,
        /// Starting cash
        #[arg(long, default_value_t = DEFAULT_INITIAL_CASH)]
        cash: f64,
        /// Worker threads (defaults to the number of CPUs)
        #[arg(long)]
        threads: Option<usize>,
        /// Destination for the ranked JSON outcomes
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting portfolio engine. Simulated results only; past performance does not predict future returns.");

    match cli.command {
        Commands::Run {
            data_file,
            config,
            provider,
            instruments,
            start,
            end,
            cash,
            output,
        } => {
            let data_path = resolve_market_data_path(data_file);
            run::run(&run::RunOptions {
                data_path: &data_path,
                config_path: config.as_deref(),
                provider: &provider,
                instruments: &instruments,
                start,
                end,
                initial_cash: cash,
                output_path: output.as_deref(),
            })?;
        }
        Commands::Sweep {
            data_file,
            config,
            grid,
            provider,
            instruments,
            start,
            end,
            cash,
            threads,
            output,
        } => {
            let data_path = resolve_market_data_path(data_file);
            sweep::run(&sweep::SweepOptions {
                data_path: &data_path,
                config_path: config.as_deref(),
                grid_path: &grid,
                provider: &provider,
                instruments: &instruments,
                start,
                end,
                initial_cash: cash,
                threads,
                output_path: output.as_deref(),
            })?;
        }
    }

    Ok(())
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|err| format!("invalid date '{}': {}", value, err))?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid date '{}'", value))
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    cli_value.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE))
}
