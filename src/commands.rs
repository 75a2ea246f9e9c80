use crate::config::BacktestConfig;
use crate::data_context::MarketData;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub mod run;
pub mod sweep;

/// Market data, configuration and the resolved instrument universe and window.
pub struct RunInputs {
    pub market_data: MarketData,
    pub config: BacktestConfig,
    pub instruments: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn load_inputs(
    data_path: &Path,
    config_path: Option<&Path>,
    instruments: &[String],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<RunInputs> {
    let market_data = MarketData::load_from_file(data_path)?;
    let config = match config_path {
        Some(path) => BacktestConfig::load(path)?,
        None => {
            info!("No config file given; using default settings");
            BacktestConfig::default()
        }
    };

    let instruments = if instruments.is_empty() {
        market_data.instruments().to_vec()
    } else {
        instruments
            .iter()
            .map(|id| id.trim().to_uppercase())
            .filter(|id| !id.is_empty())
            .collect()
    };
    if let Some(missing) = instruments
        .iter()
        .find(|id| market_data.bars(id).is_empty())
    {
        return Err(anyhow!("Instrument {} has no bars in {}", missing, data_path.display()));
    }

    let (first, last) = market_data
        .date_span()
        .ok_or_else(|| anyhow!("Market data snapshot {} is empty", data_path.display()))?;

    Ok(RunInputs {
        market_data,
        config,
        instruments,
        start: start.unwrap_or(first),
        end: end.unwrap_or(last),
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}
