use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::bar_utils::{group_bars_by_instrument, is_valid_bar, normalize_instrument_id};
use crate::models::Bar;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

/// Date-bounded access to per-instrument price series.
pub trait PriceSeriesStore {
    /// Up to `lookback` bars ending at the last bar dated on or before `as_of`.
    /// Never returns a bar dated after `as_of`.
    fn history(&self, instrument: &str, as_of: DateTime<Utc>, lookback: usize) -> &[Bar];

    /// Ascending union of bar dates for `instruments` within `[start, end]`.
    fn trading_dates(
        &self,
        instruments: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>>;

    fn bar_on(&self, instrument: &str, date: DateTime<Utc>) -> Option<&Bar> {
        self.history(instrument, date, 1)
            .last()
            .filter(|bar| bar.date == date)
    }
}

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    instruments: Vec<String>,
    bars: Vec<Bar>,
}

/// In-memory store backed by per-instrument sorted bar vectors.
#[derive(Debug, Clone)]
pub struct MarketData {
    instruments: Arc<Vec<String>>,
    bars_by_instrument: Arc<HashMap<String, Vec<Bar>>>,
}

impl MarketData {
    pub fn from_bars(bars: Vec<Bar>) -> Result<Self> {
        let total = bars.len();
        let mut usable = Vec::with_capacity(total);
        for mut bar in bars {
            if !is_valid_bar(&bar) {
                continue;
            }
            let Some(id) = normalize_instrument_id(&bar.instrument) else {
                continue;
            };
            bar.instrument = id;
            usable.push(bar);
        }
        if usable.len() < total {
            warn!(
                "Dropped {} invalid bars while building market data",
                total - usable.len()
            );
        }

        let bars_by_instrument = group_bars_by_instrument(usable);
        if bars_by_instrument.is_empty() {
            return Err(anyhow!("Market data has no usable bars"));
        }
        let mut instruments: Vec<String> = bars_by_instrument.keys().cloned().collect();
        instruments.sort();

        Ok(Self {
            instruments: Arc::new(instruments),
            bars_by_instrument: Arc::new(bars_by_instrument),
        })
    }

    /// Loads a snapshot. `.json` files are read as JSON, everything else as bincode.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot = if is_json_path(path) {
            serde_json::from_reader(reader).context("Snapshot decode failed")?
        } else {
            bincode::deserialize_from(reader).context("Snapshot decode failed")?
        };

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        let data = Self::from_bars(snapshot.bars)?;
        info!(
            "Loaded {} instruments from snapshot generated at {}",
            data.instruments.len(),
            snapshot.generated_at.format("%Y-%m-%d %H:%M")
        );
        Ok(data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            instruments: self.instruments.as_ref().clone(),
            bars: self
                .instruments
                .iter()
                .filter_map(|id| self.bars_by_instrument.get(id))
                .flat_map(|bars| bars.iter().cloned())
                .collect(),
        };
        if is_json_path(path) {
            serde_json::to_writer(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot")?;
        } else {
            bincode::serialize_into(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot")?;
        }
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub fn bars(&self, instrument: &str) -> &[Bar] {
        self.bars_by_instrument
            .get(instrument)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First and last bar dates across the whole store.
    pub fn date_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self
            .bars_by_instrument
            .values()
            .filter_map(|bars| bars.first().map(|bar| bar.date))
            .min()?;
        let last = self
            .bars_by_instrument
            .values()
            .filter_map(|bars| bars.last().map(|bar| bar.date))
            .max()?;
        Some((first, last))
    }
}

impl PriceSeriesStore for MarketData {
    fn history(&self, instrument: &str, as_of: DateTime<Utc>, lookback: usize) -> &[Bar] {
        let bars = self.bars(instrument);
        let end = bars.partition_point(|bar| bar.date <= as_of);
        let start = end.saturating_sub(lookback);
        &bars[start..end]
    }

    fn trading_dates(
        &self,
        instruments: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let mut dates = BTreeSet::new();
        for id in instruments {
            let bars = self.bars(id);
            let from = bars.partition_point(|bar| bar.date < start);
            let to = bars.partition_point(|bar| bar.date <= end);
            dates.extend(bars[from..to].iter().map(|bar| bar.date));
        }
        dates.into_iter().collect()
    }
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn create_date(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    fn generate_bars(instrument: &str, days: &[i64]) -> Vec<Bar> {
        days.iter()
            .map(|&day| {
                let close = 10.0 + day as f64;
                Bar {
                    instrument: instrument.to_string(),
                    date: create_date(day),
                    open: close,
                    high: close * 1.01,
                    low: close * 0.99,
                    close,
                    volume: 10_000.0,
                    amount: close * 10_000.0,
                    turnover: 0.01,
                }
            })
            .collect()
    }

    #[test]
    fn history_is_truncated_at_as_of() {
        let data = MarketData::from_bars(generate_bars("AAA", &[0, 1, 2, 5, 6])).unwrap();
        let history = data.history("AAA", create_date(4), 10);
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().date, create_date(2));

        let window = data.history("AAA", create_date(6), 2);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].date, create_date(5));

        assert!(data.history("AAA", create_date(-1), 10).is_empty());
        assert!(data.history("ZZZ", create_date(6), 10).is_empty());
    }

    #[test]
    fn randomized_as_of_never_looks_ahead() {
        let mut rng = StdRng::seed_from_u64(42);
        let days: Vec<i64> = (0..400).filter(|_| rng.gen_bool(0.7)).collect();
        let data = MarketData::from_bars(generate_bars("AAA", &days)).unwrap();

        for _ in 0..500 {
            let as_of = create_date(rng.gen_range(-10..420))
                + Duration::hours(rng.gen_range(0..24));
            let lookback = rng.gen_range(1..150);
            let history = data.history("AAA", as_of, lookback);
            assert!(history.len() <= lookback);
            assert!(history.iter().all(|bar| bar.date <= as_of));
            assert!(history.windows(2).all(|pair| pair[0].date < pair[1].date));
            let later_exists = data
                .bars("AAA")
                .iter()
                .any(|bar| bar.date <= as_of && history.last().map_or(true, |last| bar.date > last.date));
            assert!(!later_exists, "history skipped an eligible bar");
        }
    }

    #[test]
    fn trading_dates_are_union_within_bounds() {
        let mut bars = generate_bars("AAA", &[0, 1, 3]);
        bars.extend(generate_bars("BBB", &[1, 2, 4]));
        let data = MarketData::from_bars(bars).unwrap();
        let ids = vec!["AAA".to_string(), "BBB".to_string()];
        let dates = data.trading_dates(&ids, create_date(1), create_date(3));
        assert_eq!(dates, vec![create_date(1), create_date(2), create_date(3)]);
        assert!(data.bar_on("AAA", create_date(2)).is_none());
        assert!(data.bar_on("BBB", create_date(2)).is_some());
    }

    #[test]
    fn drops_invalid_bars_and_normalizes_ids() {
        let mut bars = generate_bars(" aaa ", &[0, 1]);
        bars[1].close = f64::NAN;
        let data = MarketData::from_bars(bars).unwrap();
        assert_eq!(data.instruments(), &["AAA".to_string()]);
        assert_eq!(data.bars("AAA").len(), 1);
    }

    #[test]
    fn empty_market_data_is_an_error() {
        assert!(MarketData::from_bars(Vec::new()).is_err());
    }

    #[test]
    fn snapshot_round_trips_through_bincode_and_json() {
        let data = MarketData::from_bars(generate_bars("AAA", &[0, 1, 2])).unwrap();
        let dir = std::env::temp_dir().join(format!("portfolio-engine-{}", uuid::Uuid::new_v4()));
        for name in ["snapshot.bin", "snapshot.json"] {
            let path = dir.join(name);
            data.save_to_file(&path).unwrap();
            let loaded = MarketData::load_from_file(&path).unwrap();
            assert_eq!(loaded.bars("AAA"), data.bars("AAA"));
        }
        let _ = fs::remove_dir_all(dir);
    }
}
