use crate::models::Bar;
use std::collections::HashMap;

/// Groups owned bars keyed by instrument, sorted by date with duplicate dates dropped
/// (the last bar for a date wins).
pub fn group_bars_by_instrument(bars: Vec<Bar>) -> HashMap<String, Vec<Bar>> {
    let mut grouped: HashMap<String, Vec<Bar>> = HashMap::new();
    for bar in bars {
        grouped.entry(bar.instrument.clone()).or_default().push(bar);
    }

    for values in grouped.values_mut() {
        values.sort_by(|a, b| a.date.cmp(&b.date));
        let mut deduped: Vec<Bar> = Vec::with_capacity(values.len());
        for bar in values.drain(..) {
            match deduped.last_mut() {
                Some(last) if last.date == bar.date => *last = bar,
                _ => deduped.push(bar),
            }
        }
        *values = deduped;
    }

    grouped.retain(|_, values| !values.is_empty());
    grouped
}

/// Normalizes an instrument id by trimming whitespace and uppercasing.
pub fn normalize_instrument_id(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|bar| bar.close).collect()
}

/// A bar is usable when its prices are finite and strictly positive.
pub fn is_valid_bar(bar: &Bar) -> bool {
    [bar.open, bar.high, bar.low, bar.close]
        .iter()
        .all(|value| value.is_finite() && *value > 0.0)
}
