use crate::models::*;
use anyhow::Result;
use std::collections::HashMap;

/// Source of per-instrument trading signals. Only ever sees bars up to the simulated date.
pub trait SignalProvider {
    fn name(&self) -> &str;
    /// `None` when the provider cannot produce a signal for this history.
    fn evaluate(&self, instrument: &str, history: &[Bar]) -> Option<Signal>;
    fn min_history(&self) -> usize;
}

#[path = "strategies/trend_momentum.rs"]
pub mod trend_momentum;

pub use trend_momentum::TrendMomentumProvider;

pub fn create_provider(
    name: &str,
    parameters: HashMap<String, f64>,
) -> Result<Box<dyn SignalProvider + Send + Sync>> {
    match name {
        "trend_momentum" => Ok(Box::new(TrendMomentumProvider::new(parameters))),
        _ => Err(anyhow::anyhow!("Unknown signal provider: {}", name)),
    }
}
