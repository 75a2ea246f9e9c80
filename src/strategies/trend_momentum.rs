use crate::indicators::{calculate_rsi, calculate_sma, normalized_slope, period_return};
use crate::models::*;
use crate::param_utils::{get_param, get_param_usize_at_least};
use crate::strategy_utils::{action_from_score, confidence_from_score, trailing_run};
use std::collections::HashMap;

/// Reference provider: moving-average trend, RSI and rate of change combined into one score.
pub struct TrendMomentumProvider {
    name: String,
    short_period: usize,
    long_period: usize,
    rsi_period: usize,
    slope_period: usize,
    momentum_lookback: usize,
    drawdown_lookback: usize,
    confirm_periods: usize,
    despair_drawdown: f64,
    frenzy_return: f64,
}

impl TrendMomentumProvider {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        Self {
            name: "trend_momentum".to_string(),
            short_period: get_param_usize_at_least(&parameters, "shortPeriod", 10, 2),
            long_period: get_param_usize_at_least(&parameters, "longPeriod", 30, 3),
            rsi_period: get_param_usize_at_least(&parameters, "rsiPeriod", 14, 2),
            slope_period: get_param_usize_at_least(&parameters, "slopePeriod", 10, 2),
            momentum_lookback: get_param_usize_at_least(&parameters, "momentumLookback", 20, 1),
            drawdown_lookback: get_param_usize_at_least(&parameters, "drawdownLookback", 60, 2),
            confirm_periods: get_param_usize_at_least(&parameters, "confirmPeriods", 3, 1),
            despair_drawdown: get_param(&parameters, "despairDrawdown", 0.20),
            frenzy_return: get_param(&parameters, "frenzyReturn", 0.10),
        }
    }

    fn trend(&self, closes: &[f64], sma_short: &[f64], sma_long: &[f64]) -> TrendInfo {
        let last = closes.len() - 1;
        let slope = normalized_slope(sma_long, self.slope_period).unwrap_or(0.0);
        let close = closes[last];

        let direction = if close > sma_long[last] && sma_short[last] > sma_long[last] && slope > 0.0
        {
            TrendDirection::Uptrend
        } else if close < sma_long[last] && sma_short[last] < sma_long[last] && slope < 0.0 {
            TrendDirection::Downtrend
        } else {
            TrendDirection::Sideways
        };

        let duration_periods = match direction {
            TrendDirection::Uptrend => trailing_run(closes, |i, v| v > sma_long[i]),
            TrendDirection::Downtrend => trailing_run(closes, |i, v| v < sma_long[i]),
            _ => 0,
        };

        TrendInfo {
            direction,
            confirmed: direction != TrendDirection::Sideways
                && duration_periods >= self.confirm_periods,
            slope,
            duration_periods,
        }
    }

    fn phase(&self, closes: &[f64], rsi: f64, momentum: f64, trend: &TrendInfo) -> MarketPhase {
        let window_start = closes.len().saturating_sub(self.drawdown_lookback);
        let peak = closes[window_start..]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let close = closes[closes.len() - 1];
        let drawdown = if peak > 0.0 { 1.0 - close / peak } else { 0.0 };

        if drawdown >= self.despair_drawdown && rsi < 35.0 {
            MarketPhase::Despair
        } else if rsi > 75.0 && momentum > self.frenzy_return {
            MarketPhase::Frenzy
        } else if momentum.abs() < 0.03 && trend.direction == TrendDirection::Sideways {
            MarketPhase::Hesitation
        } else {
            MarketPhase::Unknown
        }
    }
}

impl super::SignalProvider for TrendMomentumProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, _instrument: &str, history: &[Bar]) -> Option<Signal> {
        if history.len() < self.min_history() {
            return None;
        }
        let closes: Vec<f64> = history.iter().map(|bar| bar.close).collect();
        if closes.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return None;
        }

        let sma_short = calculate_sma(&closes, self.short_period);
        let sma_long = calculate_sma(&closes, self.long_period);
        let rsi = calculate_rsi(&closes, self.rsi_period)
            .last()
            .copied()
            .unwrap_or(50.0);
        let momentum = period_return(&closes, self.momentum_lookback).unwrap_or(0.0);
        let trend = self.trend(&closes, &sma_short, &sma_long);

        let mut score = match (trend.direction, trend.confirmed) {
            (TrendDirection::Uptrend, true) => 2.5,
            (TrendDirection::Uptrend, false) => 1.5,
            (TrendDirection::Downtrend, true) => -2.5,
            (TrendDirection::Downtrend, false) => -1.5,
            _ => 0.0,
        };
        score += (momentum * 20.0).clamp(-3.0, 3.0);
        score += (trend.slope * 100.0).clamp(-1.5, 1.5);
        if rsi < 30.0 {
            score += 1.5;
        } else if rsi > 70.0 {
            score -= 1.5;
        }
        let score = score.clamp(-10.0, 10.0);

        Some(Signal {
            action: action_from_score(score),
            score,
            confidence: confidence_from_score(score, 6.0),
            phase: self.phase(&closes, rsi, momentum, &trend),
            trend,
        })
    }

    fn min_history(&self) -> usize {
        self.long_period
            .max(self.rsi_period + 1)
            .max(self.momentum_lookback + 1)
            .max(self.slope_period)
            + 1
    }
}
