use crate::config::{quality_tier_value, AllocationConfig, ScoringConfig};
use crate::indicators::calculate_rsi;
use crate::models::{MarketPhase, Signal, SignalAction, TrendDirection, TrendInfo};
use serde::Serialize;
use std::cmp::Ordering;

/// Recent price behaviour the scoring heuristics read next to the signal.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceFeatures {
    pub return_10_pct: Option<f64>,
    pub return_20_pct: Option<f64>,
    pub return_60_pct: Option<f64>,
    pub rsi: f64,
}

impl PriceFeatures {
    pub fn from_closes(closes: &[f64], rsi_period: usize) -> Self {
        Self {
            return_10_pct: window_return_pct(closes, 10),
            return_20_pct: window_return_pct(closes, 20),
            return_60_pct: window_return_pct(closes, 60),
            rsi: calculate_rsi(closes, rsi_period)
                .last()
                .copied()
                .unwrap_or(50.0),
        }
    }
}

/// Percent change between the last close and the close `window` bars back, inclusive.
fn window_return_pct(closes: &[f64], window: usize) -> Option<f64> {
    if window < 2 || closes.len() < window {
        return None;
    }
    let base = closes[closes.len() - window];
    let last = closes[closes.len() - 1];
    if base <= 0.0 || !base.is_finite() || !last.is_finite() {
        return None;
    }
    Some((last / base - 1.0) * 100.0)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMetrics {
    pub instrument: String,
    pub action: SignalAction,
    pub score: f64,
    pub phase: MarketPhase,
    pub trend: TrendInfo,
    pub rsi: f64,
    pub expected_return_pct: f64,
    pub win_rate: f64,
    pub momentum: f64,
    pub kelly: f64,
    pub combined_score: f64,
    pub market_score: f64,
}

pub fn evaluate_candidate(
    instrument: &str,
    signal: &Signal,
    features: &PriceFeatures,
    scoring: &ScoringConfig,
) -> CandidateMetrics {
    let expected_return_pct = expected_return_pct(signal, features, scoring);
    let win_rate = win_rate(signal, features.rsi, scoring);
    let momentum = momentum(signal, features);
    let kelly = kelly_fraction(expected_return_pct, win_rate, scoring.kelly_odds_divisor);

    let norm_return = ((expected_return_pct + 15.0) / 60.0).clamp(0.0, 1.0);
    let norm_momentum = ((momentum + 60.0) / 120.0).clamp(0.0, 1.0);
    let combined_score = (norm_return * scoring.return_weight
        + win_rate * scoring.win_rate_weight
        + norm_momentum * scoring.momentum_weight)
        * (0.4 + kelly * 0.6);

    CandidateMetrics {
        instrument: instrument.to_string(),
        action: signal.action,
        score: signal.score,
        phase: signal.phase,
        trend: signal.trend.clone(),
        rsi: features.rsi,
        expected_return_pct,
        win_rate,
        momentum,
        kelly,
        combined_score,
        market_score: market_score(signal, expected_return_pct, win_rate, scoring),
    }
}

fn expected_return_pct(signal: &Signal, features: &PriceFeatures, scoring: &ScoringConfig) -> f64 {
    let action = signal.action;
    let mut expected = scoring.base_expected_return_pct.get(action)
        + signal.score * scoring.score_return_multiplier;

    if signal.trend.confirmed {
        match signal.trend.direction {
            TrendDirection::Uptrend if action.is_bullish_or_neutral() => expected += 8.0,
            TrendDirection::Downtrend if action.is_bearish() => expected += 5.0,
            _ => {}
        }
    }

    expected += match signal.phase {
        MarketPhase::Despair if action.is_bullish_or_neutral() => 12.0,
        MarketPhase::Hesitation => 5.0,
        MarketPhase::Frenzy if is_buy(action) => -5.0,
        _ => 0.0,
    };

    if let Some(ret) = features.return_20_pct {
        if ret > 15.0 {
            expected += 5.0;
        } else if ret > 8.0 {
            expected += 3.0;
        } else if ret < -15.0 {
            // oversold rebound
            expected += 4.0;
        }
    }

    expected.clamp(-15.0, 45.0)
}

fn win_rate(signal: &Signal, rsi: f64, scoring: &ScoringConfig) -> f64 {
    let action = signal.action;
    let mut rate = scoring.base_win_rate + scoring.win_rate_boost.get(action);

    if action.is_bullish_or_neutral() {
        rate += scoring.phase_win_rate_impact.get(signal.phase);
    }
    if signal.trend.confirmed {
        match signal.trend.direction {
            TrendDirection::Uptrend if action.is_bullish_or_neutral() => rate += 0.16,
            TrendDirection::Downtrend if action.is_bearish() => rate += 0.12,
            _ => {}
        }
    }
    if rsi < 25.0 && action.is_bullish_or_neutral() {
        rate += 0.15;
    } else if rsi > 75.0 && action.is_bearish() {
        rate += 0.10;
    }
    if signal.score > 4.0 {
        rate += 0.10;
    } else if signal.score > 2.0 {
        rate += 0.05;
    } else if signal.score < -3.0 {
        rate -= 0.08;
    }

    rate.clamp(0.30, 0.95)
}

fn momentum(signal: &Signal, features: &PriceFeatures) -> f64 {
    let mut momentum = features.return_10_pct.unwrap_or(0.0) * 2.0
        + features.return_20_pct.unwrap_or(0.0) * 1.5
        + features.return_60_pct.unwrap_or(0.0) * 0.5
        + signal.score * 6.0;
    if signal.trend.confirmed {
        match signal.trend.direction {
            TrendDirection::Uptrend => momentum += 15.0,
            TrendDirection::Downtrend => momentum -= 10.0,
            _ => {}
        }
    }
    momentum
}

fn kelly_fraction(expected_return_pct: f64, win_rate: f64, odds_divisor: f64) -> f64 {
    if expected_return_pct <= 0.0 || odds_divisor <= 0.0 {
        return 0.0;
    }
    let odds = expected_return_pct / odds_divisor;
    ((win_rate * odds - (1.0 - win_rate)) / odds).clamp(0.0, 1.0)
}

/// Market-quality score in [0, 1] used to size total exposure.
fn market_score(
    signal: &Signal,
    expected_return_pct: f64,
    win_rate: f64,
    scoring: &ScoringConfig,
) -> f64 {
    let mut score = scoring.market_signal_score.get(signal.action)
        + scoring.market_phase_score.get(signal.phase);

    score += if signal.trend.confirmed {
        match signal.trend.direction {
            TrendDirection::Uptrend => 0.20,
            TrendDirection::Sideways => 0.12,
            _ => 0.08,
        }
    } else {
        0.10
    };

    score += if expected_return_pct > 18.0 {
        0.15
    } else if expected_return_pct > 12.0 {
        0.12
    } else if expected_return_pct > 8.0 {
        0.09
    } else if expected_return_pct > 4.0 {
        0.06
    } else if expected_return_pct > 0.0 {
        0.03
    } else {
        0.0
    };

    score += if win_rate > 0.75 {
        0.10
    } else if win_rate > 0.65 {
        0.08
    } else if win_rate > 0.55 {
        0.06
    } else if win_rate > 0.50 {
        0.04
    } else {
        0.02
    };

    score.clamp(0.0, 1.0)
}

fn is_buy(action: SignalAction) -> bool {
    matches!(action, SignalAction::Buy | SignalAction::StrongBuy)
}

/// Eligible candidates, best first: composite score, then momentum, then id.
pub fn rank_candidates(
    metrics: &[CandidateMetrics],
    config: &AllocationConfig,
) -> Vec<CandidateMetrics> {
    let mut ranked: Vec<CandidateMetrics> = metrics
        .iter()
        .filter(|m| m.action.is_bullish_or_neutral() && m.combined_score > config.min_combined_score)
        .cloned()
        .collect();
    ranked.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.momentum.partial_cmp(&a.momentum).unwrap_or(Ordering::Equal))
            .then_with(|| a.instrument.cmp(&b.instrument))
    });
    ranked
}

fn has_conviction(candidate: &CandidateMetrics, config: &AllocationConfig) -> bool {
    candidate.expected_return_pct > config.conviction_return_pct
        && candidate.win_rate > config.conviction_win_rate
        && candidate.trend.is_confirmed_uptrend()
}

/// Total invested fraction for the selected set. The top tier needs the leading
/// candidate's expected return, win rate and confirmed uptrend to agree.
pub fn target_exposure(selected: &[CandidateMetrics], config: &AllocationConfig) -> f64 {
    let Some(best) = selected.first() else {
        return 0.0;
    };
    let avg_market_score =
        selected.iter().map(|m| m.market_score).sum::<f64>() / selected.len() as f64;

    let Some(tier_index) = config
        .exposure_tiers
        .iter()
        .position(|tier| avg_market_score >= tier.min_market_score)
    else {
        return 0.0;
    };

    if tier_index == 0 && !has_conviction(best, config) {
        return config
            .exposure_tiers
            .get(1)
            .map(|tier| tier.exposure)
            .unwrap_or(config.exposure_tiers[0].exposure);
    }
    config.exposure_tiers[tier_index].exposure
}

/// Per-instrument target weights summing to at most `total_exposure`, in rank order.
pub fn target_weights(
    selected: &[CandidateMetrics],
    total_exposure: f64,
    config: &AllocationConfig,
) -> Vec<(String, f64)> {
    if selected.is_empty() || total_exposure <= 0.0 {
        return Vec::new();
    }

    if let [only] = selected {
        let tier = quality_tier_value(
            &config.single_weight_tiers,
            only.expected_return_pct,
            only.win_rate,
        )
        .unwrap_or(config.single_weight_fallback);
        let weight = total_exposure.min(tier).min(config.max_single_weight);
        return vec![(only.instrument.clone(), weight)];
    }

    let scores: Vec<f64> = selected
        .iter()
        .map(|m| {
            let quality =
                quality_tier_value(&config.quality_bonus_tiers, m.expected_return_pct, m.win_rate)
                    .unwrap_or(0.0);
            let momentum = config
                .momentum_bonus_tiers
                .iter()
                .find(|tier| m.momentum > tier.min_momentum)
                .map(|tier| tier.bonus)
                .unwrap_or(0.0);
            m.combined_score * (1.0 + quality + momentum)
        })
        .collect();
    let total_score: f64 = scores.iter().sum();

    if total_score <= 0.0 {
        let weight = total_exposure / selected.len() as f64;
        return selected
            .iter()
            .map(|m| (m.instrument.clone(), weight))
            .collect();
    }

    let mut order: Vec<usize> = (0..selected.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    let top = order[0];
    let second_score = scores[order[1]];

    let mut weights = vec![0.0; selected.len()];
    if second_score > 0.0 && scores[top] / second_score > config.standout_ratio {
        let leader = &selected[top];
        let tier = quality_tier_value(
            &config.standout_weight_tiers,
            leader.expected_return_pct,
            leader.win_rate,
        )
        .unwrap_or(config.standout_weight_fallback);
        weights[top] = (total_exposure * tier).min(tier);
        let remaining = (total_exposure - weights[top]).max(0.0);
        let rest_score: f64 = order[1..].iter().map(|&index| scores[index]).sum();
        let rest = (selected.len() - 1) as f64;
        for &index in &order[1..] {
            weights[index] = if rest_score > 0.0 {
                remaining * scores[index] / rest_score
            } else {
                remaining / rest
            };
        }
    } else {
        for (weight, score) in weights.iter_mut().zip(&scores) {
            *weight = score / total_score * total_exposure;
        }
    }

    for weight in weights.iter_mut() {
        *weight = weight.clamp(config.min_single_weight, config.max_single_weight);
    }
    let total_weight: f64 = weights.iter().sum();
    if total_weight > total_exposure {
        let scale = total_exposure / total_weight;
        for weight in weights.iter_mut() {
            *weight *= scale;
        }
    }

    selected
        .iter()
        .zip(weights)
        .map(|(m, weight)| (m.instrument.clone(), weight))
        .collect()
}
