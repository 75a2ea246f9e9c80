use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::models::{MarketPhase, MarketRegime, SignalAction};

/// Slippage, commission and lot rules applied to every fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub slippage_rate: f64,
    pub commission_rate: f64,
    pub min_commission: f64,
    pub lot_size: i64,
    pub min_trade_notional: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_rate: 0.001,
            commission_rate: 0.0003,
            min_commission: 0.0,
            lot_size: 100,
            min_trade_notional: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrailingStep {
    pub min_peak_return: f64,
    pub distance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrailingStopConfig {
    pub trigger_ratio: f64,
    pub distance_ratio: f64,
    pub min_protected_profit_ratio: f64,
    /// Overrides `distance_ratio` once the peak return reaches each step. Sorted ascending.
    pub steps: Vec<TrailingStep>,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            trigger_ratio: 0.12,
            distance_ratio: 0.05,
            min_protected_profit_ratio: 0.02,
            steps: vec![
                TrailingStep {
                    min_peak_return: 0.25,
                    distance: 0.07,
                },
                TrailingStep {
                    min_peak_return: 0.40,
                    distance: 0.06,
                },
            ],
        }
    }
}

impl TrailingStopConfig {
    pub fn distance_for_peak(&self, peak_return: f64) -> f64 {
        self.steps
            .iter()
            .filter(|step| peak_return >= step.min_peak_return)
            .last()
            .map(|step| step.distance)
            .unwrap_or(self.distance_ratio)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PartialStopConfig {
    pub enabled: bool,
    pub first_stage_ratio: f64,
    pub exit_ratio: f64,
    pub second_stage_ratio: f64,
}

impl Default for PartialStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            first_stage_ratio: -0.05,
            exit_ratio: 0.5,
            second_stage_ratio: -0.07,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeStopConfig {
    pub max_holding_periods: usize,
    pub force_exit_loss_ratio: f64,
    pub extension_momentum_ratio: f64,
    pub momentum_lookback: usize,
}

impl Default for TimeStopConfig {
    fn default() -> Self {
        Self {
            max_holding_periods: 90,
            force_exit_loss_ratio: -0.03,
            extension_momentum_ratio: 0.05,
            momentum_lookback: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrendStopConfig {
    pub long_lookback: usize,
    pub short_lookback: usize,
    pub break_ratio: f64,
    pub lock_in_profit_ratio: f64,
}

impl Default for TrendStopConfig {
    fn default() -> Self {
        Self {
            long_lookback: 20,
            short_lookback: 10,
            break_ratio: 0.02,
            lock_in_profit_ratio: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RiskConfig {
    pub min_holding_periods: usize,
    pub emergency_stop_ratio: f64,
    pub stop_loss_ratio: f64,
    pub trailing: TrailingStopConfig,
    pub partial: PartialStopConfig,
    pub take_profit_ratio: f64,
    pub time_stop: TimeStopConfig,
    pub trend_stop: TrendStopConfig,
    pub advisory_exit_enabled: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_holding_periods: 5,
            emergency_stop_ratio: -0.12,
            stop_loss_ratio: -0.08,
            trailing: TrailingStopConfig::default(),
            partial: PartialStopConfig::default(),
            take_profit_ratio: 0.30,
            time_stop: TimeStopConfig::default(),
            trend_stop: TrendStopConfig::default(),
            advisory_exit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub portfolio_stop_loss_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            portfolio_stop_loss_ratio: -0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegimeLimits {
    pub bull: usize,
    pub range: usize,
    pub bear: usize,
}

impl Default for RegimeLimits {
    fn default() -> Self {
        Self {
            bull: 3,
            range: 2,
            bear: 1,
        }
    }
}

impl RegimeLimits {
    pub fn for_regime(&self, regime: MarketRegime) -> usize {
        match regime {
            MarketRegime::Bull => self.bull,
            MarketRegime::Range => self.range,
            MarketRegime::Bear => self.bear,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CooldownConfig {
    pub base_periods: usize,
    pub growth_factor: f64,
    pub max_periods: usize,
    pub sector_stop_threshold: usize,
    pub sector_window_periods: usize,
    pub sector_cooldown_periods: usize,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            base_periods: 5,
            growth_factor: 2.0,
            max_periods: 40,
            sector_stop_threshold: 2,
            sector_window_periods: 20,
            sector_cooldown_periods: 10,
        }
    }
}

impl CooldownConfig {
    /// Blocking window after the n-th consecutive stop-loss (n >= 1).
    pub fn periods_for(&self, consecutive_stops: u32) -> usize {
        if consecutive_stops == 0 {
            return 0;
        }
        let exponent = consecutive_stops.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_periods as f64 * self.growth_factor.powi(exponent);
        if !scaled.is_finite() {
            return self.max_periods;
        }
        (scaled.round() as usize).min(self.max_periods)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrendGateConfig {
    pub min_slope: f64,
    pub min_duration_periods: usize,
}

impl Default for TrendGateConfig {
    fn default() -> Self {
        Self {
            min_slope: 0.0,
            min_duration_periods: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConstraintConfig {
    pub max_positions: RegimeLimits,
    pub sector_cap: f64,
    pub correlated_groups: Vec<Vec<String>>,
    pub cooldown: CooldownConfig,
    pub trend_gate: TrendGateConfig,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            max_positions: RegimeLimits::default(),
            sector_cap: 0.40,
            correlated_groups: Vec::new(),
            cooldown: CooldownConfig::default(),
            trend_gate: TrendGateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PyramidStage {
    pub profit_threshold: f64,
    pub add_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PyramidConfig {
    pub enabled: bool,
    pub max_adds: u32,
    pub min_holding_periods: usize,
    pub cooldown_periods: usize,
    pub max_cash_fraction: f64,
    pub rsi_max: f64,
    pub rsi_period: usize,
    pub stages: Vec<PyramidStage>,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_adds: 3,
            min_holding_periods: 10,
            cooldown_periods: 5,
            max_cash_fraction: 0.8,
            rsi_max: 75.0,
            rsi_period: 14,
            stages: vec![
                PyramidStage {
                    profit_threshold: 0.08,
                    add_ratio: 0.30,
                },
                PyramidStage {
                    profit_threshold: 0.15,
                    add_ratio: 0.20,
                },
                PyramidStage {
                    profit_threshold: 0.25,
                    add_ratio: 0.15,
                },
            ],
        }
    }
}

/// Weight tier keyed on expected return (percent points) and win rate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QualityTier {
    pub min_expected_return_pct: f64,
    pub min_win_rate: f64,
    pub value: f64,
}

impl QualityTier {
    fn new(min_expected_return_pct: f64, min_win_rate: f64, value: f64) -> Self {
        Self {
            min_expected_return_pct,
            min_win_rate,
            value,
        }
    }
}

/// First tier (in order) whose thresholds are strictly exceeded.
pub fn quality_tier_value(
    tiers: &[QualityTier],
    expected_return_pct: f64,
    win_rate: f64,
) -> Option<f64> {
    tiers
        .iter()
        .find(|tier| {
            expected_return_pct > tier.min_expected_return_pct && win_rate > tier.min_win_rate
        })
        .map(|tier| tier.value)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExposureTier {
    pub min_market_score: f64,
    pub exposure: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MomentumTier {
    pub min_momentum: f64,
    pub bonus: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AllocationConfig {
    pub rebalance_threshold: f64,
    pub min_combined_score: f64,
    pub min_single_weight: f64,
    pub max_single_weight: f64,
    pub standout_ratio: f64,
    pub drop_unselected: bool,
    /// Descending by `min_market_score`. The first tier also requires conviction.
    pub exposure_tiers: Vec<ExposureTier>,
    pub conviction_return_pct: f64,
    pub conviction_win_rate: f64,
    pub single_weight_tiers: Vec<QualityTier>,
    pub single_weight_fallback: f64,
    pub standout_weight_tiers: Vec<QualityTier>,
    pub standout_weight_fallback: f64,
    pub quality_bonus_tiers: Vec<QualityTier>,
    pub momentum_bonus_tiers: Vec<MomentumTier>,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            rebalance_threshold: 0.12,
            min_combined_score: 0.08,
            min_single_weight: 0.20,
            max_single_weight: 0.90,
            standout_ratio: 1.5,
            drop_unselected: true,
            exposure_tiers: vec![
                ExposureTier {
                    min_market_score: 0.55,
                    exposure: 0.90,
                },
                ExposureTier {
                    min_market_score: 0.40,
                    exposure: 0.75,
                },
                ExposureTier {
                    min_market_score: 0.25,
                    exposure: 0.55,
                },
                ExposureTier {
                    min_market_score: 0.12,
                    exposure: 0.30,
                },
            ],
            conviction_return_pct: 18.0,
            conviction_win_rate: 0.72,
            single_weight_tiers: vec![
                QualityTier::new(18.0, 0.72, 0.90),
                QualityTier::new(14.0, 0.68, 0.85),
                QualityTier::new(10.0, 0.62, 0.75),
                QualityTier::new(6.0, 0.55, 0.65),
            ],
            single_weight_fallback: 0.50,
            standout_weight_tiers: vec![
                QualityTier::new(14.0, 0.68, 0.85),
                QualityTier::new(10.0, 0.60, 0.75),
            ],
            standout_weight_fallback: 0.65,
            quality_bonus_tiers: vec![
                QualityTier::new(18.0, 0.72, 1.0),
                QualityTier::new(14.0, 0.68, 0.6),
                QualityTier::new(10.0, 0.62, 0.35),
                QualityTier::new(6.0, 0.55, 0.15),
            ],
            momentum_bonus_tiers: vec![
                MomentumTier {
                    min_momentum: 35.0,
                    bonus: 0.35,
                },
                MomentumTier {
                    min_momentum: 20.0,
                    bonus: 0.20,
                },
                MomentumTier {
                    min_momentum: 10.0,
                    bonus: 0.10,
                },
            ],
        }
    }
}

/// Per-action lookup used by the scoring tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionTable {
    pub strong_buy: f64,
    pub buy: f64,
    pub hold: f64,
    pub sell: f64,
    pub strong_sell: f64,
}

impl ActionTable {
    pub fn get(&self, action: SignalAction) -> f64 {
        match action {
            SignalAction::StrongBuy => self.strong_buy,
            SignalAction::Buy => self.buy,
            SignalAction::Hold => self.hold,
            SignalAction::Sell => self.sell,
            SignalAction::StrongSell => self.strong_sell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTable {
    pub despair: f64,
    pub hesitation: f64,
    pub frenzy: f64,
    pub unknown: f64,
}

impl PhaseTable {
    pub fn get(&self, phase: MarketPhase) -> f64 {
        match phase {
            MarketPhase::Despair => self.despair,
            MarketPhase::Hesitation => self.hesitation,
            MarketPhase::Frenzy => self.frenzy,
            MarketPhase::Unknown => self.unknown,
        }
    }
}

/// Heuristics turning a signal into expected return, win rate and momentum.
/// Returns and momentum are in percent points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringConfig {
    pub return_weight: f64,
    pub win_rate_weight: f64,
    pub momentum_weight: f64,
    pub base_win_rate: f64,
    pub win_rate_boost: ActionTable,
    pub phase_win_rate_impact: PhaseTable,
    pub base_expected_return_pct: ActionTable,
    pub score_return_multiplier: f64,
    pub kelly_odds_divisor: f64,
    pub market_signal_score: ActionTable,
    pub market_phase_score: PhaseTable,
    pub rsi_period: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            return_weight: 0.60,
            win_rate_weight: 0.20,
            momentum_weight: 0.20,
            base_win_rate: 0.55,
            win_rate_boost: ActionTable {
                strong_buy: 0.22,
                buy: 0.14,
                hold: 0.06,
                sell: -0.12,
                strong_sell: -0.22,
            },
            phase_win_rate_impact: PhaseTable {
                despair: 0.22,
                hesitation: 0.10,
                frenzy: -0.10,
                unknown: 0.04,
            },
            base_expected_return_pct: ActionTable {
                strong_buy: 20.0,
                buy: 14.0,
                hold: 7.0,
                sell: -4.0,
                strong_sell: -10.0,
            },
            score_return_multiplier: 1.2,
            kelly_odds_divisor: 8.0,
            market_signal_score: ActionTable {
                strong_buy: 0.30,
                buy: 0.25,
                hold: 0.18,
                sell: 0.08,
                strong_sell: 0.0,
            },
            market_phase_score: PhaseTable {
                despair: 0.25,
                hesitation: 0.20,
                frenzy: 0.10,
                unknown: 0.15,
            },
            rsi_period: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegimeConfig {
    pub bull_min_avg_score: f64,
    pub bull_min_uptrend_share: f64,
    pub bear_max_avg_score: f64,
    pub bear_min_downtrend_share: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            bull_min_avg_score: 1.0,
            bull_min_uptrend_share: 0.5,
            bear_max_avg_score: -1.0,
            bear_min_downtrend_share: 0.5,
        }
    }
}

/// Typed per-instrument record. Flags replace name-based special cases.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct InstrumentProfile {
    pub name: Option<String>,
    pub sector: Option<String>,
    pub trend_only: bool,
    pub trend_following_exit: bool,
    pub no_panic_exit: bool,
    pub no_despair_buy: bool,
    pub stop_loss_ratio: Option<f64>,
    pub take_profit_ratio: Option<f64>,
    pub max_holding_periods: Option<usize>,
}

static DEFAULT_PROFILE: InstrumentProfile = InstrumentProfile {
    name: None,
    sector: None,
    trend_only: false,
    trend_following_exit: false,
    no_panic_exit: false,
    no_despair_buy: false,
    stop_loss_ratio: None,
    take_profit_ratio: None,
    max_holding_periods: None,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BacktestConfig {
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub constraints: ConstraintConfig,
    pub pyramid: PyramidConfig,
    pub allocation: AllocationConfig,
    pub scoring: ScoringConfig,
    pub regime: RegimeConfig,
    pub instruments: HashMap<String, InstrumentProfile>,
    pub rebalance_every_periods: usize,
    pub history_lookback: usize,
    pub liquidate_at_end: bool,
    pub risk_free_rate: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            constraints: ConstraintConfig::default(),
            pyramid: PyramidConfig::default(),
            allocation: AllocationConfig::default(),
            scoring: ScoringConfig::default(),
            regime: RegimeConfig::default(),
            instruments: HashMap::new(),
            rebalance_every_periods: 8,
            history_lookback: 120,
            liquidate_at_end: true,
            risk_free_rate: 0.03,
        }
    }
}

impl BacktestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn profile(&self, instrument: &str) -> &InstrumentProfile {
        self.instruments.get(instrument).unwrap_or(&DEFAULT_PROFILE)
    }

    pub fn sector_of(&self, instrument: &str) -> Option<&str> {
        self.profile(instrument).sector.as_deref()
    }

    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        require_range("execution.slippageRate", exec.slippage_rate, Some(0.0), Some(0.5))?;
        require_range("execution.commissionRate", exec.commission_rate, Some(0.0), Some(0.5))?;
        require_range("execution.minCommission", exec.min_commission, Some(0.0), None)?;
        require_range("execution.minTradeNotional", exec.min_trade_notional, Some(0.0), None)?;
        if exec.lot_size < 1 {
            return Err(anyhow!(
                "Setting execution.lotSize must be >= 1 (value: {})",
                exec.lot_size
            ));
        }

        let risk = &self.risk;
        require_range("risk.emergencyStopRatio", risk.emergency_stop_ratio, Some(-1.0), Some(0.0))?;
        require_range("risk.stopLossRatio", risk.stop_loss_ratio, Some(-1.0), Some(0.0))?;
        require_range("risk.takeProfitRatio", risk.take_profit_ratio, Some(0.0), None)?;
        require_range("risk.trailing.triggerRatio", risk.trailing.trigger_ratio, Some(0.0), None)?;
        require_range("risk.trailing.distanceRatio", risk.trailing.distance_ratio, Some(0.0), Some(1.0))?;
        for step in &risk.trailing.steps {
            require_range("risk.trailing.steps.distance", step.distance, Some(0.0), Some(1.0))?;
        }
        if risk
            .trailing
            .steps
            .windows(2)
            .any(|pair| pair[1].min_peak_return < pair[0].min_peak_return)
        {
            return Err(anyhow!(
                "Setting risk.trailing.steps must be sorted by minPeakReturn"
            ));
        }
        require_range("risk.partial.exitRatio", risk.partial.exit_ratio, Some(0.0), Some(1.0))?;
        if risk.partial.enabled && risk.partial.second_stage_ratio > risk.partial.first_stage_ratio {
            return Err(anyhow!(
                "Setting risk.partial.secondStageRatio ({}) must be <= firstStageRatio ({})",
                risk.partial.second_stage_ratio,
                risk.partial.first_stage_ratio
            ));
        }
        require_range("risk.timeStop.forceExitLossRatio", risk.time_stop.force_exit_loss_ratio, Some(-1.0), Some(0.0))?;
        require_range("risk.trendStop.breakRatio", risk.trend_stop.break_ratio, Some(0.0), Some(1.0))?;
        if risk.trend_stop.long_lookback == 0 || risk.trend_stop.short_lookback == 0 {
            return Err(anyhow!("Setting risk.trendStop lookbacks must be >= 1"));
        }

        require_range(
            "circuitBreaker.portfolioStopLossRatio",
            self.circuit_breaker.portfolio_stop_loss_ratio,
            Some(-1.0),
            Some(0.0),
        )?;

        let constraints = &self.constraints;
        require_range("constraints.sectorCap", constraints.sector_cap, Some(0.0), Some(1.0))?;
        require_range("constraints.cooldown.growthFactor", constraints.cooldown.growth_factor, Some(1.0), None)?;

        let pyramid = &self.pyramid;
        require_range("pyramid.maxCashFraction", pyramid.max_cash_fraction, Some(0.0), Some(1.0))?;
        for stage in &pyramid.stages {
            require_range("pyramid.stages.addRatio", stage.add_ratio, Some(0.0), Some(1.0))?;
        }

        let alloc = &self.allocation;
        require_range("allocation.rebalanceThreshold", alloc.rebalance_threshold, Some(0.0), Some(1.0))?;
        require_range("allocation.minSingleWeight", alloc.min_single_weight, Some(0.0), Some(1.0))?;
        require_range("allocation.maxSingleWeight", alloc.max_single_weight, Some(0.0), Some(1.0))?;
        if alloc.min_single_weight > alloc.max_single_weight {
            return Err(anyhow!(
                "Setting allocation.maxSingleWeight ({}) must be >= minSingleWeight ({})",
                alloc.max_single_weight,
                alloc.min_single_weight
            ));
        }
        require_range("allocation.standoutRatio", alloc.standout_ratio, Some(1.0), None)?;
        for tier in &alloc.exposure_tiers {
            require_range("allocation.exposureTiers.exposure", tier.exposure, Some(0.0), Some(1.0))?;
        }

        require_range("scoring.kellyOddsDivisor", self.scoring.kelly_odds_divisor, Some(f64::MIN_POSITIVE), None)?;

        if self.rebalance_every_periods == 0 {
            return Err(anyhow!("Setting rebalanceEveryPeriods must be >= 1 (value: 0)"));
        }
        if self.history_lookback == 0 {
            return Err(anyhow!("Setting historyLookback must be >= 1 (value: 0)"));
        }
        require_range("riskFreeRate", self.risk_free_rate, Some(0.0), Some(1.0))?;

        for (instrument, profile) in &self.instruments {
            if let Some(ratio) = profile.stop_loss_ratio {
                require_range(
                    &format!("instruments.{}.stopLossRatio", instrument),
                    ratio,
                    Some(-1.0),
                    Some(0.0),
                )?;
            }
            if let Some(ratio) = profile.take_profit_ratio {
                require_range(
                    &format!("instruments.{}.takeProfitRatio", instrument),
                    ratio,
                    Some(0.0),
                    None,
                )?;
            }
        }

        Ok(())
    }

    /// Returns a copy with scalar fields overridden from a camelCase parameter map.
    pub fn with_parameters(&self, parameters: &HashMap<String, f64>) -> Self {
        use crate::param_utils::*;

        let mut config = self.clone();
        let exec = &mut config.execution;
        exec.slippage_rate = get_param(parameters, "slippageRate", exec.slippage_rate);
        exec.commission_rate = get_param(parameters, "commissionRate", exec.commission_rate);
        exec.min_trade_notional = get_param(parameters, "minTradeNotional", exec.min_trade_notional);

        let risk = &mut config.risk;
        risk.min_holding_periods =
            get_param_usize(parameters, "minHoldingPeriods", risk.min_holding_periods);
        risk.emergency_stop_ratio =
            get_param(parameters, "emergencyStopRatio", risk.emergency_stop_ratio);
        risk.stop_loss_ratio = get_param(parameters, "stopLossRatio", risk.stop_loss_ratio);
        risk.take_profit_ratio = get_param(parameters, "takeProfitRatio", risk.take_profit_ratio);
        risk.trailing.trigger_ratio =
            get_param(parameters, "trailingTriggerRatio", risk.trailing.trigger_ratio);
        risk.trailing.distance_ratio =
            get_param(parameters, "trailingDistanceRatio", risk.trailing.distance_ratio);
        risk.partial.enabled = coerce_binary_param(
            get_param(parameters, "partialStopEnabled", bool_param(risk.partial.enabled)),
            1.0,
        ) >= 0.5;
        risk.time_stop.max_holding_periods = get_usize_param_min(
            parameters,
            "maxHoldingPeriods",
            risk.time_stop.max_holding_periods,
            1,
        );

        config.circuit_breaker.portfolio_stop_loss_ratio = get_param(
            parameters,
            "portfolioStopLossRatio",
            config.circuit_breaker.portfolio_stop_loss_ratio,
        );

        let constraints = &mut config.constraints;
        constraints.sector_cap = get_param_f64_clamped(
            parameters,
            "sectorCap",
            constraints.sector_cap,
            0.0,
            1.0,
        );
        constraints.max_positions.bull =
            get_usize_param_min(parameters, "maxPositionsBull", constraints.max_positions.bull, 1);
        constraints.max_positions.range =
            get_usize_param_min(parameters, "maxPositionsRange", constraints.max_positions.range, 1);
        constraints.max_positions.bear =
            get_usize_param_min(parameters, "maxPositionsBear", constraints.max_positions.bear, 1);
        constraints.cooldown.base_periods =
            get_param_usize(parameters, "cooldownPeriods", constraints.cooldown.base_periods);

        config.pyramid.enabled = coerce_binary_param(
            get_param(parameters, "pyramidEnabled", bool_param(config.pyramid.enabled)),
            1.0,
        ) >= 0.5;

        let alloc = &mut config.allocation;
        alloc.rebalance_threshold =
            get_param(parameters, "rebalanceThreshold", alloc.rebalance_threshold);
        alloc.max_single_weight = get_param_f64_clamped(
            parameters,
            "maxSingleWeight",
            alloc.max_single_weight,
            0.0,
            1.0,
        );
        alloc.min_combined_score =
            get_param(parameters, "minCombinedScore", alloc.min_combined_score);

        config.rebalance_every_periods = get_usize_param_min(
            parameters,
            "rebalanceEveryPeriods",
            config.rebalance_every_periods,
            1,
        );
        config
    }
}

fn bool_param(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn require_range(key: &str, value: f64, min: Option<f64>, max: Option<f64>) -> Result<()> {
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, value));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                value
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                value
            ));
        }
    }
    Ok(())
}
