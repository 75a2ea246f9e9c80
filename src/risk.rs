use crate::config::{CircuitBreakerConfig, InstrumentProfile, PyramidConfig, RiskConfig};
use crate::indicators::{period_return, sma_last};
use crate::models::{ExitKind, MarketPhase, MarketRegime, Position, Signal, TrendDirection};

/// Immutable view of one position at one step, shared by every exit rule.
pub struct ExitContext<'a> {
    pub position: &'a Position,
    pub price: f64,
    pub held_periods: usize,
    /// Closes up to and including the current step.
    pub closes: &'a [f64],
    pub signal: Option<&'a Signal>,
    pub profile: &'a InstrumentProfile,
    pub regime: MarketRegime,
}

impl ExitContext<'_> {
    fn unrealized_return(&self) -> f64 {
        self.position.unrealized_return_at(self.price)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub kind: ExitKind,
    pub ratio: f64,
    pub reason: String,
}

impl ExitDecision {
    fn full(kind: ExitKind, reason: String) -> Self {
        Self {
            kind,
            ratio: 1.0,
            reason,
        }
    }
}

type ExitRule = fn(&ExitContext, &RiskConfig) -> Option<ExitDecision>;

/// Evaluated in order; the first rule that fires wins.
const EXIT_RULES: [ExitRule; 6] = [
    hard_stop_loss,
    trailing_stop,
    partial_stop,
    take_profit,
    time_or_trend_stop,
    advisory_exit,
];

/// At most one exit per position per step.
pub fn evaluate_exit(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    if ctx.held_periods < config.min_holding_periods {
        return emergency_stop(ctx, config);
    }
    EXIT_RULES.iter().find_map(|rule| rule(ctx, config))
}

fn emergency_stop(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    let ret = ctx.unrealized_return();
    (ret <= config.emergency_stop_ratio).then(|| {
        ExitDecision::full(
            ExitKind::StopLoss,
            format!(
                "emergency stop {:.2}% within minimum holding ({} periods)",
                ret * 100.0,
                ctx.held_periods
            ),
        )
    })
}

fn hard_stop_loss(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    let ret = ctx.unrealized_return();
    let stop = ctx.profile.stop_loss_ratio.unwrap_or(config.stop_loss_ratio);
    (ret <= stop).then(|| {
        ExitDecision::full(
            ExitKind::StopLoss,
            format!("loss {:.2}% reached stop {:.2}%", ret * 100.0, stop * 100.0),
        )
    })
}

fn trailing_stop(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    let trailing = &config.trailing;
    let ret = ctx.unrealized_return();
    let peak = ctx.position.peak_return.max(ret);
    if peak < trailing.trigger_ratio {
        return None;
    }
    let highest = ctx.position.highest_price.max(ctx.price);
    if highest <= 0.0 {
        return None;
    }
    let drawdown = 1.0 - ctx.price / highest;
    let distance = trailing.distance_for_peak(peak);
    (drawdown > distance && ret >= trailing.min_protected_profit_ratio).then(|| {
        ExitDecision::full(
            ExitKind::TrailingStop,
            format!(
                "pulled back {:.2}% from high after peak gain {:.2}%",
                drawdown * 100.0,
                peak * 100.0
            ),
        )
    })
}

fn partial_stop(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    let partial = &config.partial;
    if !partial.enabled {
        return None;
    }
    let ret = ctx.unrealized_return();
    if !ctx.position.partially_exited && ret <= partial.first_stage_ratio {
        return Some(ExitDecision {
            kind: ExitKind::PartialStop,
            ratio: partial.exit_ratio,
            reason: format!("first stage loss {:.2}%", ret * 100.0),
        });
    }
    if ctx.position.partially_exited && ret <= partial.second_stage_ratio {
        return Some(ExitDecision::full(
            ExitKind::PartialStopFinal,
            format!("second stage loss {:.2}%", ret * 100.0),
        ));
    }
    None
}

fn take_profit(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    let ret = ctx.unrealized_return();
    let target = ctx
        .profile
        .take_profit_ratio
        .unwrap_or(config.take_profit_ratio);
    (ret >= target).then(|| {
        ExitDecision::full(
            ExitKind::TakeProfit,
            format!("gain {:.2}% reached target {:.2}%", ret * 100.0, target * 100.0),
        )
    })
}

fn time_or_trend_stop(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    if ctx.profile.trend_following_exit {
        trend_break(ctx, config)
    } else {
        time_stop(ctx, config)
    }
}

fn time_stop(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    let time_stop = &config.time_stop;
    let max_periods = ctx
        .profile
        .max_holding_periods
        .unwrap_or(time_stop.max_holding_periods);
    if ctx.held_periods < max_periods {
        return None;
    }
    let ret = ctx.unrealized_return();
    if ret <= time_stop.force_exit_loss_ratio {
        return Some(ExitDecision::full(
            ExitKind::TimeStop,
            format!(
                "held {} periods with loss {:.2}%",
                ctx.held_periods,
                ret * 100.0
            ),
        ));
    }

    let trend_confirmed = ctx
        .signal
        .map(|signal| signal.trend.is_confirmed_uptrend())
        .unwrap_or(false);
    let momentum = period_return(ctx.closes, time_stop.momentum_lookback).unwrap_or(0.0);
    if trend_confirmed || momentum >= time_stop.extension_momentum_ratio {
        return None;
    }

    Some(ExitDecision::full(
        ExitKind::TimeStop,
        format!(
            "held {} periods without trend or momentum ({:.2}%)",
            ctx.held_periods,
            momentum * 100.0
        ),
    ))
}

fn trend_break(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    let trend_stop = &config.trend_stop;
    let ret = ctx.unrealized_return();
    let lookback = if ret >= trend_stop.lock_in_profit_ratio {
        trend_stop.short_lookback
    } else {
        trend_stop.long_lookback
    };
    let sma = sma_last(ctx.closes, lookback)?;
    let floor = sma * (1.0 - trend_stop.break_ratio);
    (ctx.price < floor).then(|| {
        ExitDecision::full(
            ExitKind::TrendBreak,
            format!(
                "close {:.4} broke below {}-period average {:.4}",
                ctx.price, lookback, sma
            ),
        )
    })
}

fn advisory_exit(ctx: &ExitContext, config: &RiskConfig) -> Option<ExitDecision> {
    if !config.advisory_exit_enabled {
        return None;
    }
    let signal = ctx.signal?;
    if !signal.action.is_bearish() {
        return None;
    }
    if ctx.unrealized_return() > 0.0 && ctx.regime == MarketRegime::Bull {
        return None;
    }
    if ctx.profile.no_panic_exit && signal.phase == MarketPhase::Despair {
        return None;
    }
    Some(ExitDecision::full(
        ExitKind::Advisory,
        format!("signal {} (score {:.2})", signal.action.as_str(), signal.score),
    ))
}

/// Aggregate book return when it breaches the portfolio stop, otherwise `None`.
pub fn circuit_breaker(aggregate_return: Option<f64>, config: &CircuitBreakerConfig) -> Option<f64> {
    if !config.enabled {
        return None;
    }
    aggregate_return.filter(|ret| *ret <= config.portfolio_stop_loss_ratio)
}

pub struct PyramidContext<'a> {
    pub position: &'a Position,
    pub price: f64,
    pub step: usize,
    pub signal: Option<&'a Signal>,
    pub rsi: Option<f64>,
    pub cash: f64,
}

/// Notional of the next staged addition, if every pyramiding condition holds.
pub fn pyramid_addition(ctx: &PyramidContext, config: &PyramidConfig) -> Option<f64> {
    if !config.enabled {
        return None;
    }
    let position = ctx.position;
    let adds = position.pyramid_adds;
    if adds >= config.max_adds {
        return None;
    }
    let stage = config.stages.get(adds as usize)?;
    if position.held_periods(ctx.step) < config.min_holding_periods {
        return None;
    }
    let last_action_step = position.last_add_step.unwrap_or(position.entry_step);
    if ctx.step.saturating_sub(last_action_step) < config.cooldown_periods {
        return None;
    }
    if position.unrealized_return_at(ctx.price) < stage.profit_threshold {
        return None;
    }
    if ctx.rsi.map(|rsi| rsi > config.rsi_max).unwrap_or(false) {
        return None;
    }
    if let Some(signal) = ctx.signal {
        if signal.trend.direction == TrendDirection::Downtrend || signal.action.is_bearish() {
            return None;
        }
    }

    let market_value = position.shares as f64 * ctx.price;
    let notional = (market_value * stage.add_ratio).min(ctx.cash * config.max_cash_fraction);
    (notional > 0.0).then_some(notional)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalAction, TrendInfo};
    use chrono::{TimeZone, Utc};

    fn position(cost: f64) -> Position {
        Position {
            trade_id: 1,
            instrument: "AAA".to_string(),
            shares: 1000,
            cost_basis: cost,
            entry_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            entry_step: 0,
            highest_price: cost,
            peak_return: 0.0,
            pyramid_adds: 0,
            last_add_date: None,
            last_add_step: None,
            partially_exited: false,
            partial_exits: 0,
            mark_price: cost,
            invested_capital: cost * 1000.0,
            commissions_paid: 0.0,
            realized_pnl: 0.0,
            shares_sold: 0,
            entry_weight: 0.5,
            entry_score: 0.0,
            entry_phase: MarketPhase::Unknown,
            entry_trend: TrendDirection::Unknown,
        }
    }

    fn signal(action: SignalAction, phase: MarketPhase) -> Signal {
        Signal {
            action,
            score: -3.0,
            confidence: 0.5,
            phase,
            trend: TrendInfo::default(),
        }
    }

    fn ctx<'a>(
        position: &'a Position,
        price: f64,
        held: usize,
        closes: &'a [f64],
        signal: Option<&'a Signal>,
        profile: &'a InstrumentProfile,
    ) -> ExitContext<'a> {
        ExitContext {
            position,
            price,
            held_periods: held,
            closes,
            signal,
            profile,
            regime: MarketRegime::Range,
        }
    }

    #[test]
    fn stop_loss_takes_priority_over_take_profit() {
        let config = RiskConfig {
            stop_loss_ratio: -0.10,
            take_profit_ratio: 0.10,
            min_holding_periods: 0,
            ..Default::default()
        };
        let pos = position(100.0);
        let profile = InstrumentProfile::default();
        let decision = evaluate_exit(&ctx(&pos, 80.0, 3, &[], None, &profile), &config).unwrap();
        assert_eq!(decision.kind, ExitKind::StopLoss);
        assert_eq!(decision.ratio, 1.0);
    }

    #[test]
    fn minimum_holding_blocks_all_but_emergency_stop() {
        let config = RiskConfig::default();
        let pos = position(100.0);
        let profile = InstrumentProfile::default();
        let sell = signal(SignalAction::StrongSell, MarketPhase::Unknown);

        let blocked = evaluate_exit(&ctx(&pos, 91.0, 2, &[], Some(&sell), &profile), &config);
        assert!(blocked.is_none());

        let emergency =
            evaluate_exit(&ctx(&pos, 87.0, 2, &[], Some(&sell), &profile), &config).unwrap();
        assert_eq!(emergency.kind, ExitKind::StopLoss);
    }

    #[test]
    fn trailing_stop_needs_trigger_and_protected_profit() {
        let config = RiskConfig::default();
        let profile = InstrumentProfile::default();
        let mut pos = position(100.0);
        pos.highest_price = 120.0;
        pos.peak_return = 0.20;

        let fired = evaluate_exit(&ctx(&pos, 113.0, 10, &[], None, &profile), &config).unwrap();
        assert_eq!(fired.kind, ExitKind::TrailingStop);

        let shallow = evaluate_exit(&ctx(&pos, 116.0, 10, &[], None, &profile), &config);
        assert!(shallow.is_none());

        pos.highest_price = 105.0;
        pos.peak_return = 0.05;
        let untriggered = evaluate_exit(&ctx(&pos, 99.0, 10, &[], None, &profile), &config);
        assert!(untriggered.is_none());
    }

    #[test]
    fn trailing_stop_needs_pullback_beyond_distance() {
        let mut config = RiskConfig {
            take_profit_ratio: 10.0,
            ..Default::default()
        };
        config.trailing.distance_ratio = 0.25;
        config.trailing.steps.clear();
        let profile = InstrumentProfile::default();
        let mut pos = position(50.0);
        pos.highest_price = 120.0;
        pos.peak_return = 1.4;

        let at_distance = evaluate_exit(&ctx(&pos, 90.0, 10, &[], None, &profile), &config);
        assert!(at_distance.is_none());

        let beyond = evaluate_exit(&ctx(&pos, 89.0, 10, &[], None, &profile), &config).unwrap();
        assert_eq!(beyond.kind, ExitKind::TrailingStop);
    }

    #[test]
    fn partial_stop_escalates() {
        let config = RiskConfig::default();
        let profile = InstrumentProfile::default();
        let mut pos = position(100.0);

        let first = evaluate_exit(&ctx(&pos, 94.0, 10, &[], None, &profile), &config).unwrap();
        assert_eq!(first.kind, ExitKind::PartialStop);
        assert!((first.ratio - 0.5).abs() < 1e-12);

        pos.partially_exited = true;
        let hold = evaluate_exit(&ctx(&pos, 94.0, 11, &[], None, &profile), &config);
        assert!(hold.is_none());

        let second = evaluate_exit(&ctx(&pos, 92.5, 12, &[], None, &profile), &config).unwrap();
        assert_eq!(second.kind, ExitKind::PartialStopFinal);
        assert_eq!(second.ratio, 1.0);
    }

    #[test]
    fn take_profit_respects_instrument_override() {
        let config = RiskConfig::default();
        let profile = InstrumentProfile {
            take_profit_ratio: Some(0.50),
            ..Default::default()
        };
        let mut pos = position(100.0);
        pos.highest_price = 135.0;
        pos.peak_return = 0.35;
        let none = evaluate_exit(&ctx(&pos, 135.0, 10, &[], None, &profile), &config);
        assert!(none.is_none());
        let default_profile = InstrumentProfile::default();
        let tp =
            evaluate_exit(&ctx(&pos, 135.0, 10, &[], None, &default_profile), &config).unwrap();
        assert_eq!(tp.kind, ExitKind::TakeProfit);
    }

    #[test]
    fn time_stop_extends_on_momentum_and_forces_on_loss() {
        let config = RiskConfig::default();
        let profile = InstrumentProfile::default();
        let pos = position(100.0);
        let rising: Vec<f64> = (0..30).map(|i| 95.0 + i as f64 * 0.5).collect();
        let flat = vec![101.0; 30];

        let extended = evaluate_exit(&ctx(&pos, 109.5, 95, &rising, None, &profile), &config);
        assert!(extended.is_none());

        let stale = evaluate_exit(&ctx(&pos, 101.0, 95, &flat, None, &profile), &config).unwrap();
        assert_eq!(stale.kind, ExitKind::TimeStop);

        let losing = evaluate_exit(&ctx(&pos, 96.5, 95, &rising, None, &profile), &config).unwrap();
        assert_eq!(losing.kind, ExitKind::TimeStop);
    }

    #[test]
    fn trend_following_exit_uses_moving_average_break() {
        let config = RiskConfig::default();
        let profile = InstrumentProfile {
            trend_following_exit: true,
            ..Default::default()
        };
        let pos = position(100.0);
        let mut closes = vec![104.0; 25];
        closes.push(101.0);
        let decision =
            evaluate_exit(&ctx(&pos, 101.0, 200, &closes, None, &profile), &config).unwrap();
        assert_eq!(decision.kind, ExitKind::TrendBreak);

        let steady = vec![102.0; 26];
        assert!(evaluate_exit(&ctx(&pos, 102.0, 200, &steady, None, &profile), &config).is_none());
    }

    #[test]
    fn advisory_exit_suppressions() {
        let config = RiskConfig::default();
        let pos = position(100.0);
        let sell = signal(SignalAction::Sell, MarketPhase::Despair);
        let plain = InstrumentProfile::default();
        let no_panic = InstrumentProfile {
            no_panic_exit: true,
            ..Default::default()
        };

        let fired = evaluate_exit(&ctx(&pos, 99.0, 10, &[], Some(&sell), &plain), &config).unwrap();
        assert_eq!(fired.kind, ExitKind::Advisory);

        let suppressed = evaluate_exit(&ctx(&pos, 99.0, 10, &[], Some(&sell), &no_panic), &config);
        assert!(suppressed.is_none());

        let mut bull = ctx(&pos, 103.0, 10, &[], Some(&sell), &plain);
        bull.regime = MarketRegime::Bull;
        assert!(evaluate_exit(&bull, &config).is_none());
    }

    #[test]
    fn circuit_breaker_trips_at_threshold() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(circuit_breaker(Some(-0.12), &config), Some(-0.12));
        assert_eq!(circuit_breaker(Some(-0.05), &config), None);
        assert_eq!(circuit_breaker(None, &config), None);
        let disabled = CircuitBreakerConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(circuit_breaker(Some(-0.5), &disabled), None);
    }

    #[test]
    fn pyramid_addition_follows_stages() {
        let config = PyramidConfig::default();
        let mut pos = position(100.0);
        let base = PyramidContext {
            position: &pos,
            price: 109.0,
            step: 12,
            signal: None,
            rsi: Some(60.0),
            cash: 1_000_000.0,
        };
        let notional = pyramid_addition(&base, &config).unwrap();
        assert!((notional - 1000.0 * 109.0 * 0.30).abs() < 1e-9);

        let too_early = PyramidContext { step: 5, ..base };
        assert!(pyramid_addition(&too_early, &config).is_none());

        let overbought = PyramidContext {
            rsi: Some(80.0),
            ..base
        };
        assert!(pyramid_addition(&overbought, &config).is_none());

        let cash_capped = PyramidContext { cash: 10_000.0, ..base };
        assert!((pyramid_addition(&cash_capped, &config).unwrap() - 8_000.0).abs() < 1e-9);

        pos.pyramid_adds = 1;
        pos.last_add_step = Some(10);
        let second = PyramidContext {
            position: &pos,
            price: 109.0,
            step: 16,
            signal: None,
            rsi: None,
            cash: 1_000_000.0,
        };
        assert!(pyramid_addition(&second, &config).is_none());
        let second_ready = PyramidContext {
            price: 116.0,
            ..second
        };
        assert!(pyramid_addition(&second_ready, &config).is_some());
    }
}
