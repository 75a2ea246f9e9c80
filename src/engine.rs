use crate::allocation::{
    evaluate_candidate, rank_candidates, target_exposure, target_weights, CandidateMetrics,
    PriceFeatures,
};
use crate::bar_utils::closes;
use crate::config::BacktestConfig;
use crate::constraints::{ConstraintManager, EntryRequest};
use crate::data_context::PriceSeriesStore;
use crate::indicators::calculate_rsi;
use crate::ledger::{EntryOutcome, Ledger};
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::risk::{circuit_breaker, evaluate_exit, pyramid_addition, ExitContext, PyramidContext};
use crate::strategy::SignalProvider;
use crate::trading_rules::affordable_notional;
use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Signals and regime for the date being simulated. Dropped when the date advances.
#[derive(Default)]
struct RunCache {
    date: Option<DateTime<Utc>>,
    signals: HashMap<String, Option<Signal>>,
    regime: Option<MarketRegime>,
}

impl RunCache {
    fn roll_to(&mut self, date: DateTime<Utc>) {
        if self.date != Some(date) {
            self.date = Some(date);
            self.signals.clear();
            self.regime = None;
        }
    }
}

struct RunState {
    ledger: Ledger,
    constraints: ConstraintManager,
    cache: RunCache,
    /// Closes of instruments with a bar on the current date.
    prices: HashMap<String, f64>,
    snapshots: Vec<Snapshot>,
    events: Vec<StepEvent>,
    allocation_changes: usize,
}

impl RunState {
    fn record(&mut self, event: StepEvent) {
        debug!(
            "{} skip {}: {}{}",
            event.date.format("%Y-%m-%d"),
            event.instrument,
            event.reason.as_str(),
            event
                .details
                .as_deref()
                .map(|details| format!(" ({})", details))
                .unwrap_or_default()
        );
        self.events.push(event);
    }
}

/// Inputs fixed for one simulated date.
struct StepInputs<'a> {
    store: &'a dyn PriceSeriesStore,
    provider: &'a dyn SignalProvider,
    instruments: &'a [String],
    date: DateTime<Utc>,
    step: usize,
}

pub struct Engine {
    pub config: BacktestConfig,
}

impl Engine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    // Construct an Engine with scalar settings overridden from a parameter map.
    pub fn from_parameters(base: &BacktestConfig, parameters: &HashMap<String, f64>) -> Self {
        Self::new(base.with_parameters(parameters))
    }

    pub fn run(
        &self,
        store: &dyn PriceSeriesStore,
        provider: &dyn SignalProvider,
        instruments: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        initial_cash: f64,
    ) -> Result<BacktestResult> {
        ensure!(
            initial_cash.is_finite() && initial_cash > 0.0,
            "Initial cash must be positive (value: {})",
            initial_cash
        );
        ensure!(!instruments.is_empty(), "At least one instrument is required");
        ensure!(start <= end, "Start date {} is after end date {}", start, end);
        self.config.validate()?;

        let dates = store.trading_dates(instruments, start, end);
        ensure!(
            !dates.is_empty(),
            "No trading dates between {} and {} for {} instruments",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            instruments.len()
        );

        info!(
            "Running backtest with {} over {} instruments and {} dates ({} to {})",
            provider.name(),
            instruments.len(),
            dates.len(),
            dates[0].format("%Y-%m-%d"),
            dates[dates.len() - 1].format("%Y-%m-%d")
        );

        let mut state = RunState {
            ledger: Ledger::new(initial_cash, self.config.execution.clone()),
            constraints: ConstraintManager::new(&self.config),
            cache: RunCache::default(),
            prices: HashMap::new(),
            snapshots: Vec::with_capacity(dates.len()),
            events: Vec::new(),
            allocation_changes: 0,
        };

        let last_step = dates.len() - 1;
        for (step, &date) in dates.iter().enumerate() {
            let inputs = StepInputs {
                store,
                provider,
                instruments,
                date,
                step,
            };
            self.run_step(&mut state, &inputs, step == last_step)?;
        }

        self.finish(state, store, instruments, &dates, initial_cash)
    }

    fn run_step(&self, state: &mut RunState, inputs: &StepInputs, is_last: bool) -> Result<()> {
        state.cache.roll_to(inputs.date);
        self.mark_prices(state, inputs);
        self.run_risk_pipeline(state, inputs)?;
        self.run_circuit_breaker(state, inputs)?;

        if is_last && self.config.liquidate_at_end {
            self.liquidate(state, inputs)?;
        } else {
            if inputs.step % self.config.rebalance_every_periods == 0 {
                self.rebalance(state, inputs)?;
            }
            self.run_pyramiding(state, inputs)?;
        }

        let snapshot = state.ledger.snapshot(inputs.date);
        state.snapshots.push(snapshot);
        Ok(())
    }

    fn mark_prices(&self, state: &mut RunState, inputs: &StepInputs) {
        state.prices.clear();
        for id in inputs.instruments {
            match inputs.store.bar_on(id, inputs.date) {
                Some(bar) => {
                    state.prices.insert(id.clone(), bar.close);
                    state.ledger.mark(id, bar.close);
                }
                None if state.ledger.is_held(id) => {
                    warn!(
                        "{} has no bar on {}; keeping last mark",
                        id,
                        inputs.date.format("%Y-%m-%d")
                    );
                    state.record(StepEvent::new(
                        inputs.date,
                        id,
                        SkipReason::MissingBar,
                        Some("held position keeps its last mark".to_string()),
                    ));
                }
                None => state.record(StepEvent::new(
                    inputs.date,
                    id,
                    SkipReason::MissingBar,
                    None,
                )),
            }
        }
    }

    fn history_closes(&self, inputs: &StepInputs, instrument: &str) -> Vec<f64> {
        closes(
            inputs
                .store
                .history(instrument, inputs.date, self.config.history_lookback),
        )
    }

    /// Memoized per date; data problems are recorded once, on first evaluation.
    fn signal(&self, state: &mut RunState, inputs: &StepInputs, instrument: &str) -> Option<Signal> {
        if let Some(cached) = state.cache.signals.get(instrument) {
            return cached.clone();
        }

        let signal = if state.prices.contains_key(instrument) {
            let lookback = self
                .config
                .history_lookback
                .max(inputs.provider.min_history());
            let history = inputs.store.history(instrument, inputs.date, lookback);
            if history.len() < inputs.provider.min_history() {
                state.record(StepEvent::new(
                    inputs.date,
                    instrument,
                    SkipReason::InsufficientHistory,
                    Some(format!(
                        "{} bars, {} required",
                        history.len(),
                        inputs.provider.min_history()
                    )),
                ));
                None
            } else {
                let signal = inputs.provider.evaluate(instrument, history);
                if signal.is_none() {
                    state.record(StepEvent::new(
                        inputs.date,
                        instrument,
                        SkipReason::SignalUnavailable,
                        Some(inputs.provider.name().to_string()),
                    ));
                }
                signal
            }
        } else {
            None
        };

        state
            .cache
            .signals
            .insert(instrument.to_string(), signal.clone());
        signal
    }

    fn regime(&self, state: &mut RunState, inputs: &StepInputs) -> MarketRegime {
        if let Some(regime) = state.cache.regime {
            return regime;
        }
        let signals: Vec<Signal> = inputs
            .instruments
            .iter()
            .filter_map(|id| self.signal(state, inputs, id))
            .collect();
        let regime = classify_regime(&signals, &self.config);
        state.cache.regime = Some(regime);
        regime
    }

    fn run_risk_pipeline(&self, state: &mut RunState, inputs: &StepInputs) -> Result<()> {
        for id in state.ledger.held_instruments() {
            let Some(&price) = state.prices.get(&id) else {
                continue;
            };
            let signal = self.signal(state, inputs, &id);
            let regime = self.regime(state, inputs);
            let closes = self.history_closes(inputs, &id);

            let decision = match state.ledger.position(&id) {
                Some(position) => evaluate_exit(
                    &ExitContext {
                        position,
                        price,
                        held_periods: position.held_periods(inputs.step),
                        closes: &closes,
                        signal: signal.as_ref(),
                        profile: self.config.profile(&id),
                        regime,
                    },
                    &self.config.risk,
                ),
                None => None,
            };

            if let Some(decision) = decision {
                self.close_position(
                    state,
                    inputs,
                    &id,
                    price,
                    decision.ratio,
                    decision.kind,
                    &decision.reason,
                )?;
            }
        }
        Ok(())
    }

    fn run_circuit_breaker(&self, state: &mut RunState, inputs: &StepInputs) -> Result<()> {
        let Some(aggregate) =
            circuit_breaker(state.ledger.aggregate_return(), &self.config.circuit_breaker)
        else {
            return Ok(());
        };
        warn!(
            "{} portfolio return {:.2}% breached circuit breaker {:.2}%",
            inputs.date.format("%Y-%m-%d"),
            aggregate * 100.0,
            self.config.circuit_breaker.portfolio_stop_loss_ratio * 100.0
        );

        let reason = format!("portfolio return {:.2}%", aggregate * 100.0);
        for id in self.closable_holdings(state, inputs) {
            let price = state.prices[&id];
            self.close_position(state, inputs, &id, price, 1.0, ExitKind::CircuitBreaker, &reason)?;
        }
        Ok(())
    }

    /// Held instruments with a bar today and past the minimum holding guard.
    fn closable_holdings(&self, state: &RunState, inputs: &StepInputs) -> Vec<String> {
        state
            .ledger
            .positions()
            .values()
            .filter(|position| state.prices.contains_key(&position.instrument))
            .filter(|position| {
                position.held_periods(inputs.step) >= self.config.risk.min_holding_periods
            })
            .map(|position| position.instrument.clone())
            .collect()
    }

    fn liquidate(&self, state: &mut RunState, inputs: &StepInputs) -> Result<()> {
        for id in state.ledger.held_instruments() {
            let price = match state.prices.get(&id) {
                Some(&price) => price,
                None => match state.ledger.position(&id) {
                    Some(position) => position.mark_price,
                    None => continue,
                },
            };
            self.close_position(
                state,
                inputs,
                &id,
                price,
                1.0,
                ExitKind::EndOfBacktest,
                "final liquidation",
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn close_position(
        &self,
        state: &mut RunState,
        inputs: &StepInputs,
        instrument: &str,
        price: f64,
        ratio: f64,
        kind: ExitKind,
        reason: &str,
    ) -> Result<()> {
        let fill = state.ledger.close(
            instrument,
            inputs.date,
            inputs.step,
            price,
            ratio,
            kind,
            reason,
        )?;
        let pnl = if state.ledger.is_held(instrument) {
            fill.realized_pnl.unwrap_or(0.0)
        } else {
            state
                .ledger
                .closed_trades()
                .last()
                .map(|trade| trade.pnl)
                .unwrap_or(0.0)
        };
        state
            .constraints
            .record_exit(instrument, kind, pnl, inputs.step, inputs.date);
        Ok(())
    }

    fn candidate_metrics(&self, state: &mut RunState, inputs: &StepInputs) -> Vec<CandidateMetrics> {
        let mut metrics = Vec::new();
        for id in inputs.instruments {
            let Some(signal) = self.signal(state, inputs, id) else {
                continue;
            };
            let features = PriceFeatures::from_closes(
                &self.history_closes(inputs, id),
                self.config.scoring.rsi_period,
            );
            metrics.push(evaluate_candidate(id, &signal, &features, &self.config.scoring));
        }
        metrics
    }

    fn rebalance(&self, state: &mut RunState, inputs: &StepInputs) -> Result<()> {
        let metrics = self.candidate_metrics(state, inputs);
        if metrics.is_empty() {
            return Ok(());
        }
        let fills_before = state.ledger.trade_log().len();
        let allocation = &self.config.allocation;

        let ranked = rank_candidates(&metrics, allocation);
        if ranked.is_empty() {
            if metrics.iter().all(|m| m.action == SignalAction::StrongSell) {
                for id in self.closable_holdings(state, inputs) {
                    let price = state.prices[&id];
                    self.close_position(
                        state,
                        inputs,
                        &id,
                        price,
                        1.0,
                        ExitKind::Rebalance,
                        "every signal is strong_sell",
                    )?;
                }
            }
            self.count_allocation_change(state, fills_before);
            return Ok(());
        }

        let regime = self.regime(state, inputs);
        let max_positions = self.config.constraints.max_positions.for_regime(regime);
        let selected = &ranked[..ranked.len().min(max_positions)];
        let exposure = target_exposure(selected, allocation);
        let targets = target_weights(selected, exposure, allocation);
        debug!(
            "{} rebalance in {} regime: exposure {:.2}, targets {:?}",
            inputs.date.format("%Y-%m-%d"),
            regime.as_str(),
            exposure,
            targets
        );

        if allocation.drop_unselected {
            let targeted: HashSet<&str> = targets.iter().map(|(id, _)| id.as_str()).collect();
            for id in self.closable_holdings(state, inputs) {
                if targeted.contains(id.as_str()) {
                    continue;
                }
                let price = state.prices[&id];
                self.close_position(
                    state,
                    inputs,
                    &id,
                    price,
                    1.0,
                    ExitKind::Rebalance,
                    "not in target allocation",
                )?;
            }
        }

        let equity = state.ledger.total_equity();

        // Trims release cash before any entry or top-up is sized.
        for (id, weight) in &targets {
            let Some(&price) = state.prices.get(id) else {
                continue;
            };
            let Some(position) = state.ledger.position(id) else {
                continue;
            };
            if position.held_periods(inputs.step) < self.config.risk.min_holding_periods {
                continue;
            }
            let current_value = position.market_value();
            let target_value = equity * weight;
            let deviation = (target_value - current_value) / equity;
            if deviation >= 0.0 || deviation.abs() <= allocation.rebalance_threshold {
                continue;
            }
            let ratio = ((current_value - target_value) / current_value).min(1.0);
            self.close_position(
                state,
                inputs,
                id,
                price,
                ratio,
                ExitKind::Rebalance,
                &format!("trim to weight {:.2}", weight),
            )?;
        }

        for (rank, (id, weight)) in targets.iter().enumerate() {
            let Some(&price) = state.prices.get(id) else {
                continue;
            };
            let Some(candidate) = selected.iter().find(|m| &m.instrument == id) else {
                continue;
            };
            let target_value = equity * weight;

            match state.ledger.position(id).map(|position| position.market_value()) {
                Some(current_value) => {
                    let deviation = (target_value - current_value) / equity;
                    if deviation <= allocation.rebalance_threshold {
                        continue;
                    }
                    self.enter(
                        state,
                        inputs,
                        candidate,
                        price,
                        target_value - current_value,
                        true,
                        &EntryContext {
                            weight: *weight,
                            score: candidate.combined_score,
                            phase: candidate.phase,
                            trend: candidate.trend.direction,
                            reason: format!("top up to weight {:.2}", weight),
                        },
                    )?;
                }
                None => {
                    self.enter(
                        state,
                        inputs,
                        candidate,
                        price,
                        target_value,
                        false,
                        &EntryContext {
                            weight: *weight,
                            score: candidate.combined_score,
                            phase: candidate.phase,
                            trend: candidate.trend.direction,
                            reason: format!(
                                "rank {} weight {:.2} expected {:.1}% win {:.0}%",
                                rank + 1,
                                weight,
                                candidate.expected_return_pct,
                                candidate.win_rate * 100.0
                            ),
                        },
                    )?;
                }
            }
        }

        self.count_allocation_change(state, fills_before);
        Ok(())
    }

    fn count_allocation_change(&self, state: &mut RunState, fills_before: usize) {
        if state.ledger.trade_log().len() > fills_before {
            state.allocation_changes += 1;
        }
    }

    /// Runs the constraint manager, then sizes and executes an entry or addition.
    #[allow(clippy::too_many_arguments)]
    fn enter(
        &self,
        state: &mut RunState,
        inputs: &StepInputs,
        candidate: &CandidateMetrics,
        price: f64,
        desired_notional: f64,
        is_addition: bool,
        entry: &EntryContext,
    ) -> Result<()> {
        let signal = self.signal(state, inputs, &candidate.instrument);
        let regime = self.regime(state, inputs);
        self.admit_and_execute(
            state,
            inputs,
            &candidate.instrument,
            signal.as_ref(),
            regime,
            price,
            desired_notional,
            is_addition,
            entry,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn admit_and_execute(
        &self,
        state: &mut RunState,
        inputs: &StepInputs,
        instrument: &str,
        signal: Option<&Signal>,
        regime: MarketRegime,
        price: f64,
        desired_notional: f64,
        is_addition: bool,
        entry: &EntryContext,
    ) -> Result<()> {
        let request = EntryRequest {
            instrument,
            signal,
            desired_notional,
            is_addition,
            step: inputs.step,
            regime,
        };
        let admission = match state.constraints.admit(&request, &state.ledger) {
            Ok(admission) => admission,
            Err(rejection) => {
                state.record(StepEvent::new(
                    inputs.date,
                    instrument,
                    rejection.reason,
                    Some(rejection.details),
                ));
                return Ok(());
            }
        };

        let notional = admission
            .max_notional
            .min(affordable_notional(state.ledger.cash(), &self.config.execution));
        let outcome = if is_addition {
            state.ledger.add(
                instrument,
                inputs.date,
                inputs.step,
                price,
                notional,
                &entry.reason,
            )?
        } else {
            state
                .ledger
                .open(instrument, inputs.date, inputs.step, price, notional, entry)?
        };

        if let EntryOutcome::Rejected { reason, details } = outcome {
            state.record(StepEvent::new(inputs.date, instrument, reason, details));
        }
        Ok(())
    }

    fn run_pyramiding(&self, state: &mut RunState, inputs: &StepInputs) -> Result<()> {
        let pyramid = &self.config.pyramid;
        if !pyramid.enabled {
            return Ok(());
        }
        for id in state.ledger.held_instruments() {
            let Some(&price) = state.prices.get(&id) else {
                continue;
            };
            let signal = self.signal(state, inputs, &id);
            let closes = self.history_closes(inputs, &id);
            let rsi = (closes.len() > pyramid.rsi_period)
                .then(|| calculate_rsi(&closes, pyramid.rsi_period).last().copied())
                .flatten();

            let addition = match state.ledger.position(&id) {
                Some(position) => pyramid_addition(
                    &PyramidContext {
                        position,
                        price,
                        step: inputs.step,
                        signal: signal.as_ref(),
                        rsi,
                        cash: state.ledger.cash(),
                    },
                    pyramid,
                )
                .map(|notional| (notional, position.pyramid_adds + 1)),
                None => None,
            };

            if let Some((notional, stage)) = addition {
                let regime = self.regime(state, inputs);
                self.admit_and_execute(
                    state,
                    inputs,
                    &id,
                    signal.as_ref(),
                    regime,
                    price,
                    notional,
                    true,
                    &EntryContext {
                        reason: format!("pyramid stage {}", stage),
                        ..EntryContext::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    fn finish(
        &self,
        state: RunState,
        store: &dyn PriceSeriesStore,
        instruments: &[String],
        dates: &[DateTime<Utc>],
        initial_cash: f64,
    ) -> Result<BacktestResult> {
        let start_date = dates[0];
        let end_date = dates[dates.len() - 1];
        let final_equity = state.ledger.total_equity();
        let benchmark_return_pct = benchmark_return_pct(store, instruments, start_date, end_date);

        let RunState {
            ledger,
            snapshots,
            events,
            allocation_changes,
            ..
        } = state;
        let (trade_log, closed_trades, open_positions) = ledger.into_records();

        let performance = PerformanceCalculator::calculate_performance(
            &closed_trades,
            initial_cash,
            final_equity,
            start_date,
            end_date,
            &snapshots,
            benchmark_return_pct,
            self.config.risk_free_rate,
        );
        let per_instrument_stats = PerformanceCalculator::instrument_stats(&closed_trades);

        info!(
            "Backtest finished: equity {:.2} ({:+.2}%, benchmark {:+.2}%), {} trades, max drawdown {:.2}%, {} skipped events",
            final_equity,
            performance.total_return_pct,
            performance.benchmark_return_pct,
            performance.total_trades,
            performance.max_drawdown_pct,
            events.len()
        );

        Ok(BacktestResult {
            id: Uuid::new_v4().to_string(),
            start_date,
            end_date,
            instruments: instruments.to_vec(),
            initial_cash,
            final_equity,
            performance,
            equity_curve: snapshots,
            trade_log,
            closed_trades,
            open_positions,
            events,
            per_instrument_stats,
            allocation_changes,
            created_at: Utc::now(),
        })
    }
}

/// Bull when scores are high and confirmed uptrends are broad, bear for the mirror case.
fn classify_regime(signals: &[Signal], config: &BacktestConfig) -> MarketRegime {
    if signals.is_empty() {
        return MarketRegime::Range;
    }
    let count = signals.len() as f64;
    let avg_score = signals.iter().map(|s| s.score).sum::<f64>() / count;
    let uptrend_share = signals
        .iter()
        .filter(|s| s.trend.is_confirmed_uptrend())
        .count() as f64
        / count;
    let downtrend_share = signals
        .iter()
        .filter(|s| s.trend.confirmed && s.trend.direction == TrendDirection::Downtrend)
        .count() as f64
        / count;

    let regime = &config.regime;
    if avg_score >= regime.bull_min_avg_score && uptrend_share >= regime.bull_min_uptrend_share {
        MarketRegime::Bull
    } else if avg_score <= regime.bear_max_avg_score
        && downtrend_share >= regime.bear_min_downtrend_share
    {
        MarketRegime::Bear
    } else {
        MarketRegime::Range
    }
}

/// Equal-weight buy-and-hold return of the universe over `[start, end]`, in percent.
fn benchmark_return_pct(
    store: &dyn PriceSeriesStore,
    instruments: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    let returns: Vec<f64> = instruments
        .iter()
        .filter_map(|id| {
            let bars = store.history(id, end, usize::MAX);
            let first = bars.iter().find(|bar| bar.date >= start)?;
            let last = bars.last()?;
            (first.close > 0.0).then(|| last.close / first.close - 1.0)
        })
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().sum::<f64>() / returns.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_context::MarketData;
    use chrono::{Duration, TimeZone};

    struct FixedProvider {
        action: SignalAction,
        score: f64,
    }

    impl SignalProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn evaluate(&self, _instrument: &str, _history: &[Bar]) -> Option<Signal> {
            Some(Signal {
                action: self.action,
                score: self.score,
                confidence: 0.8,
                phase: MarketPhase::Unknown,
                trend: TrendInfo {
                    direction: TrendDirection::Uptrend,
                    confirmed: self.score > 0.0,
                    slope: 0.01,
                    duration_periods: 10,
                },
            })
        }

        fn min_history(&self) -> usize {
            1
        }
    }

    fn create_date(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    fn market(series: &[(&str, &[f64])]) -> MarketData {
        let bars = series
            .iter()
            .flat_map(|(id, closes)| {
                closes.iter().enumerate().map(move |(i, &close)| Bar {
                    instrument: id.to_string(),
                    date: create_date(i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1_000.0,
                    amount: 0.0,
                    turnover: 0.0,
                })
            })
            .collect();
        MarketData::from_bars(bars).unwrap()
    }

    fn signal_with(score: f64, direction: TrendDirection) -> Signal {
        Signal {
            action: SignalAction::Hold,
            score,
            confidence: 0.5,
            phase: MarketPhase::Unknown,
            trend: TrendInfo {
                direction,
                confirmed: true,
                slope: 0.0,
                duration_periods: 5,
            },
        }
    }

    #[test]
    fn regime_follows_breadth_and_average_score() {
        let config = BacktestConfig::default();
        let bull = vec![
            signal_with(3.0, TrendDirection::Uptrend),
            signal_with(1.0, TrendDirection::Uptrend),
            signal_with(0.0, TrendDirection::Sideways),
        ];
        assert_eq!(classify_regime(&bull, &config), MarketRegime::Bull);

        let bear = vec![
            signal_with(-3.0, TrendDirection::Downtrend),
            signal_with(-1.0, TrendDirection::Downtrend),
        ];
        assert_eq!(classify_regime(&bear, &config), MarketRegime::Bear);

        let mixed = vec![
            signal_with(3.0, TrendDirection::Uptrend),
            signal_with(-3.0, TrendDirection::Downtrend),
        ];
        assert_eq!(classify_regime(&mixed, &config), MarketRegime::Range);
        assert_eq!(classify_regime(&[], &config), MarketRegime::Range);
    }

    #[test]
    fn benchmark_is_equal_weighted_within_window() {
        let data = market(&[("AAA", &[10.0, 11.0, 12.0]), ("BBB", &[20.0, 20.0, 18.0])]);
        let instruments = vec!["AAA".to_string(), "BBB".to_string()];
        let pct = benchmark_return_pct(&data, &instruments, create_date(1), create_date(2));
        // AAA 12/11 - 1, BBB 18/20 - 1
        let expected = ((12.0 / 11.0 - 1.0) + (18.0 / 20.0 - 1.0)) / 2.0 * 100.0;
        assert!((pct - expected).abs() < 1e-9);
    }

    #[test]
    fn rejects_empty_window() {
        let data = market(&[("AAA", &[10.0, 11.0])]);
        let engine = Engine::new(BacktestConfig::default());
        let provider = FixedProvider {
            action: SignalAction::Hold,
            score: 0.0,
        };
        let result = engine.run(
            &data,
            &provider,
            &["AAA".to_string()],
            create_date(10),
            create_date(20),
            100_000.0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn strong_buy_is_entered_and_liquidated_at_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let closes: Vec<f64> = (0..10).map(|i| 10.0 + i as f64 * 0.1).collect();
        let data = market(&[("AAA", &closes)]);
        let engine = Engine::new(BacktestConfig::default());
        let provider = FixedProvider {
            action: SignalAction::StrongBuy,
            score: 5.0,
        };
        let result = engine
            .run(
                &data,
                &provider,
                &["AAA".to_string()],
                create_date(0),
                create_date(9),
                100_000.0,
            )
            .unwrap();

        assert_eq!(result.equity_curve.len(), 10);
        assert!(result.trade_log.first().map(|f| f.direction) == Some(TradeDirection::Buy));
        assert!(result.open_positions.is_empty());
        assert_eq!(
            result.closed_trades.last().map(|t| t.exit_kind),
            Some(ExitKind::EndOfBacktest)
        );
        let last = result.equity_curve.last().unwrap();
        assert!((last.total_equity - result.final_equity).abs() < 1e-9);
        assert_eq!(last.open_positions, 0);
    }

    #[test]
    fn missing_bar_for_held_position_is_recorded() {
        let data = {
            let mut bars = Vec::new();
            for day in [0_i64, 1, 3, 4] {
                bars.push(Bar {
                    instrument: "AAA".to_string(),
                    date: create_date(day),
                    open: 10.0,
                    high: 10.0,
                    low: 10.0,
                    close: 10.0,
                    volume: 1.0,
                    amount: 0.0,
                    turnover: 0.0,
                });
            }
            for day in 0..5_i64 {
                bars.push(Bar {
                    instrument: "BBB".to_string(),
                    date: create_date(day),
                    open: 10.0,
                    high: 10.0,
                    low: 10.0,
                    close: 10.0,
                    volume: 1.0,
                    amount: 0.0,
                    turnover: 0.0,
                });
            }
            MarketData::from_bars(bars).unwrap()
        };
        let engine = Engine::new(BacktestConfig::default());
        let provider = FixedProvider {
            action: SignalAction::StrongBuy,
            score: 5.0,
        };
        let result = engine
            .run(
                &data,
                &provider,
                &["AAA".to_string(), "BBB".to_string()],
                create_date(0),
                create_date(4),
                100_000.0,
            )
            .unwrap();

        assert_eq!(result.equity_curve.len(), 5);
        assert!(result
            .events
            .iter()
            .any(|e| e.instrument == "AAA"
                && e.reason == SkipReason::MissingBar
                && e.date == create_date(2)));
    }
}
