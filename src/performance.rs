use crate::models::*;
use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

const PERIODS_PER_YEAR: f64 = 252.0;
const HEAVY_POSITION_WEIGHT: f64 = 0.70;

struct DrawdownInfo {
    max_drawdown: f64,
    max_drawdown_percent: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_performance(
        closed_trades: &[ClosedTrade],
        initial_cash: f64,
        final_equity: f64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        snapshots: &[Snapshot],
        benchmark_return_pct: f64,
        risk_free_rate: f64,
    ) -> PortfolioPerformance {
        let total_trades = closed_trades.len();
        let mut winning_percents = Vec::new();
        let mut losing_percents = Vec::new();
        let mut gross_profit = 0.0;
        let mut gross_loss = 0.0;

        for trade in closed_trades {
            if trade.pnl > 0.0 {
                winning_percents.push(trade.return_pct);
                gross_profit += trade.pnl;
            } else if trade.pnl < 0.0 {
                losing_percents.push(trade.return_pct);
                gross_loss += -trade.pnl;
            }
        }
        let winning_trades = winning_percents.len();
        let losing_trades = losing_percents.len();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let final_equity = if final_equity.is_finite() {
            final_equity
        } else {
            snapshots
                .last()
                .map(|s| s.total_equity)
                .unwrap_or(initial_cash)
        };
        let total_return_pct = if initial_cash > 0.0 {
            (final_equity / initial_cash - 1.0) * 100.0
        } else {
            0.0
        };

        let cagr = Self::calculate_cagr(initial_cash, final_equity, start_date, end_date);
        let returns = Self::period_returns(snapshots);
        let volatility = Self::annualized_volatility(&returns);
        let sharpe_ratio = Self::calculate_sharpe_ratio(&returns, risk_free_rate);
        let sortino_ratio = Self::calculate_sortino_ratio(&returns, risk_free_rate);
        let drawdown_info = Self::calculate_max_drawdown(snapshots);
        let calmar_ratio = Self::calculate_calmar_ratio(cagr, drawdown_info.max_drawdown_percent);

        let holding: Vec<f64> = closed_trades
            .iter()
            .map(|t| t.holding_periods as f64)
            .collect();
        let (max_consecutive_wins, max_consecutive_losses) = Self::streaks(closed_trades);

        let periods = snapshots.len().max(1) as f64;
        let avg_position_count =
            snapshots.iter().map(|s| s.open_positions as f64).sum::<f64>() / periods;
        let avg_invested_ratio = snapshots.iter().map(|s| s.invested_ratio).sum::<f64>() / periods;
        let cash_periods = snapshots.iter().filter(|s| s.open_positions == 0).count();
        let multi_periods = snapshots.iter().filter(|s| s.open_positions >= 2).count();
        let heavy_periods = snapshots
            .iter()
            .filter(|s| s.max_position_weight > HEAVY_POSITION_WEIGHT)
            .count();

        PortfolioPerformance {
            total_return_pct,
            annual_return_pct: cagr * 100.0,
            benchmark_return_pct,
            excess_return_pct: total_return_pct - benchmark_return_pct,
            volatility_pct: volatility * 100.0,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            max_drawdown: drawdown_info.max_drawdown,
            max_drawdown_pct: drawdown_info.max_drawdown_percent,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            avg_win_pct: Self::average(&winning_percents),
            avg_loss_pct: Self::average(&losing_percents),
            profit_factor,
            avg_holding_periods: Self::average(&holding),
            max_consecutive_wins,
            max_consecutive_losses,
            avg_position_count,
            avg_invested_ratio,
            cash_period_ratio: cash_periods as f64 / periods,
            multi_position_ratio: multi_periods as f64 / periods,
            heavy_position_ratio: heavy_periods as f64 / periods,
        }
    }

    pub fn instrument_stats(closed_trades: &[ClosedTrade]) -> BTreeMap<String, InstrumentStats> {
        let mut grouped: BTreeMap<String, Vec<&ClosedTrade>> = BTreeMap::new();
        for trade in closed_trades {
            grouped
                .entry(trade.instrument.clone())
                .or_default()
                .push(trade);
        }

        grouped
            .into_iter()
            .map(|(instrument, trades)| {
                let count = trades.len();
                let winning = trades.iter().filter(|t| t.pnl > 0.0).count();
                let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
                let holding: Vec<f64> = trades.iter().map(|t| t.holding_periods as f64).collect();
                let weights: Vec<f64> = trades.iter().map(|t| t.entry_weight).collect();
                let stats = InstrumentStats {
                    trades: count,
                    winning_trades: winning,
                    win_rate: if count > 0 {
                        winning as f64 / count as f64
                    } else {
                        0.0
                    },
                    total_pnl: trades.iter().map(|t| t.pnl).sum(),
                    avg_return_pct: Self::average(&returns),
                    avg_holding_periods: Self::average(&holding),
                    avg_entry_weight: Self::average(&weights),
                };
                (instrument, stats)
            })
            .collect()
    }

    fn calculate_cagr(
        initial_cash: f64,
        final_equity: f64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> f64 {
        if initial_cash <= 0.0 || !final_equity.is_finite() {
            return 0.0;
        }

        if end_date <= start_date {
            return 0.0;
        }

        let duration = end_date - start_date;
        let years = duration.num_seconds() as f64 / (365.25_f64 * 24.0 * 60.0 * 60.0);

        if years <= 0.0 {
            return 0.0;
        }

        let total_return_ratio = final_equity / initial_cash;
        if total_return_ratio <= 0.0 {
            return -1.0;
        }

        total_return_ratio.powf(1.0 / years) - 1.0
    }

    fn average(values: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values.iter().copied() {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    fn period_returns(snapshots: &[Snapshot]) -> Vec<f64> {
        snapshots
            .windows(2)
            .map(|window| {
                let prev_value = window[0].total_equity;
                let curr_value = window[1].total_equity;
                if prev_value > 0.0 {
                    (curr_value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn annualized_volatility(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let std_dev = returns.std_dev();
        if !std_dev.is_finite() {
            return 0.0;
        }
        std_dev * PERIODS_PER_YEAR.sqrt()
    }

    pub fn calculate_sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }

        let mean_return = returns.mean();
        let std_dev = returns.std_dev();

        if std_dev == 0.0 || !std_dev.is_finite() {
            return 0.0;
        }

        let annualized_return = mean_return * PERIODS_PER_YEAR;
        let annualized_volatility = std_dev * PERIODS_PER_YEAR.sqrt();

        (annualized_return - risk_free_rate) / annualized_volatility
    }

    /// Like Sharpe, but only the dispersion of negative returns counts as risk.
    pub fn calculate_sortino_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if returns.len() < 2 || downside.len() < 2 {
            return 0.0;
        }
        let downside_std = downside.std_dev();
        if downside_std == 0.0 || !downside_std.is_finite() {
            return 0.0;
        }
        let annualized_return = returns.mean() * PERIODS_PER_YEAR;
        (annualized_return - risk_free_rate) / (downside_std * PERIODS_PER_YEAR.sqrt())
    }

    fn calculate_calmar_ratio(cagr: f64, max_drawdown_percent: f64) -> f64 {
        if !cagr.is_finite() || !max_drawdown_percent.is_finite() {
            return 0.0;
        }

        let drawdown_ratio = (max_drawdown_percent / 100.0).abs();
        if drawdown_ratio <= f64::EPSILON {
            return 0.0;
        }

        cagr / drawdown_ratio
    }

    fn calculate_max_drawdown(snapshots: &[Snapshot]) -> DrawdownInfo {
        if snapshots.is_empty() {
            return DrawdownInfo {
                max_drawdown: 0.0,
                max_drawdown_percent: 0.0,
            };
        }

        let mut max_drawdown = 0.0;
        let mut max_drawdown_percent = 0.0;
        let mut peak_value = snapshots[0].total_equity;

        for snapshot in snapshots {
            if snapshot.total_equity > peak_value {
                peak_value = snapshot.total_equity;
            } else {
                let drawdown = peak_value - snapshot.total_equity;
                let drawdown_percent = if peak_value > 0.0 {
                    (drawdown / peak_value) * 100.0
                } else {
                    0.0
                };

                if drawdown > max_drawdown {
                    max_drawdown = drawdown;
                }
                if drawdown_percent > max_drawdown_percent {
                    max_drawdown_percent = drawdown_percent;
                }
            }
        }

        DrawdownInfo {
            max_drawdown,
            max_drawdown_percent,
        }
    }

    fn streaks(closed_trades: &[ClosedTrade]) -> (usize, usize) {
        let mut max_wins = 0;
        let mut max_losses = 0;
        let mut wins = 0;
        let mut losses = 0;
        for trade in closed_trades {
            if trade.pnl > 0.0 {
                wins += 1;
                losses = 0;
            } else {
                losses += 1;
                wins = 0;
            }
            max_wins = max_wins.max(wins);
            max_losses = max_losses.max(losses);
        }
        (max_wins, max_losses)
    }
}
