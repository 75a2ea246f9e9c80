use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::ExecutionConfig;
use crate::models::{
    ClosedTrade, EntryContext, ExitKind, Fill, Position, SkipReason, Snapshot, TradeDirection,
};
use crate::trading_rules::{
    commission_for, sell_fill_price, shares_for_ratio, size_buy_order, PositionSizingOutcome,
    PRICE_EPSILON,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger invariant violated on {date} for {instrument}: {invariant} (state: {state})")]
    InvariantViolation {
        date: DateTime<Utc>,
        instrument: String,
        invariant: String,
        state: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Filled(Fill),
    Rejected {
        reason: SkipReason,
        details: Option<String>,
    },
}

/// Cash plus the open positions it exclusively owns. Every mutation re-checks the invariants.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    cash: f64,
    positions: BTreeMap<String, Position>,
    #[serde(skip)]
    trade_log: Vec<Fill>,
    #[serde(skip)]
    closed_trades: Vec<ClosedTrade>,
    #[serde(skip)]
    execution: ExecutionConfig,
    #[serde(skip)]
    next_trade_id: u64,
}

impl Ledger {
    pub fn new(initial_cash: f64, execution: ExecutionConfig) -> Self {
        Self {
            cash: initial_cash,
            positions: BTreeMap::new(),
            trade_log: Vec::new(),
            closed_trades: Vec::new(),
            execution,
            next_trade_id: 1,
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn position(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn is_held(&self, instrument: &str) -> bool {
        self.positions.contains_key(instrument)
    }

    pub fn held_instruments(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn trade_log(&self) -> &[Fill] {
        &self.trade_log
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn positions_value(&self) -> f64 {
        self.positions.values().map(Position::market_value).sum()
    }

    pub fn total_equity(&self) -> f64 {
        self.cash + self.positions_value()
    }

    /// Σ market value / Σ cost − 1 over the whole book.
    pub fn aggregate_return(&self) -> Option<f64> {
        let cost: f64 = self.positions.values().map(Position::cost_value).sum();
        if self.positions.is_empty() || cost <= 0.0 {
            return None;
        }
        Some(self.positions_value() / cost - 1.0)
    }

    /// Updates the mark, the highest price seen and the peak return.
    pub fn mark(&mut self, instrument: &str, price: f64) {
        if let Some(position) = self.positions.get_mut(instrument) {
            if !price.is_finite() || price <= 0.0 {
                return;
            }
            position.mark_price = price;
            if price > position.highest_price {
                position.highest_price = price;
            }
            let unrealized = position.unrealized_return_at(price);
            if unrealized > position.peak_return {
                position.peak_return = unrealized;
            }
        }
    }

    pub fn open(
        &mut self,
        instrument: &str,
        date: DateTime<Utc>,
        step: usize,
        price: f64,
        desired_notional: f64,
        entry: &EntryContext,
    ) -> Result<EntryOutcome, LedgerError> {
        if self.positions.contains_key(instrument) {
            return Ok(EntryOutcome::Rejected {
                reason: SkipReason::AlreadyHeld,
                details: None,
            });
        }

        let order = match size_buy_order(price, desired_notional, self.cash, &self.execution) {
            PositionSizingOutcome::Sized(order) => order,
            other => return Ok(sizing_rejection(other)),
        };

        self.cash -= order.notional + order.commission;
        let trade_id = self.next_trade_id;
        self.next_trade_id += 1;

        let position = Position {
            trade_id,
            instrument: instrument.to_string(),
            shares: order.shares,
            cost_basis: order.fill_price,
            entry_date: date,
            entry_step: step,
            highest_price: price,
            peak_return: (price - order.fill_price) / order.fill_price,
            pyramid_adds: 0,
            last_add_date: None,
            last_add_step: None,
            partially_exited: false,
            partial_exits: 0,
            mark_price: price,
            invested_capital: order.notional,
            commissions_paid: order.commission,
            realized_pnl: 0.0,
            shares_sold: 0,
            entry_weight: entry.weight,
            entry_score: entry.score,
            entry_phase: entry.phase,
            entry_trend: entry.trend,
        };
        self.positions.insert(instrument.to_string(), position);

        let fill = Fill {
            date,
            instrument: instrument.to_string(),
            direction: TradeDirection::Buy,
            price: order.fill_price,
            shares: order.shares,
            gross_amount: order.notional,
            commission: order.commission,
            reason: entry.reason.clone(),
            realized_pnl: None,
        };
        debug!(
            "{} open {} x {} @ {:.4} ({})",
            date.format("%Y-%m-%d"),
            instrument,
            fill.shares,
            fill.price,
            fill.reason
        );
        self.trade_log.push(fill.clone());
        self.check_invariants(date, instrument)?;
        Ok(EntryOutcome::Filled(fill))
    }

    pub fn add(
        &mut self,
        instrument: &str,
        date: DateTime<Utc>,
        step: usize,
        price: f64,
        desired_notional: f64,
        reason: &str,
    ) -> Result<EntryOutcome, LedgerError> {
        if !self.positions.contains_key(instrument) {
            return Ok(EntryOutcome::Rejected {
                reason: SkipReason::NoOpenPosition,
                details: None,
            });
        }

        let order = match size_buy_order(price, desired_notional, self.cash, &self.execution) {
            PositionSizingOutcome::Sized(order) => order,
            other => return Ok(sizing_rejection(other)),
        };

        self.cash -= order.notional + order.commission;
        if let Some(position) = self.positions.get_mut(instrument) {
            let total_shares = position.shares + order.shares;
            position.cost_basis = (position.shares as f64 * position.cost_basis
                + order.shares as f64 * order.fill_price)
                / total_shares as f64;
            position.shares = total_shares;
            position.pyramid_adds += 1;
            position.last_add_date = Some(date);
            position.last_add_step = Some(step);
            position.invested_capital += order.notional;
            position.commissions_paid += order.commission;
            position.mark_price = price;
            if price > position.highest_price {
                position.highest_price = price;
            }
        }

        let fill = Fill {
            date,
            instrument: instrument.to_string(),
            direction: TradeDirection::Buy,
            price: order.fill_price,
            shares: order.shares,
            gross_amount: order.notional,
            commission: order.commission,
            reason: reason.to_string(),
            realized_pnl: None,
        };
        debug!(
            "{} add {} x {} @ {:.4} ({})",
            date.format("%Y-%m-%d"),
            instrument,
            fill.shares,
            fill.price,
            fill.reason
        );
        self.trade_log.push(fill.clone());
        self.check_invariants(date, instrument)?;
        Ok(EntryOutcome::Filled(fill))
    }

    /// Sells `ratio` of the holding. A full close removes the position and records the round trip.
    #[allow(clippy::too_many_arguments)]
    pub fn close(
        &mut self,
        instrument: &str,
        date: DateTime<Utc>,
        step: usize,
        price: f64,
        ratio: f64,
        kind: ExitKind,
        reason: &str,
    ) -> Result<Fill, LedgerError> {
        if !ratio.is_finite() || ratio <= 0.0 || ratio > 1.0 + PRICE_EPSILON {
            return Err(self.violation(
                date,
                instrument,
                format!("exit ratio must be in (0, 1] (value: {})", ratio),
            ));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(self.violation(
                date,
                instrument,
                format!("exit price must be positive (value: {})", price),
            ));
        }
        let lot_size = self.execution.lot_size;
        let slippage_rate = self.execution.slippage_rate;
        let Some(position) = self.positions.get_mut(instrument) else {
            return Err(self.violation(
                date,
                instrument,
                "close of a non-existent position".to_string(),
            ));
        };

        let shares = shares_for_ratio(position.shares, ratio, lot_size);
        let fill_price = sell_fill_price(price, slippage_rate);
        let gross_amount = shares as f64 * fill_price;
        let commission = commission_for(gross_amount, &self.execution);
        let gross_realized = (fill_price - position.cost_basis) * shares as f64;

        position.shares -= shares;
        position.shares_sold += shares;
        position.realized_pnl += gross_realized;
        position.commissions_paid += commission;
        position.mark_price = price;
        self.cash += gross_amount - commission;

        let fill = Fill {
            date,
            instrument: instrument.to_string(),
            direction: TradeDirection::Sell,
            price: fill_price,
            shares,
            gross_amount,
            commission,
            reason: format!("{}: {}", kind.as_str(), reason),
            realized_pnl: Some(gross_realized - commission),
        };

        if position.shares == 0 {
            if let Some(closed) = self.positions.remove(instrument) {
                let trade = closed_trade(&closed, date, step, fill_price, kind, reason);
                debug!(
                    "{} close {} pnl {:.2} ({:.2}%) via {}",
                    date.format("%Y-%m-%d"),
                    instrument,
                    trade.pnl,
                    trade.return_pct,
                    kind.as_str()
                );
                self.closed_trades.push(trade);
            }
        } else {
            position.partially_exited = true;
            position.partial_exits += 1;
            debug!(
                "{} reduce {} by {} shares via {}",
                date.format("%Y-%m-%d"),
                instrument,
                shares,
                kind.as_str()
            );
        }

        self.trade_log.push(fill.clone());
        self.check_invariants(date, instrument)?;
        Ok(fill)
    }

    pub fn snapshot(&self, date: DateTime<Utc>) -> Snapshot {
        let positions_value = self.positions_value();
        let total_equity = self.cash + positions_value;
        let (invested_ratio, max_position_weight) = if total_equity > 0.0 {
            let max_value = self
                .positions
                .values()
                .map(Position::market_value)
                .fold(0.0_f64, f64::max);
            (positions_value / total_equity, max_value / total_equity)
        } else {
            (0.0, 0.0)
        };
        Snapshot {
            date,
            cash: self.cash,
            positions_value,
            total_equity,
            open_positions: self.positions.len(),
            invested_ratio,
            max_position_weight,
        }
    }

    pub fn check_invariants(
        &self,
        date: DateTime<Utc>,
        instrument: &str,
    ) -> Result<(), LedgerError> {
        if !self.cash.is_finite() || self.cash < -PRICE_EPSILON {
            return Err(self.violation(
                date,
                instrument,
                format!("cash must not be negative (cash: {:.6})", self.cash),
            ));
        }
        let lot = self.execution.lot_size.max(1);
        for (id, position) in &self.positions {
            if position.shares <= 0 {
                return Err(self.violation(
                    date,
                    id,
                    format!("open position must hold shares (shares: {})", position.shares),
                ));
            }
            if position.shares % lot != 0 {
                return Err(self.violation(
                    date,
                    id,
                    format!(
                        "shares must be whole lots (shares: {}, lot: {})",
                        position.shares, lot
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn state_dump(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|err| format!("<ledger state unavailable: {}>", err))
    }

    fn violation(&self, date: DateTime<Utc>, instrument: &str, invariant: String) -> LedgerError {
        let state = self.state_dump();
        error!(
            "Ledger invariant violated on {} for {}: {}. State: {}",
            date.format("%Y-%m-%d"),
            instrument,
            invariant,
            state
        );
        LedgerError::InvariantViolation {
            date,
            instrument: instrument.to_string(),
            invariant,
            state,
        }
    }

    pub fn into_records(self) -> (Vec<Fill>, Vec<ClosedTrade>, Vec<Position>) {
        (
            self.trade_log,
            self.closed_trades,
            self.positions.into_values().collect(),
        )
    }
}

fn sizing_rejection(outcome: PositionSizingOutcome) -> EntryOutcome {
    match outcome {
        PositionSizingOutcome::TooSmall { notional } => EntryOutcome::Rejected {
            reason: SkipReason::BelowMinimumNotional,
            details: Some(format!("notional {:.2}", notional)),
        },
        PositionSizingOutcome::InsufficientCash {
            required,
            available,
        } => EntryOutcome::Rejected {
            reason: SkipReason::InsufficientCash,
            details: Some(format!("required {:.2}, available {:.2}", required, available)),
        },
        PositionSizingOutcome::Sized(_) => EntryOutcome::Rejected {
            reason: SkipReason::BelowMinimumNotional,
            details: None,
        },
    }
}

fn closed_trade(
    position: &Position,
    exit_date: DateTime<Utc>,
    step: usize,
    exit_price: f64,
    kind: ExitKind,
    reason: &str,
) -> ClosedTrade {
    let pnl = position.realized_pnl - position.commissions_paid;
    let return_pct = if position.invested_capital > 0.0 {
        pnl / position.invested_capital * 100.0
    } else {
        0.0
    };
    ClosedTrade {
        trade_id: position.trade_id,
        instrument: position.instrument.clone(),
        entry_date: position.entry_date,
        exit_date,
        cost_basis: position.cost_basis,
        exit_price,
        shares: position.shares_sold,
        pnl,
        return_pct,
        holding_periods: position.held_periods(step),
        exit_kind: kind,
        exit_reason: reason.to_string(),
        pyramid_adds: position.pyramid_adds,
        partial_exits: position.partial_exits,
        peak_return_pct: position.peak_return * 100.0,
        entry_weight: position.entry_weight,
        entry_score: position.entry_score,
        entry_phase: position.entry_phase,
        entry_trend: position.entry_trend,
    }
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

    fn frictionless() -> ExecutionConfig {
        ExecutionConfig {
            slippage_rate: 0.0,
            commission_rate: 0.0,
            min_commission: 0.0,
            lot_size: 100,
            min_trade_notional: 0.0,
        }
    }

    fn realistic() -> ExecutionConfig {
        ExecutionConfig {
            slippage_rate: 0.001,
            commission_rate: 0.0003,
            min_commission: 5.0,
            lot_size: 100,
            min_trade_notional: 1000.0,
        }
    }

    fn entry() -> EntryContext {
        EntryContext {
            weight: 0.5,
            score: 3.0,
            reason: "test entry".to_string(),
            ..Default::default()
        }
    }

    fn expect_fill(outcome: EntryOutcome) -> Fill {
        match outcome {
            EntryOutcome::Filled(fill) => fill,
            other => panic!("expected fill, got {:?}", other),
        }
    }

    #[test]
    fn open_deducts_notional_and_commission() {
        let mut ledger = Ledger::new(100_000.0, realistic());
        let fill = expect_fill(
            ledger
                .open("AAA", create_date(0), 0, 10.0, 50_000.0, &entry())
                .unwrap(),
        );
        assert_eq!(fill.shares % 100, 0);
        assert!((fill.price - 10.01).abs() < 1e-9);
        let expected_cash = 100_000.0 - fill.gross_amount - fill.commission;
        assert!((ledger.cash() - expected_cash).abs() < 1e-9);
        let position = ledger.position("AAA").unwrap();
        assert!((position.cost_basis - 10.01).abs() < 1e-9);
        assert_eq!(ledger.trade_log().len(), 1);
    }

    #[test]
    fn open_rejects_small_orders_and_duplicates() {
        let mut ledger = Ledger::new(100_000.0, realistic());
        let outcome = ledger
            .open("AAA", create_date(0), 0, 10.0, 500.0, &entry())
            .unwrap();
        assert!(matches!(
            outcome,
            EntryOutcome::Rejected {
                reason: SkipReason::BelowMinimumNotional,
                ..
            }
        ));
        expect_fill(
            ledger
                .open("AAA", create_date(0), 0, 10.0, 5_000.0, &entry())
                .unwrap(),
        );
        let again = ledger
            .open("AAA", create_date(1), 1, 10.0, 5_000.0, &entry())
            .unwrap();
        assert!(matches!(
            again,
            EntryOutcome::Rejected {
                reason: SkipReason::AlreadyHeld,
                ..
            }
        ));
    }

    #[test]
    fn open_rejects_when_cash_is_short() {
        let mut ledger = Ledger::new(1_000.0, realistic());
        let outcome = ledger
            .open("AAA", create_date(0), 0, 10.0, 5_000.0, &entry())
            .unwrap();
        assert!(matches!(
            outcome,
            EntryOutcome::Rejected {
                reason: SkipReason::InsufficientCash,
                ..
            }
        ));
        assert!((ledger.cash() - 1_000.0).abs() < 1e-12);
        assert!(ledger.trade_log().is_empty());
    }

    #[test]
    fn add_to_missing_position_is_rejected() {
        let mut ledger = Ledger::new(100_000.0, frictionless());
        let outcome = ledger
            .add("AAA", create_date(0), 0, 10.0, 5_000.0, "pyramid")
            .unwrap();
        assert!(matches!(
            outcome,
            EntryOutcome::Rejected {
                reason: SkipReason::NoOpenPosition,
                ..
            }
        ));
    }

    #[test]
    fn cost_basis_is_weighted_average_after_random_additions() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut ledger = Ledger::new(10_000_000.0, realistic());
            let mut total_shares = 0i64;
            let mut total_cost = 0.0;
            let first_price = rng.gen_range(5.0..50.0);
            let fill = expect_fill(
                ledger
                    .open("AAA", create_date(0), 0, first_price, 100_000.0, &entry())
                    .unwrap(),
            );
            total_shares += fill.shares;
            total_cost += fill.shares as f64 * fill.price;

            let additions = rng.gen_range(1..6);
            for step in 1..=additions {
                let price = rng.gen_range(5.0..50.0);
                let notional = rng.gen_range(2_000.0..80_000.0);
                if let EntryOutcome::Filled(fill) = ledger
                    .add("AAA", create_date(step), step as usize, price, notional, "add")
                    .unwrap()
                {
                    total_shares += fill.shares;
                    total_cost += fill.shares as f64 * fill.price;
                }
            }

            let position = ledger.position("AAA").unwrap();
            assert_eq!(position.shares, total_shares);
            let expected = total_cost / total_shares as f64;
            assert!(
                (position.cost_basis - expected).abs() < 1e-9,
                "cost basis {} expected {}",
                position.cost_basis,
                expected
            );
        }
    }

    #[test]
    fn partial_close_keeps_cost_basis_and_sets_flag() {
        let mut ledger = Ledger::new(100_000.0, frictionless());
        expect_fill(
            ledger
                .open("AAA", create_date(0), 0, 10.0, 10_000.0, &entry())
                .unwrap(),
        );
        let fill = ledger
            .close("AAA", create_date(3), 3, 9.0, 0.5, ExitKind::PartialStop, "first stage")
            .unwrap();
        assert_eq!(fill.shares, 500);
        assert!((fill.realized_pnl.unwrap() + 500.0).abs() < 1e-9);
        let position = ledger.position("AAA").unwrap();
        assert_eq!(position.shares, 500);
        assert!(position.partially_exited);
        assert!((position.cost_basis - 10.0).abs() < 1e-12);
        assert!(ledger.closed_trades().is_empty());
    }

    #[test]
    fn full_close_pnl_matches_cash_change() {
        let mut ledger = Ledger::new(100_000.0, realistic());
        expect_fill(
            ledger
                .open("AAA", create_date(0), 0, 10.0, 30_000.0, &entry())
                .unwrap(),
        );
        expect_fill(
            ledger
                .add("AAA", create_date(2), 2, 11.0, 10_000.0, "pyramid")
                .unwrap(),
        );
        ledger
            .close("AAA", create_date(4), 4, 12.0, 0.5, ExitKind::TakeProfit, "half")
            .unwrap();
        ledger
            .close("AAA", create_date(6), 6, 12.5, 1.0, ExitKind::TakeProfit, "rest")
            .unwrap();

        assert!(ledger.positions().is_empty());
        let trade = &ledger.closed_trades()[0];
        assert!((trade.pnl - (ledger.cash() - 100_000.0)).abs() < 1e-6);
        assert_eq!(trade.holding_periods, 6);
        assert_eq!(trade.pyramid_adds, 1);
        assert_eq!(trade.partial_exits, 1);
        let cash_from_log: f64 = ledger.trade_log().iter().map(Fill::cash_delta).sum();
        assert!((100_000.0 + cash_from_log - ledger.cash()).abs() < 1e-6);
    }

    #[test]
    fn closing_missing_position_is_fatal() {
        let mut ledger = Ledger::new(100_000.0, frictionless());
        let err = ledger
            .close("ZZZ", create_date(0), 0, 10.0, 1.0, ExitKind::StopLoss, "stop")
            .unwrap_err();
        let LedgerError::InvariantViolation {
            instrument,
            invariant,
            state,
            ..
        } = err;
        assert_eq!(instrument, "ZZZ");
        assert!(invariant.contains("non-existent"));
        assert!(state.contains("cash"));
    }

    #[test]
    fn invalid_ratio_is_fatal() {
        let mut ledger = Ledger::new(100_000.0, frictionless());
        expect_fill(
            ledger
                .open("AAA", create_date(0), 0, 10.0, 10_000.0, &entry())
                .unwrap(),
        );
        assert!(ledger
            .close("AAA", create_date(1), 1, 10.0, 1.5, ExitKind::StopLoss, "bad")
            .is_err());
        assert!(ledger
            .close("AAA", create_date(1), 1, 10.0, 0.0, ExitKind::StopLoss, "bad")
            .is_err());
        assert!(ledger.is_held("AAA"));
    }

    #[test]
    fn mark_tracks_highest_price_and_peak_return() {
        let mut ledger = Ledger::new(100_000.0, frictionless());
        expect_fill(
            ledger
                .open("AAA", create_date(0), 0, 10.0, 10_000.0, &entry())
                .unwrap(),
        );
        ledger.mark("AAA", 12.0);
        ledger.mark("AAA", 11.0);
        let position = ledger.position("AAA").unwrap();
        assert!((position.highest_price - 12.0).abs() < 1e-12);
        assert!((position.peak_return - 0.2).abs() < 1e-12);
        assert!((position.mark_price - 11.0).abs() < 1e-12);
    }

    #[test]
    fn snapshot_is_idempotent_and_satisfies_equity_identity() {
        let mut ledger = Ledger::new(100_000.0, realistic());
        expect_fill(
            ledger
                .open("AAA", create_date(0), 0, 10.0, 30_000.0, &entry())
                .unwrap(),
        );
        expect_fill(
            ledger
                .open("BBB", create_date(0), 0, 25.0, 20_000.0, &entry())
                .unwrap(),
        );
        ledger.mark("AAA", 10.5);

        let first = ledger.snapshot(create_date(1));
        let second = ledger.snapshot(create_date(1));
        assert_eq!(first, second);

        let marked: f64 = ledger
            .positions()
            .values()
            .map(|p| p.shares as f64 * p.mark_price)
            .sum();
        assert!((first.total_equity - (first.cash + marked)).abs() < 1e-9);
        assert_eq!(first.open_positions, 2);
        assert!(first.max_position_weight <= first.invested_ratio + 1e-12);
    }

    #[test]
    fn aggregate_return_is_book_level() {
        let mut ledger = Ledger::new(100_000.0, frictionless());
        assert!(ledger.aggregate_return().is_none());
        expect_fill(
            ledger
                .open("AAA", create_date(0), 0, 10.0, 10_000.0, &entry())
                .unwrap(),
        );
        expect_fill(
            ledger
                .open("BBB", create_date(0), 0, 20.0, 10_000.0, &entry())
                .unwrap(),
        );
        ledger.mark("AAA", 8.0);
        ledger.mark("BBB", 21.0);
        let aggregate = ledger.aggregate_return().unwrap();
        assert!((aggregate - (-0.075)).abs() < 1e-12);
    }
}
