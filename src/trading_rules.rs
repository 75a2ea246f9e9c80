use crate::config::ExecutionConfig;

pub const PRICE_EPSILON: f64 = 1e-6;

pub fn buy_fill_price(price: f64, slippage_rate: f64) -> f64 {
    price * (1.0 + slippage_rate)
}

pub fn sell_fill_price(price: f64, slippage_rate: f64) -> f64 {
    price * (1.0 - slippage_rate)
}

pub fn commission_for(notional: f64, execution: &ExecutionConfig) -> f64 {
    if notional <= 0.0 {
        return 0.0;
    }
    (notional * execution.commission_rate).max(execution.min_commission)
}

/// Largest notional whose commission still fits in `cash`.
pub fn affordable_notional(cash: f64, execution: &ExecutionConfig) -> f64 {
    if cash <= 0.0 || !cash.is_finite() {
        return 0.0;
    }
    let by_rate = cash / (1.0 + execution.commission_rate);
    let by_minimum = cash - execution.min_commission;
    by_rate.min(by_minimum).max(0.0)
}

/// Shares purchasable for `notional`, truncated to whole lots.
pub fn lot_floor_shares(notional: f64, fill_price: f64, lot_size: i64) -> i64 {
    if notional <= 0.0 || fill_price <= 0.0 || !notional.is_finite() || !fill_price.is_finite() {
        return 0;
    }
    let lot = lot_size.max(1);
    let lots = (notional / fill_price / lot as f64 + PRICE_EPSILON).floor();
    (lots.max(0.0) as i64) * lot
}

/// Shares to sell for a fractional exit: lot-floored, at least one lot, never above the holding.
pub fn shares_for_ratio(shares: i64, ratio: f64, lot_size: i64) -> i64 {
    if ratio >= 1.0 - PRICE_EPSILON {
        return shares;
    }
    let lot = lot_size.max(1);
    let raw = (shares as f64 * ratio / lot as f64 + PRICE_EPSILON).floor() as i64 * lot;
    raw.max(lot).min(shares)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSizing {
    pub shares: i64,
    pub fill_price: f64,
    pub notional: f64,
    pub commission: f64,
}

#[derive(Debug, PartialEq)]
pub enum PositionSizingOutcome {
    Sized(OrderSizing),
    TooSmall { notional: f64 },
    InsufficientCash { required: f64, available: f64 },
}

/// Converts a desired notional into a lot-rounded buy order at the slipped price.
pub fn size_buy_order(
    price: f64,
    desired_notional: f64,
    available_cash: f64,
    execution: &ExecutionConfig,
) -> PositionSizingOutcome {
    if price <= 0.0 || !price.is_finite() || !desired_notional.is_finite() {
        return PositionSizingOutcome::TooSmall { notional: 0.0 };
    }

    let fill_price = buy_fill_price(price, execution.slippage_rate);
    let shares = lot_floor_shares(desired_notional, fill_price, execution.lot_size);
    let notional = shares as f64 * fill_price;

    if shares <= 0 || notional + PRICE_EPSILON < execution.min_trade_notional {
        return PositionSizingOutcome::TooSmall { notional };
    }

    let commission = commission_for(notional, execution);
    let required = notional + commission;
    if required > available_cash + PRICE_EPSILON {
        return PositionSizingOutcome::InsufficientCash {
            required,
            available: available_cash,
        };
    }

    PositionSizingOutcome::Sized(OrderSizing {
        shares,
        fill_price,
        notional,
        commission,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> ExecutionConfig {
        ExecutionConfig {
            slippage_rate: 0.001,
            commission_rate: 0.0003,
            min_commission: 5.0,
            lot_size: 100,
            min_trade_notional: 1000.0,
        }
    }

    #[test]
    fn slippage_moves_price_against_the_trader() {
        assert!((buy_fill_price(100.0, 0.001) - 100.1).abs() < 1e-9);
        assert!((sell_fill_price(100.0, 0.001) - 99.9).abs() < 1e-9);
    }

    #[test]
    fn commission_has_a_floor() {
        let exec = execution();
        assert!((commission_for(1000.0, &exec) - 5.0).abs() < 1e-9);
        assert!((commission_for(100_000.0, &exec) - 30.0).abs() < 1e-9);
        assert_eq!(commission_for(0.0, &exec), 0.0);
    }

    #[test]
    fn sizes_in_whole_lots_and_truncates() {
        let exec = execution();
        match size_buy_order(10.0, 25_999.0, 100_000.0, &exec) {
            PositionSizingOutcome::Sized(order) => {
                assert_eq!(order.shares, 2500);
                assert!((order.fill_price - 10.01).abs() < 1e-9);
                assert!((order.notional - 25_025.0).abs() < 1e-6);
                assert!(order.notional <= 25_999.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn rejects_below_minimum_notional() {
        let exec = execution();
        let outcome = size_buy_order(10.0, 900.0, 100_000.0, &exec);
        assert!(matches!(outcome, PositionSizingOutcome::TooSmall { .. }));
    }

    #[test]
    fn rejects_when_commission_does_not_fit() {
        let exec = execution();
        let outcome = size_buy_order(10.0, 10_010.0, 10_010.0, &exec);
        match outcome {
            PositionSizingOutcome::InsufficientCash { required, available } => {
                assert!(required > available);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn affordable_notional_leaves_room_for_commission() {
        let exec = execution();
        let notional = affordable_notional(100_000.0, &exec);
        assert!(notional + commission_for(notional, &exec) <= 100_000.0 + 1e-9);
        assert_eq!(affordable_notional(-5.0, &exec), 0.0);
    }

    #[test]
    fn partial_ratio_keeps_at_least_one_lot() {
        assert_eq!(shares_for_ratio(1000, 0.5, 100), 500);
        assert_eq!(shares_for_ratio(1000, 0.33, 100), 300);
        assert_eq!(shares_for_ratio(100, 0.5, 100), 100);
        assert_eq!(shares_for_ratio(1000, 1.0, 100), 1000);
        assert_eq!(shares_for_ratio(150, 0.01, 100), 100);
    }
}
