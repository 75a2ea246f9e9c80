use crate::models::SignalAction;

pub const STRONG_SIGNAL_SCORE: f64 = 4.0;
pub const SIGNAL_SCORE: f64 = 1.5;

/// Map a composite score onto the five-level action scale
pub fn action_from_score(score: f64) -> SignalAction {
    if score >= STRONG_SIGNAL_SCORE {
        SignalAction::StrongBuy
    } else if score >= SIGNAL_SCORE {
        SignalAction::Buy
    } else if score <= -STRONG_SIGNAL_SCORE {
        SignalAction::StrongSell
    } else if score <= -SIGNAL_SCORE {
        SignalAction::Sell
    } else {
        SignalAction::Hold
    }
}

pub fn confidence_from_score(score: f64, full_confidence_score: f64) -> f64 {
    if full_confidence_score <= 0.0 || !score.is_finite() {
        return 0.0;
    }
    (score.abs() / full_confidence_score).clamp(0.0, 1.0)
}

/// Count trailing values that satisfy `predicate`
pub fn trailing_run<F>(values: &[f64], mut predicate: F) -> usize
where
    F: FnMut(usize, f64) -> bool,
{
    values
        .iter()
        .enumerate()
        .rev()
        .take_while(|(i, v)| predicate(*i, **v))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_thresholds() {
        assert_eq!(action_from_score(5.0), SignalAction::StrongBuy);
        assert_eq!(action_from_score(2.0), SignalAction::Buy);
        assert_eq!(action_from_score(0.0), SignalAction::Hold);
        assert_eq!(action_from_score(-2.0), SignalAction::Sell);
        assert_eq!(action_from_score(-4.0), SignalAction::StrongSell);
    }

    #[test]
    fn trailing_run_stops_at_first_miss() {
        let values = [1.0, 5.0, 2.0, 3.0, 4.0];
        assert_eq!(trailing_run(&values, |_, v| v > 1.5), 3);
        assert_eq!(trailing_run(&values, |_, v| v > 10.0), 0);
    }
}
