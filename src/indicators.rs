pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period == 0 {
        return vec![prices[0]; prices.len()];
    }
    if period == 1 {
        return prices.to_vec();
    }
    if prices.len() < period {
        return vec![prices[0]; prices.len()];
    }

    let mut sma_values = Vec::with_capacity(prices.len());
    for _ in 0..period - 1 {
        sma_values.push(prices[0]);
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values.push(window_sum / period as f64);
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values.push(window_sum / period as f64);
    }

    sma_values
}

/// Mean of the last `period` values, `None` when the series is too short.
pub fn sma_last(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder RSI. Values before the first full period are 50.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period == 0 || prices.len() < period + 1 {
        return vec![50.0; prices.len()];
    }

    let mut rsi_values = vec![50.0; prices.len()];
    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = rsi_from_avgs(avg_gain, avg_loss);
    }

    rsi_values
}

/// Fractional change over the last `lookback` periods.
pub fn period_return(prices: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || prices.len() <= lookback {
        return None;
    }
    let last = *prices.last()?;
    let base = prices[prices.len() - 1 - lookback];
    if base <= 0.0 || !base.is_finite() || !last.is_finite() {
        return None;
    }
    Some(last / base - 1.0)
}

/// Least-squares slope of the last `period` values divided by their mean.
pub fn normalized_slope(values: &[f64], period: usize) -> Option<f64> {
    if period < 2 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let n = period as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = window.iter().sum::<f64>() / n;
    if mean_y.abs() < f64::EPSILON {
        return None;
    }
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, value) in window.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (value - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        return None;
    }
    Some(numerator / denominator / mean_y)
}
