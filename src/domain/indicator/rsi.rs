//! RSI (Relative Strength Index) indicator implementation.
//!
//! Uses Wilder's smoothing for average gain/loss calculation:
//! - First average: simple mean of gains/losses over first n changes
//! - Subsequent: avg = (prev_avg * (n-1) + current) / n
//!
//! Formula: RSI = 100 - (100 / (1 + avg_gain / avg_loss))
//! If avg_loss == 0: RSI = 100 (also for a perfectly flat window).
//!
//! Warmup: first n values are undefined (need n price changes to compute the initial average).

use crate::domain::indicator::{first_valid, undefined, Series};

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - (100.0 / (1.0 + avg_gain / avg_loss))
    }
}

pub fn calculate_rsi(src: &[f64], period: usize) -> Series {
    let mut values = undefined(src.len());
    let start = first_valid(src);
    if period == 0 || src.len() < start.saturating_add(period).saturating_add(1) {
        return values;
    }

    let mut gains: Vec<f64> = Vec::with_capacity(src.len() - start - 1);
    let mut losses: Vec<f64> = Vec::with_capacity(src.len() - start - 1);
    for i in start + 1..src.len() {
        let change = src[i] - src[i - 1];
        gains.push(if change > 0.0 { change } else { 0.0 });
        losses.push(if change < 0.0 { -change } else { 0.0 });
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;
    values[start + period] = rsi_value(avg_gain, avg_loss);

    for change_idx in period..gains.len() {
        avg_gain = (avg_gain * (period - 1) as f64 + gains[change_idx]) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + losses[change_idx]) / period as f64;
        values[start + change_idx + 1] = rsi_value(avg_gain, avg_loss);
    }
    values
}
