//! Simple Moving Average.
//!
//! SMA(n)[i] = mean(src[i-n+1..=i]).
//! Warmup: first (n-1) valid source values are undefined.

use crate::domain::indicator::{first_valid, undefined, Series};

pub fn calculate_sma(src: &[f64], period: usize) -> Series {
    let mut values = undefined(src.len());
    if period == 0 {
        return values;
    }

    let start = first_valid(src);
    for i in start.saturating_add(period).saturating_sub(1)..src.len() {
        let window = &src[i + 1 - period..=i];
        values[i] = window.iter().sum::<f64>() / period as f64;
    }
    values
}
