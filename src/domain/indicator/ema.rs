//! Exponential Moving Average indicator.
//!
//! k = 2/(n+1), seed with first SMA, then EMA[i] = C[i]*k + EMA[i-1]*(1-k).
//! Warmup: first (n-1) valid source values are undefined.

use crate::domain::indicator::{first_valid, undefined, Series};

pub fn calculate_ema(src: &[f64], period: usize) -> Series {
    let mut values = undefined(src.len());
    let start = first_valid(src);
    if period == 0 || src.len() < start.saturating_add(period) {
        return values;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed_end = start + period - 1;
    let mut ema = src[start..=seed_end].iter().sum::<f64>() / period as f64;
    values[seed_end] = ema;

    for i in seed_end + 1..src.len() {
        ema = src[i] * k + ema * (1.0 - k);
        values[i] = ema;
    }
    values
}
