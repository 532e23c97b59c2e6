//! Weighted Moving Average indicator.
//!
//! O(n) sliding window implementation using Diophantine technique.
//! WMA(n) = (1*P[i-n+1] + 2*P[i-n+2] + ... + n*P[i]) / (n*(n+1)/2)
//! Warmup: first (n-1) valid source values are undefined.

use crate::domain::indicator::{first_valid, undefined, Series};

pub fn calculate_wma(src: &[f64], period: usize) -> Series {
    let mut values = undefined(src.len());
    let start = first_valid(src);
    if period == 0 || src.len() < start.saturating_add(period) {
        return values;
    }

    let divisor = (period * (period + 1)) as f64 / 2.0;
    let mut weighted_sum: f64 = 0.0;
    let mut window_sum: f64 = 0.0;

    for (offset, &price) in src[start..].iter().enumerate() {
        let i = start + offset;
        if offset < period {
            weighted_sum += (offset + 1) as f64 * price;
            window_sum += price;
        } else {
            weighted_sum += period as f64 * price - window_sum;
            window_sum += price - src[i - period];
        }

        if offset + 1 >= period {
            values[i] = weighted_sum / divisor;
        }
    }
    values
}
