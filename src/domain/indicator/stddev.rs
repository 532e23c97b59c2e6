//! Standard Deviation indicator.
//!
//! Population standard deviation over n source values.
//! STDEV(n)[i] = sqrt(sum((S[i-j] - SMA(n)[i])^2 for j in 0..n-1) / n)
//! Warmup: first (n-1) valid source values are undefined.

use crate::domain::indicator::{first_valid, undefined, Series};

/// Population standard deviation of one window.
pub fn window_stddev(window: &[f64]) -> f64 {
    let n = window.len() as f64;
    let mean: f64 = window.iter().sum::<f64>() / n;
    let variance: f64 = window
        .iter()
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum::<f64>()
        / n;
    variance.sqrt()
}

pub fn calculate_stddev(src: &[f64], period: usize) -> Series {
    let mut values = undefined(src.len());
    if period == 0 {
        return values;
    }

    let start = first_valid(src);
    for i in start.saturating_add(period).saturating_sub(1)..src.len() {
        values[i] = window_stddev(&src[i + 1 - period..=i]);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::assert_close;

    #[test]
    fn stddev_warmup() {
        let series = calculate_stddev(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!(series[0].is_nan());
        assert!(series[1].is_nan());
        assert!(series[2].is_finite());
    }

    #[test]
    fn stddev_constant_is_zero() {
        let series = calculate_stddev(&[5.0; 6], 4);
        for v in &series[3..] {
            assert_close(*v, 0.0);
        }
    }

    #[test]
    fn stddev_population_formula() {
        let series = calculate_stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8);
        // Classic example: population stddev = 2
        assert_close(series[7], 2.0);
    }
}
