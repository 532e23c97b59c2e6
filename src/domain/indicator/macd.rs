//! MACD (Moving Average Convergence Divergence) indicator.
//!
//! MACD Line = EMA(fast) - EMA(slow)
//! Signal Line = EMA(signal) of MACD Line
//! Histogram = MACD Line - Signal Line
//!
//! Warmup: the line is defined after slow - 1 values, signal and histogram
//! after a further signal - 1.

use crate::domain::indicator::{calculate_ema, Series};

#[derive(Debug, Clone)]
pub struct MacdSeries {
    pub line: Series,
    pub signal: Series,
    pub histogram: Series,
}

pub fn calculate_macd(src: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdSeries {
    let ema_fast = calculate_ema(src, fast);
    let ema_slow = calculate_ema(src, slow);

    let line: Series = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| f - s)
        .collect();
    let signal = calculate_ema(&line, signal_period);
    let histogram = line.iter().zip(&signal).map(|(l, s)| l - s).collect();

    MacdSeries {
        line,
        signal,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices() -> Vec<f64> {
        (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1).collect()
    }

    #[test]
    fn macd_warmup() {
        let out = calculate_macd(&prices(), 12, 26, 9);
        assert!(out.line[24].is_nan());
        assert!(out.line[25].is_finite());
        assert!(out.signal[32].is_nan());
        assert!(out.signal[33].is_finite());
        assert!(out.histogram[33].is_finite());
    }

    #[test]
    fn macd_histogram_is_line_minus_signal() {
        let out = calculate_macd(&prices(), 12, 26, 9);
        for i in 33..60 {
            assert!((out.histogram[i] - (out.line[i] - out.signal[i])).abs() < 1e-12);
        }
    }

    #[test]
    fn macd_flat_prices_are_zero() {
        let out = calculate_macd(&[50.0; 40], 3, 6, 3);
        for v in out.histogram.iter().filter(|v| v.is_finite()) {
            assert!(v.abs() < 1e-12);
        }
    }
}
