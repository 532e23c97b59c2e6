//! Bollinger Bands indicator.
//!
//! Bollinger Bands consist of:
//! - Middle: Simple Moving Average (SMA) over n periods
//! - Upper: Middle + (multiplier × StdDev)
//! - Lower: Middle - (multiplier × StdDev)
//!
//! Where StdDev is population standard deviation (divides by N, not N-1).
//! Warmup: first (period-1) valid source values are undefined.

use crate::domain::indicator::stddev::window_stddev;
use crate::domain::indicator::{calculate_sma, undefined, Series};

#[derive(Debug, Clone)]
pub struct BollingerBands {
    pub upper: Series,
    pub middle: Series,
    pub lower: Series,
}

pub fn calculate_bollinger(src: &[f64], period: usize, mult: f64) -> BollingerBands {
    let middle = calculate_sma(src, period);
    let mut upper = undefined(src.len());
    let mut lower = undefined(src.len());

    for (i, &mid) in middle.iter().enumerate() {
        if mid.is_nan() {
            continue;
        }
        let stddev = window_stddev(&src[i + 1 - period..=i]);
        upper[i] = mid + mult * stddev;
        lower[i] = mid - mult * stddev;
    }

    BollingerBands {
        upper,
        middle,
        lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_warmup() {
        let bands = calculate_bollinger(&[10.0, 20.0, 30.0, 40.0, 50.0], 3, 2.0);

        assert!(bands.middle[0].is_nan());
        assert!(bands.upper[1].is_nan());
        assert!(bands.lower[1].is_nan());
        assert!(bands.middle[2].is_finite());
        assert!(bands.upper[4].is_finite());
    }

    #[test]
    fn bollinger_constant_values() {
        let bands = calculate_bollinger(&[100.0; 5], 3, 2.0);
        assert!((bands.middle[2] - 100.0).abs() < f64::EPSILON);
        assert!((bands.upper[2] - 100.0).abs() < f64::EPSILON);
        assert!((bands.lower[2] - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bollinger_basic_calculation() {
        let bands = calculate_bollinger(&[10.0, 20.0, 30.0], 3, 2.0);

        let expected_middle: f64 = (10.0 + 20.0 + 30.0) / 3.0;
        let variance: f64 = ((10.0 - expected_middle).powi(2)
            + (20.0 - expected_middle).powi(2)
            + (30.0 - expected_middle).powi(2))
            / 3.0;
        let stddev = variance.sqrt();

        assert!((bands.middle[2] - expected_middle).abs() < 1e-10);
        assert!((bands.upper[2] - (expected_middle + 2.0 * stddev)).abs() < 1e-10);
        assert!((bands.lower[2] - (expected_middle - 2.0 * stddev)).abs() < 1e-10);
    }

    #[test]
    fn bollinger_symmetry() {
        let bands = calculate_bollinger(&[10.0, 20.0, 30.0], 3, 1.5);
        let upper_dist = bands.upper[2] - bands.middle[2];
        let lower_dist = bands.middle[2] - bands.lower[2];
        assert!((upper_dist - lower_dist).abs() < 1e-10);
    }
}
