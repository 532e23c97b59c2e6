//! Rolling extremes and the Ichimoku midpoint line.
//!
//! Tenkan-sen (n=9) and kijun-sen (n=26) are both
//! (highest high + lowest low) / 2 over the last n bars.
//! Warmup: first (n-1) bars undefined.

use crate::domain::indicator::{first_valid, undefined, Series};
use crate::domain::ohlcv::OhlcvBar;

fn rolling(src: &[f64], period: usize, pick: fn(f64, f64) -> f64) -> Series {
    let mut values = undefined(src.len());
    if period == 0 {
        return values;
    }

    let start = first_valid(src);
    for i in start.saturating_add(period).saturating_sub(1)..src.len() {
        values[i] = src[i + 1 - period..=i]
            .iter()
            .copied()
            .reduce(pick)
            .unwrap_or(f64::NAN);
    }
    values
}

pub fn calculate_highest(src: &[f64], period: usize) -> Series {
    rolling(src, period, f64::max)
}

pub fn calculate_lowest(src: &[f64], period: usize) -> Series {
    rolling(src, period, f64::min)
}

pub fn calculate_midpoint(bars: &[OhlcvBar], period: usize) -> Series {
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let highest = calculate_highest(&highs, period);
    let lowest = calculate_lowest(&lows, period);

    highest
        .iter()
        .zip(&lowest)
        .map(|(h, l)| (h + l) / 2.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::{assert_close, bars_from_closes};

    #[test]
    fn highest_and_lowest() {
        let src = [3.0, 1.0, 4.0, 1.0, 5.0];
        let hi = calculate_highest(&src, 3);
        let lo = calculate_lowest(&src, 3);
        assert!(hi[1].is_nan());
        assert_eq!(&hi[2..], &[4.0, 4.0, 5.0]);
        assert_eq!(&lo[2..], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn tenkan_midpoint_of_range() {
        let mut bars = bars_from_closes(&[10.0; 9]);
        for (i, bar) in bars.iter_mut().enumerate() {
            bar.high = 10.0 + i as f64;
            bar.low = 5.0 - i as f64 * 0.5;
        }
        let tenkan = calculate_midpoint(&bars, 9);
        assert!(tenkan[7].is_nan());
        // highest high 18, lowest low 1
        assert_close(tenkan[8], (18.0 + 1.0) / 2.0);
    }

    #[test]
    fn huge_period_is_undefined() {
        let src = [f64::NAN, 3.0, 1.0, 4.0];
        assert!(calculate_highest(&src, usize::MAX).iter().all(|v| v.is_nan()));
        assert!(calculate_lowest(&src, usize::MAX).iter().all(|v| v.is_nan()));
        let bars = bars_from_closes(&[10.0; 5]);
        assert!(calculate_midpoint(&bars, usize::MAX).iter().all(|v| v.is_nan()));
    }
}
