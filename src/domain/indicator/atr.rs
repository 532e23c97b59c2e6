//! ATR (Average True Range) with Wilder smoothing.
//!
//! TR[0] = high - low, TR[i] = true range against the previous close.
//! Seed: mean of the first n true ranges, then ATR = (prev * (n-1) + TR) / n.
//! Warmup: first (n-1) bars undefined.

use crate::domain::indicator::{undefined, Series};
use crate::domain::ohlcv::OhlcvBar;

pub fn calculate_atr(bars: &[OhlcvBar], period: usize) -> Series {
    let mut values = undefined(bars.len());
    if period == 0 || bars.len() < period {
        return values;
    }

    let tr_values: Vec<f64> = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            if i == 0 {
                bar.high - bar.low
            } else {
                bar.true_range(bars[i - 1].close)
            }
        })
        .collect();

    let mut atr = tr_values[..period].iter().sum::<f64>() / period as f64;
    values[period - 1] = atr;
    for i in period..bars.len() {
        atr = (atr * (period - 1) as f64 + tr_values[i]) / period as f64;
        values[i] = atr;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn make_bar(day: u32, high: f64, low: f64, close: f64) -> OhlcvBar {
        OhlcvBar {
            time: NaiveDate::from_ymd_opt(2024, 1, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            open: close,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn atr_basic() {
        let bars: Vec<OhlcvBar> = (0..5).map(|i| make_bar(i + 1, 110.0, 90.0, 100.0)).collect();
        let series = calculate_atr(&bars, 3);
        assert_eq!(series.len(), 5);
        assert!(series[0].is_nan());
        assert!(series[1].is_nan());
        assert!((series[2] - 20.0).abs() < 1e-9);
        assert!((series[4] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn atr_wilder_smoothing() {
        let bars = vec![
            make_bar(1, 110.0, 100.0, 105.0),
            make_bar(2, 115.0, 105.0, 110.0),
            make_bar(3, 120.0, 110.0, 115.0),
            make_bar(4, 125.0, 115.0, 120.0),
        ];
        let series = calculate_atr(&bars, 3);
        let seed = 10.0;
        assert!((series[2] - seed).abs() < 1e-9);
        assert!((series[3] - (seed * 2.0 + 10.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn atr_handles_gaps() {
        let bars = vec![
            make_bar(1, 110.0, 100.0, 105.0),
            make_bar(2, 130.0, 120.0, 125.0),
            make_bar(3, 120.0, 110.0, 115.0),
        ];
        let series = calculate_atr(&bars, 2);
        // TR[1] = max(10, |130-105|, |120-105|) = 25
        assert!((series[1] - (10.0 + 25.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_insufficient_bars() {
        let bars: Vec<OhlcvBar> = (0..2).map(|i| make_bar(i + 1, 110.0, 90.0, 100.0)).collect();
        assert!(calculate_atr(&bars, 5).iter().all(|v| v.is_nan()));
    }
}
