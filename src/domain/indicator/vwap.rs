//! Volume-weighted average price.
//!
//! Rolling: VWAP(n)[i] = sum(S[j] * V[j]) / sum(V[j]) over the last n bars.
//! Cumulative: the same sums taken from the first bar.
//! A zero volume denominator yields an undefined value, never infinity.

use crate::domain::indicator::{first_valid, undefined, Series};
use crate::domain::ohlcv::OhlcvBar;

fn weighted_mean(price_volume: f64, volume: f64) -> f64 {
    if volume == 0.0 {
        f64::NAN
    } else {
        price_volume / volume
    }
}

pub fn calculate_rolling_vwap(src: &[f64], bars: &[OhlcvBar], period: usize) -> Series {
    let mut values = undefined(src.len());
    if period == 0 {
        return values;
    }

    let start = first_valid(src);
    for i in start.saturating_add(period).saturating_sub(1)..src.len() {
        let mut pv = 0.0;
        let mut vol = 0.0;
        for j in i + 1 - period..=i {
            pv += src[j] * bars[j].volume;
            vol += bars[j].volume;
        }
        values[i] = weighted_mean(pv, vol);
    }
    values
}

pub fn calculate_cumulative_vwap(src: &[f64], bars: &[OhlcvBar]) -> Series {
    let mut values = undefined(src.len());
    let mut pv = 0.0;
    let mut vol = 0.0;

    for i in first_valid(src)..src.len() {
        pv += src[i] * bars[i].volume;
        vol += bars[i].volume;
        values[i] = weighted_mean(pv, vol);
    }
    values
}
