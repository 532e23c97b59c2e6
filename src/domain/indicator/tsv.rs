//! Time-segmented volume, a volume oscillator.
//!
//! TSV(n)[i] = sum(V[j] * (C[j] - C[j-1])) over the last n bars.
//! Warmup: first n bars undefined (n price changes are needed).

use crate::domain::indicator::{undefined, Series};
use crate::domain::ohlcv::OhlcvBar;

pub fn calculate_tsv(bars: &[OhlcvBar], period: usize) -> Series {
    let mut values = undefined(bars.len());
    if period == 0 {
        return values;
    }

    let flow: Vec<f64> = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            if i == 0 {
                0.0
            } else {
                bar.volume * (bar.close - bars[i - 1].close)
            }
        })
        .collect();

    for i in period..bars.len() {
        values[i] = flow[i + 1 - period..=i].iter().sum();
    }
    values
}
