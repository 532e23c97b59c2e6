//! OBV (On-Balance Volume) indicator implementation.

use crate::domain::indicator::Series;
use crate::domain::ohlcv::OhlcvBar;

/// Calculate OBV (On-Balance Volume) indicator.
///
/// OBV[0] = volume[0]
/// If close[i] > close[i-1]: OBV[i] = OBV[i-1] + volume[i]
/// If close[i] < close[i-1]: OBV[i] = OBV[i-1] - volume[i]
/// If close[i] == close[i-1]: OBV[i] = OBV[i-1]
///
/// No warmup period; all bars are defined.
pub fn calculate_obv(bars: &[OhlcvBar]) -> Series {
    let mut values = Vec::with_capacity(bars.len());
    let mut obv: f64 = 0.0;

    for (i, bar) in bars.iter().enumerate() {
        if i == 0 {
            obv = bar.volume;
        } else if bar.close > bars[i - 1].close {
            obv += bar.volume;
        } else if bar.close < bars[i - 1].close {
            obv -= bar.volume;
        }
        values.push(obv);
    }
    values
}
