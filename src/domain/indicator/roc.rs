//! ROC (Rate of Change) indicator implementation.
//!
//! ROC(n)[i] = ((C[i] - C[i-n]) / C[i-n]) * 100
//! If C[i-n] == 0: ROC is undefined.
//! Warmup: first n bars undefined.

use crate::domain::indicator::{undefined, Series};

pub fn calculate_roc(src: &[f64], period: usize) -> Series {
    let mut values = undefined(src.len());

    for i in period..src.len() {
        let prev = src[i - period];
        if prev != 0.0 {
            values[i] = ((src[i] - prev) / prev) * 100.0;
        }
    }
    values
}
