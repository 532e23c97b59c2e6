#![allow(dead_code)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use pinetrader::domain::error::PinetraderError;
pub use pinetrader::domain::ohlcv::OhlcvBar;
use pinetrader::ports::data_port::DataPort;
use std::collections::HashMap;

pub const RSI_STRATEGY: &str = r#"//@version=5
strategy("RSI Strategy", overlay=true, initial_capital=10000, commission_value=0.1)
rsi_period = input.int(14, "RSI Period", minval=2, maxval=50)
oversold = input.int(30, "Oversold")
overbought = input.int(70, "Overbought")
rsi = ta.rsi(close, rsi_period)
if rsi < oversold
    strategy.entry("Long", strategy.long)
if rsi > overbought
    strategy.close("Long")
plot(rsi)
"#;

pub struct MockDataPort {
    pub data: HashMap<String, Vec<OhlcvBar>>,
    pub errors: HashMap<String, String>,
}

impl MockDataPort {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, symbol: &str, bars: Vec<OhlcvBar>) -> Self {
        self.data.insert(symbol.to_string(), bars);
        self
    }

    pub fn with_error(mut self, symbol: &str, reason: &str) -> Self {
        self.errors.insert(symbol.to_string(), reason.to_string());
        self
    }
}

impl DataPort for MockDataPort {
    fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<OhlcvBar>, PinetraderError> {
        if let Some(reason) = self.errors.get(symbol) {
            return Err(PinetraderError::Data {
                reason: reason.clone(),
            });
        }
        Ok(self
            .data
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.time >= start && b.time <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

pub fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Daily bars starting 2024-01-01, one per close.
pub fn daily_bars(closes: &[f64]) -> Vec<OhlcvBar> {
    let start = day(2024, 1, 1);
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| OhlcvBar {
            time: start + Duration::days(i as i64),
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 1_000.0 + i as f64,
        })
        .collect()
}

/// `100 + 10 * sin(2*pi*i/period)`; swings RSI(14) through 30 and 70.
pub fn sine_closes(len: usize, period: f64) -> Vec<f64> {
    (0..len)
        .map(|i| 100.0 + 10.0 * (2.0 * std::f64::consts::PI * i as f64 / period).sin())
        .collect()
}

pub fn sine_bars(len: usize) -> Vec<OhlcvBar> {
    daily_bars(&sine_closes(len, 40.0))
}

pub fn bars_to_csv(bars: &[OhlcvBar]) -> String {
    let mut out = String::from("time,open,high,low,close,volume\n");
    for b in bars {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            b.time.format("%Y-%m-%d"),
            b.open,
            b.high,
            b.low,
            b.close,
            b.volume
        ));
    }
    out
}
