//! Technical indicator implementations.
//!
//! Every indicator returns one or more same-length [`Series`]. Bars without
//! enough history hold `NaN`; they are never zero-filled, so comparisons
//! against them are undefined rather than spuriously true.
//!
//! Source-based indicators take a `&[f64]` source (which may itself carry a
//! leading `NaN` warmup, e.g. an SMA of an RSI); bar-based indicators read the
//! [`OhlcvBar`] fields they need.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod ichimoku;
pub mod macd;
pub mod obv;
pub mod roc;
pub mod rsi;
pub mod sma;
pub mod stddev;
pub mod tsv;
pub mod vwap;
pub mod wma;

pub use ema::calculate_ema;
pub use sma::calculate_sma;

use crate::domain::error::PinetraderError;
use crate::domain::ohlcv::{OhlcvBar, PriceField};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A per-bar numeric series; `NaN` marks undefined bars.
pub type Series = Vec<f64>;

/// Index of the first finite value, or `src.len()` when there is none.
pub fn first_valid(src: &[f64]) -> usize {
    src.iter().position(|v| v.is_finite()).unwrap_or(src.len())
}

pub fn undefined(len: usize) -> Series {
    vec![f64::NAN; len]
}

/// Identity of a recognized indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Sma,
    Ema,
    Wma,
    Rsi,
    Stdev,
    Roc,
    Atr,
    /// Rolling volume-weighted average price.
    Vwma,
    /// Cumulative volume-weighted average price.
    Vwap,
    Bollinger,
    Macd,
    Highest,
    Lowest,
    /// Ichimoku tenkan/kijun style midpoint of the rolling high/low range.
    Midpoint,
    /// Time-segmented volume.
    Tsv,
    Obv,
}

/// One positional argument slot of an indicator call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgSlot {
    /// A series input; `default` applies when the call omits it.
    Source { default: Option<PriceField> },
    /// A positive integer lookback.
    Length,
    /// A scalar multiplier.
    Factor { default: Option<f64> },
}

use ArgSlot::{Factor, Length, Source};

const SRC: ArgSlot = Source { default: None };

impl IndicatorKind {
    /// Resolve a Pine function name. Both `ta.sma` and bare v4 `sma` spellings are accepted.
    pub fn from_pine(name: &str) -> Option<Self> {
        let bare = name.strip_prefix("ta.").unwrap_or(name);
        let kind = match bare {
            "sma" => IndicatorKind::Sma,
            "ema" => IndicatorKind::Ema,
            "wma" => IndicatorKind::Wma,
            "rsi" => IndicatorKind::Rsi,
            "stdev" => IndicatorKind::Stdev,
            "roc" => IndicatorKind::Roc,
            "atr" => IndicatorKind::Atr,
            "vwma" => IndicatorKind::Vwma,
            "vwap" => IndicatorKind::Vwap,
            "bb" => IndicatorKind::Bollinger,
            "macd" => IndicatorKind::Macd,
            "highest" => IndicatorKind::Highest,
            "lowest" => IndicatorKind::Lowest,
            "obv" => IndicatorKind::Obv,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            IndicatorKind::Sma => "sma",
            IndicatorKind::Ema => "ema",
            IndicatorKind::Wma => "wma",
            IndicatorKind::Rsi => "rsi",
            IndicatorKind::Stdev => "stdev",
            IndicatorKind::Roc => "roc",
            IndicatorKind::Atr => "atr",
            IndicatorKind::Vwma => "vwma",
            IndicatorKind::Vwap => "vwap",
            IndicatorKind::Bollinger => "bb",
            IndicatorKind::Macd => "macd",
            IndicatorKind::Highest => "highest",
            IndicatorKind::Lowest => "lowest",
            IndicatorKind::Midpoint => "midpoint",
            IndicatorKind::Tsv => "tsv",
            IndicatorKind::Obv => "obv",
        }
    }

    /// Positional argument slots, in Pine call order.
    pub fn signature(self) -> &'static [ArgSlot] {
        match self {
            IndicatorKind::Sma
            | IndicatorKind::Ema
            | IndicatorKind::Wma
            | IndicatorKind::Rsi
            | IndicatorKind::Stdev
            | IndicatorKind::Roc
            | IndicatorKind::Vwma => &[SRC, Length],
            IndicatorKind::Highest => &[
                Source {
                    default: Some(PriceField::High),
                },
                Length,
            ],
            IndicatorKind::Lowest => &[
                Source {
                    default: Some(PriceField::Low),
                },
                Length,
            ],
            IndicatorKind::Vwap => &[Source {
                default: Some(PriceField::Hlc3),
            }],
            IndicatorKind::Bollinger => &[SRC, Length, Factor { default: None }],
            IndicatorKind::Macd => &[SRC, Length, Length, Length],
            IndicatorKind::Atr | IndicatorKind::Midpoint | IndicatorKind::Tsv => &[Length],
            IndicatorKind::Obv => &[],
        }
    }

    /// Named outputs; single-output indicators expose one unnamed value.
    pub fn outputs(self) -> &'static [&'static str] {
        match self {
            IndicatorKind::Bollinger => &["middle", "upper", "lower"],
            IndicatorKind::Macd => &["macd", "signal", "histogram"],
            _ => &["value"],
        }
    }

    /// Pine named-argument spellings for each positional slot.
    pub fn arg_names(self) -> &'static [&'static str] {
        match self {
            IndicatorKind::Bollinger => &["source", "length", "mult"],
            IndicatorKind::Macd => &["source", "fastlen", "slowlen", "siglen"],
            IndicatorKind::Vwap => &["source"],
            IndicatorKind::Atr | IndicatorKind::Midpoint | IndicatorKind::Tsv => &["length"],
            IndicatorKind::Obv => &[],
            _ => &["source", "length"],
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Concrete inputs for one indicator evaluation, in signature order.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorInputs {
    pub source: Option<Series>,
    pub lengths: Vec<usize>,
    pub factor: Option<f64>,
}

fn length_at(kind: IndicatorKind, inputs: &IndicatorInputs, idx: usize) -> Result<usize, PinetraderError> {
    match inputs.lengths.get(idx) {
        Some(&0) => Err(PinetraderError::computation(
            format!("indicator {kind}"),
            "length must be at least 1",
            None,
        )),
        Some(&len) => Ok(len),
        None => Err(PinetraderError::computation(
            format!("indicator {kind}"),
            format!("missing length argument #{}", idx + 1),
            None,
        )),
    }
}

fn source_of(kind: IndicatorKind, inputs: &IndicatorInputs) -> Result<&[f64], PinetraderError> {
    inputs.source.as_deref().ok_or_else(|| {
        PinetraderError::computation(format!("indicator {kind}"), "missing source series", None)
    })
}

/// Evaluate an indicator, returning one series per entry of [`IndicatorKind::outputs`].
pub fn compute(
    kind: IndicatorKind,
    bars: &[OhlcvBar],
    inputs: &IndicatorInputs,
) -> Result<Vec<Series>, PinetraderError> {
    if let Some(src) = &inputs.source {
        if src.len() != bars.len() {
            return Err(PinetraderError::computation(
                format!("indicator {kind}"),
                format!("source has {} values for {} bars", src.len(), bars.len()),
                None,
            ));
        }
    }

    let series = match kind {
        IndicatorKind::Sma => vec![sma::calculate_sma(source_of(kind, inputs)?, length_at(kind, inputs, 0)?)],
        IndicatorKind::Ema => vec![ema::calculate_ema(source_of(kind, inputs)?, length_at(kind, inputs, 0)?)],
        IndicatorKind::Wma => vec![wma::calculate_wma(source_of(kind, inputs)?, length_at(kind, inputs, 0)?)],
        IndicatorKind::Rsi => vec![rsi::calculate_rsi(source_of(kind, inputs)?, length_at(kind, inputs, 0)?)],
        IndicatorKind::Stdev => {
            vec![stddev::calculate_stddev(source_of(kind, inputs)?, length_at(kind, inputs, 0)?)]
        }
        IndicatorKind::Roc => vec![roc::calculate_roc(source_of(kind, inputs)?, length_at(kind, inputs, 0)?)],
        IndicatorKind::Atr => vec![atr::calculate_atr(bars, length_at(kind, inputs, 0)?)],
        IndicatorKind::Vwma => vec![vwap::calculate_rolling_vwap(
            source_of(kind, inputs)?,
            bars,
            length_at(kind, inputs, 0)?,
        )],
        IndicatorKind::Vwap => vec![vwap::calculate_cumulative_vwap(source_of(kind, inputs)?, bars)],
        IndicatorKind::Bollinger => {
            let mult = inputs.factor.ok_or_else(|| {
                PinetraderError::computation("indicator bb", "missing multiplier", None)
            })?;
            let bands =
                bollinger::calculate_bollinger(source_of(kind, inputs)?, length_at(kind, inputs, 0)?, mult);
            vec![bands.middle, bands.upper, bands.lower]
        }
        IndicatorKind::Macd => {
            let out = macd::calculate_macd(
                source_of(kind, inputs)?,
                length_at(kind, inputs, 0)?,
                length_at(kind, inputs, 1)?,
                length_at(kind, inputs, 2)?,
            );
            vec![out.line, out.signal, out.histogram]
        }
        IndicatorKind::Highest => {
            vec![ichimoku::calculate_highest(source_of(kind, inputs)?, length_at(kind, inputs, 0)?)]
        }
        IndicatorKind::Lowest => {
            vec![ichimoku::calculate_lowest(source_of(kind, inputs)?, length_at(kind, inputs, 0)?)]
        }
        IndicatorKind::Midpoint => vec![ichimoku::calculate_midpoint(bars, length_at(kind, inputs, 0)?)],
        IndicatorKind::Tsv => vec![tsv::calculate_tsv(bars, length_at(kind, inputs, 0)?)],
        IndicatorKind::Obv => vec![obv::calculate_obv(bars)],
    };
    Ok(series)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::domain::ohlcv::OhlcvBar;
    use chrono::NaiveDate;

    pub fn bars_from_closes(prices: &[f64]) -> Vec<OhlcvBar> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &close)| OhlcvBar {
                time: NaiveDate::from_ymd_opt(2024, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    + chrono::Duration::days(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    pub fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }
}
