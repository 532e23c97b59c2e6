//! OHLCV bar representation.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A price field a Pine expression can read directly from a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
    Hl2,
    Hlc3,
    Ohlc4,
}

impl PriceField {
    pub const ALL: [PriceField; 8] = [
        PriceField::Open,
        PriceField::High,
        PriceField::Low,
        PriceField::Close,
        PriceField::Volume,
        PriceField::Hl2,
        PriceField::Hlc3,
        PriceField::Ohlc4,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "open" => Some(PriceField::Open),
            "high" => Some(PriceField::High),
            "low" => Some(PriceField::Low),
            "close" => Some(PriceField::Close),
            "volume" => Some(PriceField::Volume),
            "hl2" => Some(PriceField::Hl2),
            "hlc3" => Some(PriceField::Hlc3),
            "ohlc4" => Some(PriceField::Ohlc4),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PriceField::Open => "open",
            PriceField::High => "high",
            PriceField::Low => "low",
            PriceField::Close => "close",
            PriceField::Volume => "volume",
            PriceField::Hl2 => "hl2",
            PriceField::Hlc3 => "hlc3",
            PriceField::Ohlc4 => "ohlc4",
        }
    }
}

impl OhlcvBar {
    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }

    pub fn field(&self, field: PriceField) -> f64 {
        match field {
            PriceField::Open => self.open,
            PriceField::High => self.high,
            PriceField::Low => self.low,
            PriceField::Close => self.close,
            PriceField::Volume => self.volume,
            PriceField::Hl2 => (self.high + self.low) / 2.0,
            PriceField::Hlc3 => self.typical_price(),
            PriceField::Ohlc4 => (self.open + self.high + self.low + self.close) / 4.0,
        }
    }
}

/// Extract one price field from every bar.
pub fn price_series(bars: &[OhlcvBar], field: PriceField) -> Vec<f64> {
    bars.iter().map(|b| b.field(field)).collect()
}

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Parse `YYYY-MM-DD` (midnight) or one of the common datetime layouts.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
