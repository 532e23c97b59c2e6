//! CSV file data adapter.
//!
//! Files hold `time,open,high,low,close,volume` rows. The time column may be
//! a date, a datetime, or unix seconds/milliseconds. Columns are found by
//! header name when present, otherwise by position.

use crate::domain::error::PinetraderError;
use crate::domain::ohlcv::{parse_timestamp, OhlcvBar};
use crate::ports::data_port::DataPort;
use chrono::{DateTime, NaiveDateTime};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Epoch values above this are taken as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

enum Source {
    /// `<symbol>_<timeframe>.csv` files under a directory.
    Dir(PathBuf),
    /// One file regardless of symbol and timeframe.
    File(PathBuf),
}

pub struct CsvAdapter {
    source: Source,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            source: Source::Dir(base_path),
        }
    }

    pub fn from_file(path: PathBuf) -> Self {
        Self {
            source: Source::File(path),
        }
    }

    fn csv_path(&self, symbol: &str, timeframe: &str) -> PathBuf {
        match &self.source {
            Source::Dir(base) => base.join(format!("{}_{}.csv", symbol, timeframe)),
            Source::File(path) => path.clone(),
        }
    }
}

fn data_error(reason: impl Into<String>) -> PinetraderError {
    PinetraderError::Data {
        reason: reason.into(),
    }
}

pub fn parse_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(epoch) = raw.parse::<i64>() {
        let stamp = if epoch.abs() >= MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(epoch)
        } else {
            DateTime::from_timestamp(epoch, 0)
        };
        return stamp.map(|t| t.naive_utc());
    }
    parse_timestamp(raw)
}

/// Column positions of time, open, high, low, close, volume.
fn column_layout(headers: &csv::StringRecord) -> [usize; 6] {
    let find = |names: &[&str], fallback: usize| {
        headers
            .iter()
            .position(|h| names.contains(&h.trim().to_ascii_lowercase().as_str()))
            .unwrap_or(fallback)
    };
    [
        find(&["time", "date", "datetime", "timestamp"], 0),
        find(&["open"], 1),
        find(&["high"], 2),
        find(&["low"], 3),
        find(&["close"], 4),
        find(&["volume"], 5),
    ]
}

fn field(record: &csv::StringRecord, index: usize, name: &str, line: u64) -> Result<f64, PinetraderError> {
    record
        .get(index)
        .ok_or_else(|| data_error(format!("line {line}: missing {name} column")))?
        .trim()
        .parse()
        .map_err(|e| data_error(format!("line {line}: invalid {name} value: {e}")))
}

impl DataPort for CsvAdapter {
    fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<OhlcvBar>, PinetraderError> {
        let path = self.csv_path(symbol, timeframe);
        let content = fs::read_to_string(&path)
            .map_err(|e| data_error(format!("failed to read {}: {}", path.display(), e)))?;

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let layout = column_layout(
            rdr.headers()
                .map_err(|e| data_error(format!("CSV header error: {}", e)))?,
        );
        let [time_col, open_col, high_col, low_col, close_col, volume_col] = layout;
        let mut bars = Vec::new();

        for result in rdr.records() {
            let record = result.map_err(|e| data_error(format!("CSV parse error: {}", e)))?;
            let line = record.position().map_or(0, |p| p.line());

            let raw_time = record
                .get(time_col)
                .ok_or_else(|| data_error(format!("line {line}: missing time column")))?;
            let time = parse_time(raw_time)
                .ok_or_else(|| data_error(format!("line {line}: invalid time '{raw_time}'")))?;

            if time < start || time > end {
                continue;
            }

            bars.push(OhlcvBar {
                time,
                open: field(&record, open_col, "open", line)?,
                high: field(&record, high_col, "high", line)?,
                low: field(&record, low_col, "low", line)?,
                close: field(&record, close_col, "close", line)?,
                volume: field(&record, volume_col, "volume", line)?,
            });
        }

        bars.sort_by_key(|b| b.time);
        let before = bars.len();
        bars.dedup_by_key(|b| b.time);
        if bars.len() < before {
            debug!(
                path = %path.display(),
                dropped = before - bars.len(),
                "dropped duplicate timestamps"
            );
        }
        Ok(bars)
    }
}
