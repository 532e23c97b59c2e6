//! Historical market data port trait.

use crate::domain::error::PinetraderError;
use crate::domain::ohlcv::OhlcvBar;
use chrono::NaiveDateTime;

pub trait DataPort {
    /// Bars for `symbol` at `timeframe` between `start` and `end` inclusive,
    /// in ascending time order.
    fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<OhlcvBar>, PinetraderError>;
}
