//! Backtest configuration loading and validation.
//!
//! `load_backtest_config` reads the `[backtest]` and `[parameters]` sections
//! on top of defaults seeded from the Pine header. `validate_backtest_config`
//! runs before a backtest may enter `RUNNING`.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};

use crate::domain::backtest::BacktestConfig;
use crate::domain::error::PinetraderError;
use crate::domain::metrics::Annualization;
use crate::domain::ohlcv::{parse_timestamp, OhlcvBar};
use crate::domain::parameter::ParamValue;
use crate::domain::pine::StrategyHeader;
use crate::ports::config_port::ConfigPort;

const BACKTEST: &str = "backtest";
const PARAMETERS: &str = "parameters";

pub fn validate_backtest_config(config: &BacktestConfig) -> Result<(), PinetraderError> {
    if config.start > config.end {
        return Err(PinetraderError::config(
            "start",
            format!("start {} is after end {}", config.start, config.end),
        ));
    }
    if !(config.initial_capital.is_finite() && config.initial_capital > 0.0) {
        return Err(PinetraderError::config(
            "initial_capital",
            "initial_capital must be positive",
        ));
    }
    below_one("commission_rate", config.commission_rate)?;
    below_one("slippage_rate", config.slippage_rate)?;
    up_to_one("max_position_size", config.max_position_size)?;
    up_to_one("risk_per_trade", config.risk_per_trade)?;
    below_one("stop_loss_pct", config.stop_loss_pct)?;
    if !(config.take_profit_pct.is_finite() && config.take_profit_pct >= 0.0) {
        return Err(PinetraderError::config(
            "take_profit_pct",
            "take_profit_pct must be non-negative",
        ));
    }
    below_one("risk_free_rate", config.risk_free_rate)?;
    if matches!(config.annualization, Annualization::Fixed(p) if !(p.is_finite() && p > 0.0)) {
        return Err(PinetraderError::config(
            "periods_per_year",
            "periods_per_year must be positive",
        ));
    }
    Ok(())
}

/// `[0, 1)`
fn below_one(field: &str, value: f64) -> Result<(), PinetraderError> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(PinetraderError::config(
            field,
            format!("{field} must be in [0, 1), got {value}"),
        ))
    }
}

/// `(0, 1]`
fn up_to_one(field: &str, value: f64) -> Result<(), PinetraderError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(PinetraderError::config(
            field,
            format!("{field} must be in (0, 1], got {value}"),
        ))
    }
}

/// Bars inside `[start, end]`, with the offset of the first one.
///
/// Bars are expected in ascending time order. An empty selection is a
/// validation failure.
pub fn select_range<'a>(
    bars: &'a [OhlcvBar],
    config: &BacktestConfig,
) -> Result<(usize, &'a [OhlcvBar]), PinetraderError> {
    let first = bars.partition_point(|b| b.time < config.start);
    let end = bars.partition_point(|b| b.time <= config.end);
    if first >= end {
        return Err(PinetraderError::config(
            "range",
            format!(
                "no bars between {} and {} ({} supplied)",
                config.start,
                config.end,
                bars.len()
            ),
        ));
    }
    Ok((first, &bars[first..end]))
}

/// Build a backtest config from INI settings over Pine header defaults.
pub fn load_backtest_config(
    config: &dyn ConfigPort,
    header: &StrategyHeader,
) -> Result<BacktestConfig, PinetraderError> {
    let symbol = required(config, "symbol")?;
    let timeframe = config
        .get_string(BACKTEST, "timeframe")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "1d".to_string());
    let start = timestamp(config, "start", false)?;
    let end = timestamp(config, "end", true)?;

    let mut out = BacktestConfig::new(symbol, timeframe, start, end).with_header(header);
    out.initial_capital = number(config, "initial_capital", out.initial_capital)?;
    out.commission_rate = number(config, "commission_rate", out.commission_rate)?;
    out.slippage_rate = number(config, "slippage_rate", out.slippage_rate)?;
    out.max_position_size = number(config, "max_position_size", out.max_position_size)?;
    out.risk_per_trade = number(config, "risk_per_trade", out.risk_per_trade)?;
    out.stop_loss_pct = number(config, "stop_loss_pct", out.stop_loss_pct)?;
    out.take_profit_pct = number(config, "take_profit_pct", out.take_profit_pct)?;
    out.risk_free_rate = number(config, "risk_free_rate", out.risk_free_rate)?;
    out.annualization = annualization(config)?;
    out.overrides = parameter_overrides(config);
    Ok(out)
}

/// `[parameters]` entries, parsed as bool, number or text.
pub fn parameter_overrides(config: &dyn ConfigPort) -> BTreeMap<String, ParamValue> {
    config
        .keys(PARAMETERS)
        .into_iter()
        .filter_map(|key| {
            let raw = config.get_string(PARAMETERS, &key)?;
            Some((key, ParamValue::parse_loose(&raw)))
        })
        .collect()
}

fn required(config: &dyn ConfigPort, key: &str) -> Result<String, PinetraderError> {
    match config.get_string(BACKTEST, key) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(PinetraderError::ConfigMissing {
            section: BACKTEST.to_string(),
            key: key.to_string(),
        }),
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> PinetraderError {
    PinetraderError::ConfigInvalid {
        section: BACKTEST.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// A date-only `end` covers the whole day.
fn timestamp(config: &dyn ConfigPort, key: &str, end_of_day: bool) -> Result<NaiveDateTime, PinetraderError> {
    let raw = required(config, key)?;
    if end_of_day {
        if let Some(t) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(23, 59, 59))
        {
            return Ok(t);
        }
    }
    parse_timestamp(&raw).ok_or_else(|| {
        invalid(
            key,
            format!("'{raw}' is not YYYY-MM-DD or YYYY-MM-DD HH:MM:SS"),
        )
    })
}

fn number(config: &dyn ConfigPort, key: &str, default: f64) -> Result<f64, PinetraderError> {
    match config.get_string(BACKTEST, key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid(key, format!("'{}' is not a number", raw.trim()))),
    }
}

fn annualization(config: &dyn ConfigPort) -> Result<Annualization, PinetraderError> {
    match config.get_string(BACKTEST, "periods_per_year") {
        None => Ok(Annualization::FromData),
        Some(raw) if raw.trim().eq_ignore_ascii_case("auto") => Ok(Annualization::FromData),
        Some(_) => number(config, "periods_per_year", 0.0).map(Annualization::Fixed),
    }
}
