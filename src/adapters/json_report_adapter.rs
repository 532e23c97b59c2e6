//! JSON report adapter implementing ReportPort.
//!
//! Writes the full backtest result as pretty JSON with a compounded monthly
//! return table derived from the equity curve.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::Datelike;
use serde::Serialize;

use crate::domain::backtest::BacktestResult;
use crate::domain::error::PinetraderError;
use crate::domain::portfolio::EquityPoint;
use crate::ports::report_port::ReportPort;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyReturnRow {
    pub year: i32,
    /// Compounded return per calendar month in percent; `None` without data.
    pub months: Vec<Option<f64>>,
}

pub fn compute_monthly_returns(equity_curve: &[EquityPoint]) -> Vec<MonthlyReturnRow> {
    if equity_curve.len() < 2 {
        return Vec::new();
    }

    let mut monthly_data: BTreeMap<(i32, u32), Vec<f64>> = BTreeMap::new();

    for window in equity_curve.windows(2) {
        let prev = &window[0];
        let curr = &window[1];
        let return_rate = if prev.equity > 0.0 {
            (curr.equity - prev.equity) / prev.equity
        } else {
            0.0
        };
        let key = (curr.time.year(), curr.time.month());
        monthly_data.entry(key).or_default().push(return_rate);
    }

    let returns: BTreeMap<(i32, u32), f64> = monthly_data
        .into_iter()
        .map(|(key, rates)| {
            let compounded = rates.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;
            (key, compounded * 100.0)
        })
        .collect();

    let (Some(first), Some(last)) = (returns.keys().next(), returns.keys().next_back()) else {
        return Vec::new();
    };

    (first.0..=last.0)
        .map(|year| MonthlyReturnRow {
            year,
            months: (1..=12u32)
                .map(|month| returns.get(&(year, month)).copied())
                .collect(),
        })
        .collect()
}

#[derive(Serialize)]
struct Report<'a> {
    strategy: &'a str,
    result: &'a BacktestResult,
    monthly_returns: Vec<MonthlyReturnRow>,
}

#[derive(Debug, Default)]
pub struct JsonReportAdapter;

impl JsonReportAdapter {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, result: &BacktestResult, strategy_name: &str) -> Result<String, PinetraderError> {
        let report = Report {
            strategy: strategy_name,
            result,
            monthly_returns: compute_monthly_returns(&result.equity_curve),
        };
        serde_json::to_string_pretty(&report).map_err(|e| PinetraderError::Report {
            reason: format!("failed to serialize report: {}", e),
        })
    }
}

impl ReportPort for JsonReportAdapter {
    fn write(
        &self,
        result: &BacktestResult,
        strategy_name: &str,
        output_path: &Path,
    ) -> Result<(), PinetraderError> {
        let json = self.render(result, strategy_name)?;
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(output_path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::{BacktestConfig, BacktestRun, CancelToken};
    use crate::domain::conversion::convert_strict;
    use crate::domain::indicator::test_support::bars_from_closes;
    use crate::domain::pine::StrategySource;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample_backtest_result() -> BacktestResult {
        let src = "strategy(\"Dip\")\nif close < 10\n    strategy.entry(\"L\", strategy.long)\nif close > 11\n    strategy.close(\"L\")\n";
        let strategy = convert_strict(&StrategySource::new("dip", src)).unwrap().strategy;
        let bars = bars_from_closes(&[9.5, 10.5, 11.5, 9.0, 12.0, 12.0]);
        let config = BacktestConfig::new("TEST", "1d", bars[0].time, bars[5].time);
        BacktestRun::new(Arc::new(strategy), config).execute(&bars, &CancelToken::new())
    }

    fn point(y: i32, m: u32, d: u32, equity: f64) -> EquityPoint {
        let time: NaiveDateTime = NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        EquityPoint {
            time,
            equity,
            position_size: 0.0,
            cash: equity,
            position_value: 0.0,
        }
    }

    #[test]
    fn monthly_returns_compound_within_month() {
        let curve = vec![
            point(2023, 12, 31, 100.0),
            point(2024, 1, 10, 110.0),
            point(2024, 1, 20, 121.0),
            point(2024, 3, 1, 121.0),
        ];
        let rows = compute_monthly_returns(&curve);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].year, 2024);
        approx::assert_relative_eq!(rows[0].months[0].unwrap(), 21.0, max_relative = 1e-12);
        assert_eq!(rows[0].months[1], None);
        assert_eq!(rows[0].months[2], Some(0.0));
    }

    #[test]
    fn monthly_returns_need_two_points() {
        assert!(compute_monthly_returns(&[point(2024, 1, 1, 1.0)]).is_empty());
    }

    #[test]
    fn write_creates_file_with_result() {
        let dir = tempdir().unwrap();
        let output_path = dir.path().join("nested/deep/report.json");
        let result = sample_backtest_result();

        JsonReportAdapter::new()
            .write(&result, "Dip", &output_path)
            .unwrap();

        let contents = fs::read_to_string(&output_path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(json["strategy"], "Dip");
        assert_eq!(json["result"]["state"], "COMPLETED");
        assert_eq!(
            json["result"]["trades"].as_array().unwrap().len(),
            result.trades.len()
        );
        assert!(json["result"]["metrics"]["total_return_pct"].is_number());
        assert!(json["monthly_returns"].is_array());
    }

    #[test]
    fn render_round_trips_result() {
        let result = sample_backtest_result();
        let json = JsonReportAdapter::new().render(&result, "Dip").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let back: BacktestResult = serde_json::from_value(value["result"].clone()).unwrap();
        assert_eq!(back.state, result.state);
        assert_eq!(back.trades.len(), 2);
        assert_eq!(back.trades[1].exit_reason, result.trades[1].exit_reason);
        assert_eq!(back.equity_curve.len(), result.equity_curve.len());
    }
}
