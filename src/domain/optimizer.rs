//! Grid search over parameter overrides.
//!
//! Every combination becomes an independent backtest on the pool; completed
//! runs are ranked by one objective, higher is better.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::backtest::{BacktestConfig, CancelToken, RunState};
use super::error::PinetraderError;
use super::generator::GeneratedStrategy;
use super::metrics::MetricsReport;
use super::ohlcv::OhlcvBar;
use super::parameter::ParamValue;
use super::runner::{BacktestJob, BacktestPool};
use super::warning::Warning;

/// Maximum number of combinations one sweep may evaluate.
pub const MAX_COMBINATIONS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    TotalReturn,
    Sharpe,
    ProfitFactor,
    Calmar,
}

impl Objective {
    pub fn score(self, metrics: &MetricsReport) -> f64 {
        match self {
            Objective::TotalReturn => metrics.total_return_pct,
            Objective::Sharpe => metrics.sharpe_ratio,
            // no losing trades: unbounded when something was won, else nothing
            Objective::ProfitFactor => metrics.profit_factor.unwrap_or(if metrics.winning_trades > 0 {
                f64::MAX
            } else {
                0.0
            }),
            Objective::Calmar => metrics.calmar_ratio,
        }
    }
}

impl FromStr for Objective {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "total_return" | "return" => Ok(Objective::TotalReturn),
            "sharpe" | "sharpe_ratio" => Ok(Objective::Sharpe),
            "profit_factor" => Ok(Objective::ProfitFactor),
            "calmar" | "calmar_ratio" => Ok(Objective::Calmar),
            other => Err(format!(
                "unknown objective '{other}' (expected total_return, sharpe, profit_factor or calmar)"
            )),
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Objective::TotalReturn => "total_return",
            Objective::Sharpe => "sharpe",
            Objective::ProfitFactor => "profit_factor",
            Objective::Calmar => "calmar",
        };
        f.write_str(name)
    }
}

/// Candidate values for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    pub name: String,
    pub values: Vec<ParamValue>,
}

impl ParameterGrid {
    /// `min..=max` in `step` increments.
    pub fn range(name: impl Into<String>, min: f64, max: f64, step: f64) -> Result<Self, PinetraderError> {
        let name = name.into();
        if !(step.is_finite() && step > 0.0) {
            return Err(PinetraderError::config("grid", format!("step for '{name}' must be positive")));
        }
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(PinetraderError::config(
                "grid",
                format!("range for '{name}' must satisfy min <= max"),
            ));
        }
        let count = ((max - min) / step + 1e-9).floor() as usize + 1;
        if count > MAX_COMBINATIONS {
            return Err(PinetraderError::config(
                "grid",
                format!("'{name}' has {count} values, limit is {MAX_COMBINATIONS}"),
            ));
        }
        // computed by index so repeated addition does not drift
        let values = (0..count)
            .map(|i| ParamValue::Number(round_step(min + i as f64 * step)))
            .collect();
        Ok(ParameterGrid { name, values })
    }

    /// Parse `name=min:max:step` or `name=a,b,c`.
    pub fn parse(spec: &str) -> Result<Self, PinetraderError> {
        let (name, body) = spec
            .split_once('=')
            .map(|(n, b)| (n.trim(), b.trim()))
            .filter(|(n, b)| !n.is_empty() && !b.is_empty())
            .ok_or_else(|| {
                PinetraderError::config("grid", format!("'{spec}' is not name=min:max:step or name=a,b,c"))
            })?;

        let bounds: Vec<&str> = body.split(':').collect();
        if let [min, max, step] = bounds.as_slice() {
            let number = |raw: &str| {
                raw.trim().parse::<f64>().map_err(|_| {
                    PinetraderError::config("grid", format!("'{raw}' in '{spec}' is not a number"))
                })
            };
            return Self::range(name, number(*min)?, number(*max)?, number(*step)?);
        }
        if bounds.len() != 1 {
            return Err(PinetraderError::config(
                "grid",
                format!("'{spec}' needs exactly min:max:step"),
            ));
        }

        Ok(ParameterGrid {
            name: name.to_string(),
            values: body.split(',').map(ParamValue::parse_loose).collect(),
        })
    }
}

/// Trim float noise from grid points such as `0.30000000000000004`.
fn round_step(value: f64) -> f64 {
    (value * 1e9).round() / 1e9
}

/// Cartesian product in declaration order, last grid varying fastest.
pub fn combinations(grids: &[ParameterGrid]) -> Result<Vec<BTreeMap<String, ParamValue>>, PinetraderError> {
    if grids.is_empty() {
        return Err(PinetraderError::config("grid", "no parameter ranges specified"));
    }
    let mut seen = BTreeSet::new();
    let mut total: usize = 1;
    for grid in grids {
        if !seen.insert(grid.name.as_str()) {
            return Err(PinetraderError::config(
                "grid",
                format!("parameter '{}' listed twice", grid.name),
            ));
        }
        if grid.values.is_empty() {
            return Err(PinetraderError::config(
                "grid",
                format!("parameter '{}' has no values", grid.name),
            ));
        }
        total = total.saturating_mul(grid.values.len());
    }
    if total > MAX_COMBINATIONS {
        return Err(PinetraderError::config(
            "grid",
            format!("{total} combinations exceeds the limit of {MAX_COMBINATIONS}"),
        ));
    }

    let mut combos: Vec<BTreeMap<String, ParamValue>> = vec![BTreeMap::new()];
    for grid in grids {
        let mut next = Vec::with_capacity(combos.len() * grid.values.len());
        for combo in &combos {
            for value in &grid.values {
                let mut c = combo.clone();
                c.insert(grid.name.clone(), value.clone());
                next.push(c);
            }
        }
        combos = next;
    }
    Ok(combos)
}

/// One ranked combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Effective values after clamping, all parameters included.
    pub parameters: BTreeMap<String, ParamValue>,
    pub score: f64,
    pub metrics: MetricsReport,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub objective: Objective,
    pub evaluated: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Best first; ties keep enumeration order.
    pub top: Vec<Candidate>,
}

/// Evaluate every combination of `grids` on top of `base` and keep the best
/// `top_n` completed runs.
///
/// Every job of the sweep shares `cancel`; cancelling it stops this sweep
/// only.
#[allow(clippy::too_many_arguments)]
pub fn grid_search(
    pool: &BacktestPool,
    strategy: Arc<GeneratedStrategy>,
    base: &BacktestConfig,
    bars: Arc<Vec<OhlcvBar>>,
    grids: &[ParameterGrid],
    objective: Objective,
    top_n: usize,
    cancel: &CancelToken,
) -> Result<SweepOutcome, PinetraderError> {
    for grid in grids {
        if !strategy.parameters().iter().any(|p| p.name == grid.name) {
            return Err(PinetraderError::binding(&grid.name, "unknown parameter"));
        }
    }
    let combos = combinations(grids)?;
    info!(
        strategy = %strategy.name(),
        combinations = combos.len(),
        %objective,
        "grid search"
    );

    let jobs: Vec<BacktestJob> = combos
        .into_iter()
        .map(|combo| {
            let mut config = base.clone();
            config.overrides.extend(combo);
            BacktestJob::new(Arc::clone(&strategy), config, Arc::clone(&bars)).with_cancel(cancel.clone())
        })
        .collect();
    let evaluated = jobs.len();
    let results = pool.run_all(jobs);

    let mut failed = 0;
    let mut cancelled = 0;
    let mut ranked = Vec::new();
    for result in results {
        match result.state {
            RunState::Completed => ranked.push(Candidate {
                score: objective.score(&result.metrics),
                parameters: result.parameters,
                metrics: result.metrics,
                warnings: result.warnings,
            }),
            RunState::Cancelled => cancelled += 1,
            _ => failed += 1,
        }
    }

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(top_n);
    info!(evaluated, failed, cancelled, "grid search finished");

    Ok(SweepOutcome {
        objective,
        evaluated,
        failed,
        cancelled,
        top: ranked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::conversion::convert_strict;
    use crate::domain::indicator::test_support::bars_from_closes;
    use crate::domain::pine::StrategySource;

    #[test]
    fn range_includes_max() {
        let grid = ParameterGrid::range("len", 10.0, 30.0, 10.0).unwrap();
        assert_eq!(
            grid.values,
            vec![
                ParamValue::Number(10.0),
                ParamValue::Number(20.0),
                ParamValue::Number(30.0)
            ]
        );
        let grid = ParameterGrid::range("x", 0.1, 0.3, 0.1).unwrap();
        assert_eq!(grid.values.len(), 3);
        assert_eq!(grid.values[2], ParamValue::Number(0.3));
    }

    #[test]
    fn parse_forms() {
        let grid = ParameterGrid::parse("rsi_period = 10:14:2").unwrap();
        assert_eq!(grid.name, "rsi_period");
        assert_eq!(grid.values.len(), 3);

        let grid = ParameterGrid::parse("ma=SMA,EMA").unwrap();
        assert_eq!(
            grid.values,
            vec![ParamValue::Text("SMA".into()), ParamValue::Text("EMA".into())]
        );

        assert!(ParameterGrid::parse("nothing").is_err());
        assert!(ParameterGrid::parse("x=1:2").is_err());
        assert!(ParameterGrid::parse("x=1:a:1").is_err());
        assert!(ParameterGrid::parse("x=5:1:1").is_err());
        assert!(ParameterGrid::parse("x=1:5:0").is_err());
    }

    #[test]
    fn cartesian_product() {
        let grids = vec![
            ParameterGrid::range("fast", 5.0, 10.0, 5.0).unwrap(),
            ParameterGrid::range("slow", 20.0, 30.0, 5.0).unwrap(),
        ];
        let combos = combinations(&grids).unwrap();
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[1].get("slow"), Some(&ParamValue::Number(25.0)));
        assert_eq!(combos[1].get("fast"), Some(&ParamValue::Number(5.0)));
    }

    #[test]
    fn too_many_combinations() {
        let grids = vec![
            ParameterGrid::range("a", 1.0, 800.0, 1.0).unwrap(),
            ParameterGrid::range("b", 1.0, 800.0, 1.0).unwrap(),
        ];
        let err = combinations(&grids).unwrap_err();
        assert!(err.to_string().contains("640000 combinations"));
    }

    #[test]
    fn duplicate_and_empty_grids_rejected() {
        assert!(combinations(&[]).is_err());
        let g = ParameterGrid::range("a", 1.0, 2.0, 1.0).unwrap();
        assert!(combinations(&[g.clone(), g]).is_err());
    }

    #[test]
    fn objective_names() {
        assert_eq!("sharpe".parse::<Objective>(), Ok(Objective::Sharpe));
        assert_eq!("Calmar".parse::<Objective>(), Ok(Objective::Calmar));
        assert!("alpha".parse::<Objective>().is_err());
        assert_eq!(Objective::ProfitFactor.to_string(), "profit_factor");
    }

    #[test]
    fn sweep_ranks_completed_runs() {
        let src = r#"strategy("Threshold")
level = input.float(10.5, minval=0, maxval=100)
if close > level
    strategy.entry("L", strategy.long)
if close < level
    strategy.close("L")
"#;
        let strategy = Arc::new(convert_strict(&StrategySource::new("t", src)).unwrap().strategy);
        let closes: Vec<f64> = (0..120).map(|i| 10.5 + (i as f64 * 0.2).sin()).collect();
        let bars = Arc::new(bars_from_closes(&closes));
        let base = BacktestConfig::new("T", "1d", bars[0].time, bars[bars.len() - 1].time);
        let pool = BacktestPool::new(2).unwrap();
        let grids = vec![ParameterGrid::range("level", 10.0, 11.0, 0.25).unwrap()];

        let outcome = grid_search(&pool, strategy.clone(), &base, bars.clone(), &grids, Objective::TotalReturn, 3, &CancelToken::new()).unwrap();
        assert_eq!(outcome.evaluated, 5);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.top.len(), 3);
        assert!(outcome.top[0].score >= outcome.top[1].score);
        assert!(outcome.top[1].score >= outcome.top[2].score);

        let again = grid_search(&pool, strategy.clone(), &base, bars.clone(), &grids, Objective::TotalReturn, 3, &CancelToken::new()).unwrap();
        assert_eq!(outcome, again);

        let unknown = vec![ParameterGrid::range("nope", 1.0, 2.0, 1.0).unwrap()];
        let err = grid_search(&pool, strategy, &base, bars, &unknown, Objective::Sharpe, 3, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PinetraderError::ParameterBinding { .. }));
    }

    #[test]
    fn cancelled_sweep_does_not_affect_the_next() {
        let src = r#"strategy("Threshold")
level = input.float(10.5, minval=0, maxval=100)
if close > level
    strategy.entry("L", strategy.long)
"#;
        let strategy = Arc::new(convert_strict(&StrategySource::new("t", src)).unwrap().strategy);
        let closes: Vec<f64> = (0..60).map(|i| 10.5 + (i as f64 * 0.3).sin()).collect();
        let bars = Arc::new(bars_from_closes(&closes));
        let base = BacktestConfig::new("T", "1d", bars[0].time, bars[bars.len() - 1].time);
        let pool = BacktestPool::new(2).unwrap();
        let grids = vec![ParameterGrid::range("level", 10.0, 11.0, 0.5).unwrap()];

        let stopped = CancelToken::new();
        stopped.cancel();
        let outcome = grid_search(&pool, strategy.clone(), &base, bars.clone(), &grids, Objective::TotalReturn, 3, &stopped).unwrap();
        assert_eq!(outcome.evaluated, 3);
        assert_eq!(outcome.cancelled, 3);
        assert!(outcome.top.is_empty());

        let next = grid_search(&pool, strategy, &base, bars, &grids, Objective::TotalReturn, 3, &CancelToken::new()).unwrap();
        assert_eq!(next.cancelled, 0);
        assert_eq!(next.top.len(), 3);
    }
}
