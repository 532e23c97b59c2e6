//! Performance metrics and statistics.
//!
//! Every ratio guards its denominator: degenerate inputs (no trades, flat
//! equity, zero drawdown) report `0.0`, or `None` for the profit factor when
//! there are no losing trades. NaN and infinity never reach the report.

use super::portfolio::EquityPoint;
use super::position::Trade;
use serde::{Deserialize, Serialize};

const SECONDS_PER_YEAR: f64 = 365.25 * 86_400.0;
/// Lower tail probability for value-at-risk (95% confidence).
const VAR_TAIL: f64 = 0.05;

/// How periodic returns are scaled to annual figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "basis", content = "periods")]
pub enum Annualization {
    /// A fixed number of bars per year, e.g. 252 for daily equities.
    Fixed(f64),
    /// Bars per year observed in the equity curve.
    #[default]
    FromData,
}

impl Annualization {
    /// Bars per year for `curve`; 0 when it cannot be determined.
    pub fn periods_per_year(&self, curve: &[EquityPoint]) -> f64 {
        match self {
            Annualization::Fixed(n) => *n,
            Annualization::FromData => {
                let years = elapsed_years(curve);
                if years > 0.0 {
                    (curve.len() - 1) as f64 / years
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return: f64,
    pub total_return_pct: f64,
    /// Compounded over the elapsed run duration.
    pub annualized_return_pct: f64,
    /// Largest peak-to-trough decline as a percentage of the peak.
    pub max_drawdown_pct: f64,
    /// Standard deviation of per-bar equity returns.
    pub volatility: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub periods_per_year: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate_pct: f64,
    pub profit_factor: Option<f64>,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_trade_duration_secs: f64,
    pub avg_bars_held: f64,
    /// 95% historical value-at-risk of trade P&L, as a positive loss amount.
    pub value_at_risk_95: f64,
}

impl MetricsReport {
    pub fn compute(
        trades: &[Trade],
        equity_curve: &[EquityPoint],
        initial_capital: f64,
        risk_free_rate: f64,
        annualization: Annualization,
    ) -> Self {
        let final_equity = equity_curve.last().map(|p| p.equity).unwrap_or(initial_capital);
        let total_return = final_equity - initial_capital;
        let growth = if initial_capital > 0.0 {
            final_equity / initial_capital
        } else {
            1.0
        };
        let total_return_pct = (growth - 1.0) * 100.0;

        let years = elapsed_years(equity_curve);
        let annualized_return_pct = if years > 0.0 && growth > 0.0 {
            (growth.powf(1.0 / years) - 1.0) * 100.0
        } else {
            0.0
        };

        let max_drawdown_pct = compute_drawdown(initial_capital, equity_curve) * 100.0;

        let periods_per_year = annualization.periods_per_year(equity_curve);
        let returns = periodic_returns(initial_capital, equity_curve);
        let risk = compute_risk_adjusted(&returns, risk_free_rate, periods_per_year);

        let calmar_ratio = if max_drawdown_pct > 0.0 {
            annualized_return_pct / max_drawdown_pct
        } else {
            0.0
        };

        let stats = TradeStats::from_trades(trades);

        MetricsReport {
            initial_capital,
            final_equity,
            total_return,
            total_return_pct,
            annualized_return_pct: finite_or_zero(annualized_return_pct),
            max_drawdown_pct,
            volatility: risk.volatility,
            annualized_volatility: risk.volatility * periods_per_year.sqrt(),
            sharpe_ratio: risk.sharpe,
            sortino_ratio: risk.sortino,
            calmar_ratio: finite_or_zero(calmar_ratio),
            periods_per_year,
            total_trades: trades.len(),
            winning_trades: stats.won,
            losing_trades: stats.lost,
            win_rate_pct: ratio(stats.won as f64, trades.len() as f64) * 100.0,
            profit_factor: (stats.gross_loss > 0.0).then(|| stats.gross_profit / stats.gross_loss),
            avg_win: ratio(stats.gross_profit, stats.won as f64),
            avg_loss: ratio(stats.gross_loss, stats.lost as f64),
            largest_win: stats.largest_win,
            largest_loss: stats.largest_loss,
            avg_trade_duration_secs: ratio(stats.total_duration_secs, trades.len() as f64),
            avg_bars_held: ratio(stats.total_bars, trades.len() as f64),
            value_at_risk_95: value_at_risk(trades, VAR_TAIL),
        }
    }
}

#[derive(Default)]
struct TradeStats {
    won: usize,
    lost: usize,
    gross_profit: f64,
    gross_loss: f64,
    largest_win: f64,
    largest_loss: f64,
    total_duration_secs: f64,
    total_bars: f64,
}

impl TradeStats {
    fn from_trades(trades: &[Trade]) -> Self {
        let mut stats = TradeStats::default();
        for trade in trades {
            let pnl = trade.pnl;
            if pnl > 0.0 {
                stats.won += 1;
                stats.gross_profit += pnl;
                stats.largest_win = stats.largest_win.max(pnl);
            } else if pnl < 0.0 {
                stats.lost += 1;
                stats.gross_loss += pnl.abs();
                stats.largest_loss = stats.largest_loss.max(pnl.abs());
            }
            stats.total_duration_secs += trade.duration_secs as f64;
            stats.total_bars += trade.bars_held as f64;
        }
        stats
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 { numerator / denominator } else { 0.0 }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

fn elapsed_years(curve: &[EquityPoint]) -> f64 {
    match (curve.first(), curve.last()) {
        (Some(first), Some(last)) => (last.time - first.time).num_seconds() as f64 / SECONDS_PER_YEAR,
        _ => 0.0,
    }
}

/// Per-bar returns, starting from the initial capital.
fn periodic_returns(initial_capital: f64, curve: &[EquityPoint]) -> Vec<f64> {
    let mut prev = initial_capital;
    let mut returns = Vec::with_capacity(curve.len());
    for point in curve {
        returns.push(if prev > 0.0 { (point.equity - prev) / prev } else { 0.0 });
        prev = point.equity;
    }
    returns
}

/// Largest decline from a running peak, as a fraction of that peak.
fn compute_drawdown(initial_capital: f64, curve: &[EquityPoint]) -> f64 {
    let mut peak = initial_capital;
    let mut max_dd = 0.0_f64;
    for point in curve {
        if point.equity > peak {
            peak = point.equity;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak);
        }
    }
    max_dd
}

struct RiskAdjusted {
    volatility: f64,
    sharpe: f64,
    sortino: f64,
}

fn compute_risk_adjusted(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> RiskAdjusted {
    let zero = RiskAdjusted {
        volatility: 0.0,
        sharpe: 0.0,
        sortino: 0.0,
    };
    if returns.len() < 2 {
        return zero;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let volatility = variance.sqrt();
    if periods_per_year <= 0.0 {
        return RiskAdjusted { volatility, ..zero };
    }

    let period_rf = risk_free_rate / periods_per_year;
    let excess = mean - period_rf;
    let scale = periods_per_year.sqrt();

    let sharpe = if volatility > 0.0 {
        excess / volatility * scale
    } else {
        0.0
    };

    let downside = returns
        .iter()
        .map(|r| (r - period_rf).min(0.0).powi(2))
        .sum::<f64>()
        / n;
    let downside_dev = downside.sqrt();
    let sortino = if downside_dev > 0.0 {
        excess / downside_dev * scale
    } else {
        0.0
    };

    RiskAdjusted {
        volatility,
        sharpe: finite_or_zero(sharpe),
        sortino: finite_or_zero(sortino),
    }
}

/// Historical VaR: the loss at the `tail` quantile of trade P&L (nearest rank).
fn value_at_risk(trades: &[Trade], tail: f64) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let mut pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
    pnls.sort_by(f64::total_cmp);
    let rank = (tail * pnls.len() as f64 - 1e-9).ceil().max(1.0) as usize;
    let quantile = pnls[(rank - 1).min(pnls.len() - 1)];
    (-quantile).max(0.0)
}
