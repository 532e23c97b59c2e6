//! Backtest run lifecycle and bar loop.
//!
//! A run moves `CONFIGURED -> RUNNING -> {COMPLETED, FAILED, CANCELLED}`.
//! Config validation, range selection and override binding all happen before
//! `RUNNING`; a failure there goes straight to `FAILED` with no bar processed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config_validation::{select_range, validate_backtest_config};
use super::error::PinetraderError;
use super::execution::{check_triggers, enter, exit_position, EntryResult, ExecutionConfig, Fill};
use super::generator::{GeneratedStrategy, SignalSeries};
use super::metrics::{Annualization, MetricsReport};
use super::ohlcv::OhlcvBar;
use super::parameter::ParamValue;
use super::pine::StrategyHeader;
use super::portfolio::{EquityPoint, Portfolio};
use super::position::Trade;
use super::warning::Warning;

/// Exit reason of a position force-closed on the final bar.
pub const END_OF_DATA: &str = "end of data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbol: String,
    pub timeframe: String,
    /// First bar included (inclusive).
    pub start: NaiveDateTime,
    /// Last bar included (inclusive).
    pub end: NaiveDateTime,
    pub initial_capital: f64,
    pub commission_rate: f64,
    pub slippage_rate: f64,
    pub max_position_size: f64,
    pub risk_per_trade: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub risk_free_rate: f64,
    pub annualization: Annualization,
    pub overrides: BTreeMap<String, ParamValue>,
}

impl BacktestConfig {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Self {
        BacktestConfig {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            start,
            end,
            initial_capital: 10_000.0,
            commission_rate: 0.0,
            slippage_rate: 0.0,
            max_position_size: 1.0,
            risk_per_trade: 1.0,
            stop_loss_pct: 0.0,
            take_profit_pct: 0.0,
            risk_free_rate: 0.0,
            annualization: Annualization::default(),
            overrides: BTreeMap::new(),
        }
    }

    /// Take capital, commission and sizing defaults from a `strategy(...)` header.
    pub fn with_header(mut self, header: &StrategyHeader) -> Self {
        if let Some(capital) = header.initial_capital {
            self.initial_capital = capital;
        }
        if let Some(rate) = header.commission_rate {
            self.commission_rate = rate;
        }
        if let Some(size) = header.position_size {
            self.max_position_size = size;
        }
        self
    }

    pub fn execution(&self) -> ExecutionConfig {
        ExecutionConfig {
            commission_rate: self.commission_rate,
            slippage_rate: self.slippage_rate,
            max_position_size: self.max_position_size,
            risk_per_trade: self.risk_per_trade,
            stop_loss_pct: self.stop_loss_pct,
            take_profit_pct: self.take_profit_pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Configured,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Configured, RunState::Running)
                | (RunState::Configured, RunState::Failed)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Configured => "CONFIGURED",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation flag, checked once per bar.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Why a run ended in `FAILED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub message: String,
    pub exit_code: u8,
}

impl From<&PinetraderError> for RunFailure {
    fn from(err: &PinetraderError) -> Self {
        RunFailure {
            message: err.to_string(),
            exit_code: err.exit_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub state: RunState,
    /// Effective parameter values after overrides and clamping.
    pub parameters: BTreeMap<String, ParamValue>,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: MetricsReport,
    pub warnings: Vec<Warning>,
    pub bars_processed: usize,
    pub failure: Option<RunFailure>,
}

impl BacktestResult {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// One backtest of a shared strategy under one config.
#[derive(Debug)]
pub struct BacktestRun {
    strategy: Arc<GeneratedStrategy>,
    config: BacktestConfig,
    state: RunState,
}

struct Outcome {
    portfolio: Portfolio,
    warnings: Vec<Warning>,
    parameters: BTreeMap<String, ParamValue>,
    bars_processed: usize,
}

impl BacktestRun {
    pub fn new(strategy: Arc<GeneratedStrategy>, config: BacktestConfig) -> Self {
        BacktestRun {
            strategy,
            config,
            state: RunState::Configured,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    fn transition(&mut self, next: RunState) -> Result<(), PinetraderError> {
        if !self.state.can_transition_to(next) {
            return Err(PinetraderError::computation(
                "run lifecycle",
                format!("illegal transition {} -> {}", self.state, next),
                None,
            ));
        }
        debug!(from = %self.state, to = %next, "run state");
        self.state = next;
        Ok(())
    }

    /// Run to a terminal state. Errors never escape: they are captured in
    /// [`BacktestResult::failure`] alongside any trades recorded before them.
    pub fn execute(self, bars: &[OhlcvBar], cancel: &CancelToken) -> BacktestResult {
        self.execute_with_progress(bars, cancel, |_, _| {})
    }

    /// [`execute`](Self::execute), calling `on_bar(processed, total)` after
    /// every simulated bar. A cancel raised from `on_bar` takes effect before
    /// the next bar.
    pub fn execute_with_progress(
        mut self,
        bars: &[OhlcvBar],
        cancel: &CancelToken,
        mut on_bar: impl FnMut(usize, usize),
    ) -> BacktestResult {
        let mut outcome = Outcome {
            portfolio: Portfolio::new(self.config.initial_capital),
            warnings: Vec::new(),
            parameters: BTreeMap::new(),
            bars_processed: 0,
        };

        let failure = match self.simulate(bars, cancel, &mut outcome, &mut on_bar) {
            Ok(()) => None,
            Err(err) => {
                warn!(strategy = %self.strategy.name(), error = %err, "backtest failed");
                // every non-terminal state may fail
                self.state = RunState::Failed;
                Some(RunFailure::from(&err))
            }
        };

        let metrics = MetricsReport::compute(
            &outcome.portfolio.trades,
            &outcome.portfolio.equity_curve,
            self.config.initial_capital,
            self.config.risk_free_rate,
            self.config.annualization,
        );
        info!(
            strategy = %self.strategy.name(),
            state = %self.state,
            trades = metrics.total_trades,
            total_return_pct = metrics.total_return_pct,
            "backtest finished"
        );

        BacktestResult {
            strategy: self.strategy.name().to_string(),
            symbol: self.config.symbol,
            timeframe: self.config.timeframe,
            state: self.state,
            parameters: outcome.parameters,
            trades: outcome.portfolio.trades,
            equity_curve: outcome.portfolio.equity_curve,
            metrics,
            warnings: outcome.warnings,
            bars_processed: outcome.bars_processed,
            failure,
        }
    }

    fn simulate(
        &mut self,
        bars: &[OhlcvBar],
        cancel: &CancelToken,
        out: &mut Outcome,
        on_bar: &mut dyn FnMut(usize, usize),
    ) -> Result<(), PinetraderError> {
        validate_backtest_config(&self.config)?;
        let (offset, range) = select_range(bars, &self.config)?;
        let (binding, warnings) = self.strategy.bind(&self.config.overrides)?;
        for warning in &warnings {
            warn!(strategy = %self.strategy.name(), "{}", warning.message);
        }
        out.warnings = warnings;
        out.parameters = self
            .strategy
            .parameters()
            .iter()
            .map(|p| p.name.clone())
            .zip(binding.values().iter().cloned())
            .collect();

        self.transition(RunState::Running)?;
        info!(
            strategy = %self.strategy.name(),
            symbol = %self.config.symbol,
            bars = range.len(),
            "backtest running"
        );

        let signals = self.strategy.signals(range, &binding)?;
        let execution = self.config.execution();
        let last = range.len() - 1;
        let mut prev_time = None;

        for (i, bar) in range.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(bar = offset + i, "backtest cancelled");
                return self.transition(RunState::Cancelled);
            }
            check_bar(bar, prev_time, offset + i)?;
            prev_time = Some(bar.time);

            let step = Step {
                bar,
                local: i,
                index: offset + i,
                is_last: i == last,
            };
            step.apply(&mut out.portfolio, &signals, &execution);
            out.portfolio.mark(bar.time, bar.close);
            out.bars_processed += 1;
            on_bar(out.bars_processed, range.len());
        }

        self.transition(RunState::Completed)
    }
}

fn check_bar(
    bar: &OhlcvBar,
    prev_time: Option<NaiveDateTime>,
    index: usize,
) -> Result<(), PinetraderError> {
    let prices = [bar.open, bar.high, bar.low, bar.close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Err(PinetraderError::computation(
            "bar processing",
            "prices must be finite and positive",
            Some(index),
        ));
    }
    if !bar.volume.is_finite() || bar.volume < 0.0 {
        return Err(PinetraderError::computation(
            "bar processing",
            "volume must be finite and non-negative",
            Some(index),
        ));
    }
    if prev_time.is_some_and(|t| bar.time <= t) {
        return Err(PinetraderError::computation(
            "bar processing",
            "bars must be in ascending time order",
            Some(index),
        ));
    }
    Ok(())
}

/// One bar of the loop.
struct Step<'a> {
    bar: &'a OhlcvBar,
    /// Position within the selected range, used to index signals.
    local: usize,
    /// Position within the supplied bars, used for reporting.
    index: usize,
    is_last: bool,
}

impl Step<'_> {
    /// Stops and targets first, then the exit signal, then the forced close on
    /// the last bar. Entries wait for a bar that neither closed a position nor
    /// ends the data.
    fn apply(&self, portfolio: &mut Portfolio, signals: &SignalSeries, execution: &ExecutionConfig) {
        let mut closed = false;

        if portfolio.has_position() {
            let trigger: Option<&str> = check_triggers(portfolio, self.bar.close);
            let reason = trigger
                .or_else(|| {
                    signals.exit[self.local]
                        .then(|| signals.exit_reason(self.local).unwrap_or("exit"))
                })
                .or_else(|| self.is_last.then_some(END_OF_DATA));

            if let Some(reason) = reason {
                if let Some(trade) = exit_position(portfolio, self.fill(reason), execution) {
                    debug!(
                        bar = self.index,
                        side = %trade.side,
                        pnl = trade.pnl,
                        reason = %trade.exit_reason,
                        "closed position"
                    );
                }
                closed = true;
            }
        }

        if closed || self.is_last || portfolio.has_position() || !signals.entry[self.local] {
            return;
        }

        let reason = signals.entry_reason(self.local).unwrap_or("entry");
        match enter(portfolio, signals.side, self.fill(reason), execution) {
            EntryResult::Entered {
                quantity,
                fill_price,
                ..
            } => debug!(
                bar = self.index,
                side = %signals.side,
                quantity,
                fill_price,
                reason,
                "opened position"
            ),
            EntryResult::InsufficientCapital => {
                debug!(bar = self.index, "entry skipped: insufficient capital")
            }
        }
    }

    fn fill<'r>(&self, reason: &'r str) -> Fill<'r> {
        Fill {
            market_price: self.bar.close,
            time: self.bar.time,
            bar: self.index,
            reason,
        }
    }
}
