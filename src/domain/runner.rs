//! Shared strategy cache and a bounded pool for independent backtests.

use std::sync::Arc;

use dashmap::DashMap;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use super::backtest::{BacktestConfig, BacktestResult, BacktestRun, CancelToken};
use super::conversion::convert_strict;
use super::error::PinetraderError;
use super::generator::GeneratedStrategy;
use super::ohlcv::OhlcvBar;
use super::pine::StrategySource;
use super::warning::Warning;

/// A converted strategy plus the warnings its conversion produced.
#[derive(Debug, Clone)]
pub struct CachedStrategy {
    pub strategy: Arc<GeneratedStrategy>,
    pub warnings: Vec<Warning>,
}

/// Generated strategies keyed by source identity (name and text).
///
/// Entries are immutable and shared read-only across runs. Failed
/// conversions are not cached.
#[derive(Debug, Default)]
pub struct StrategyCache {
    entries: DashMap<StrategySource, CachedStrategy>,
}

impl StrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_convert(&self, source: &StrategySource) -> Result<CachedStrategy, PinetraderError> {
        if let Some(hit) = self.entries.get(source) {
            debug!(strategy = %source.name, "strategy cache hit");
            return Ok(hit.value().clone());
        }

        // converted outside any shard lock; a concurrent insert of the same
        // source wins and is equivalent
        let converted = convert_strict(source)?;
        let entry = CachedStrategy {
            strategy: Arc::new(converted.strategy),
            warnings: converted.warnings,
        };
        Ok(self
            .entries
            .entry(source.clone())
            .or_insert(entry)
            .value()
            .clone())
    }

    pub fn invalidate(&self, source: &StrategySource) -> bool {
        self.entries.remove(source).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One unit of work for [`BacktestPool`].
///
/// Each job carries its own [`CancelToken`]. Jobs built with a clone of one
/// token are cancelled together; a fresh token cancels only that job.
#[derive(Debug, Clone)]
pub struct BacktestJob {
    pub strategy: Arc<GeneratedStrategy>,
    pub config: BacktestConfig,
    pub bars: Arc<Vec<OhlcvBar>>,
    pub cancel: CancelToken,
}

impl BacktestJob {
    pub fn new(strategy: Arc<GeneratedStrategy>, config: BacktestConfig, bars: Arc<Vec<OhlcvBar>>) -> Self {
        BacktestJob {
            strategy,
            config,
            bars,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn execute(self) -> BacktestResult {
        BacktestRun::new(self.strategy, self.config).execute(&self.bars, &self.cancel)
    }
}

/// Runs backtests in parallel on a dedicated rayon pool.
///
/// The pool holds no run state; cancellation lives on each job.
pub struct BacktestPool {
    pool: ThreadPool,
}

impl BacktestPool {
    /// `threads == 0` sizes the pool to the available parallelism.
    pub fn new(threads: usize) -> Result<Self, PinetraderError> {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            threads
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("backtest-{i}"))
            .build()
            .map_err(|e| PinetraderError::computation("backtest pool", e.to_string(), None))?;
        debug!(threads, "backtest pool ready");
        Ok(BacktestPool { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run every job; results come back in job order.
    pub fn run_all(&self, jobs: Vec<BacktestJob>) -> Vec<BacktestResult> {
        let count = jobs.len();
        let results: Vec<BacktestResult> = self
            .pool
            .install(|| jobs.into_par_iter().map(BacktestJob::execute).collect());
        info!(jobs = count, threads = self.threads(), "backtest batch finished");
        results
    }

    pub fn run(&self, job: BacktestJob) -> BacktestResult {
        self.pool.install(|| job.execute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::RunState;
    use crate::domain::indicator::test_support::bars_from_closes;
    use crate::domain::parameter::ParamValue;

    const SOURCE: &str = r#"strategy("Threshold")
level = input.float(10.5, minval=0, maxval=100)
if close > level
    strategy.entry("L", strategy.long)
if close < level
    strategy.close("L")
"#;

    fn bars() -> Arc<Vec<OhlcvBar>> {
        let closes: Vec<f64> = (0..80).map(|i| 10.5 + (i as f64 * 0.25).sin()).collect();
        Arc::new(bars_from_closes(&closes))
    }

    fn job(strategy: &Arc<GeneratedStrategy>, bars: &Arc<Vec<OhlcvBar>>, level: f64) -> BacktestJob {
        let mut config = BacktestConfig::new("T", "1d", bars[0].time, bars[bars.len() - 1].time);
        config.overrides.insert("level".into(), ParamValue::Number(level));
        BacktestJob::new(Arc::clone(strategy), config, Arc::clone(bars))
    }

    #[test]
    fn cache_shares_one_instance() {
        let cache = StrategyCache::new();
        let source = StrategySource::new("t", SOURCE);
        let a = cache.get_or_convert(&source).unwrap();
        let b = cache.get_or_convert(&source).unwrap();
        assert!(Arc::ptr_eq(&a.strategy, &b.strategy));
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate(&source));
        let c = cache.get_or_convert(&source).unwrap();
        assert!(!Arc::ptr_eq(&a.strategy, &c.strategy));
        assert_eq!(*a.strategy, *c.strategy);
    }

    #[test]
    fn cache_does_not_keep_failures() {
        let cache = StrategyCache::new();
        let source = StrategySource::new("bad", "indicator(\"x\")\n");
        assert!(cache.get_or_convert(&source).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn pool_matches_sequential_runs() {
        let cache = StrategyCache::new();
        let strategy = cache
            .get_or_convert(&StrategySource::new("t", SOURCE))
            .unwrap()
            .strategy;
        let bars = bars();
        let jobs: Vec<BacktestJob> = [10.0, 10.5, 11.0, 9.8]
            .iter()
            .map(|&level| job(&strategy, &bars, level))
            .collect();

        let pool = BacktestPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);
        let parallel = pool.run_all(jobs.clone());

        let sequential: Vec<BacktestResult> = jobs
            .into_iter()
            .map(|j| BacktestRun::new(j.strategy, j.config).execute(&j.bars, &CancelToken::new()))
            .collect();
        assert_eq!(parallel, sequential);
        assert!(parallel.iter().all(|r| r.state == RunState::Completed));
    }

    #[test]
    fn cancelled_job_leaves_its_siblings_running() {
        let strategy = StrategyCache::new()
            .get_or_convert(&StrategySource::new("t", SOURCE))
            .unwrap()
            .strategy;
        let bars = bars();
        let pool = BacktestPool::new(2).unwrap();
        let token = CancelToken::new();
        token.cancel();

        let results = pool.run_all(vec![
            job(&strategy, &bars, 10.5).with_cancel(token.clone()),
            job(&strategy, &bars, 10.0),
        ]);
        assert_eq!(results[0].state, RunState::Cancelled);
        assert_eq!(results[1].state, RunState::Completed);
    }

    #[test]
    fn cancellation_does_not_outlive_its_jobs() {
        let strategy = StrategyCache::new()
            .get_or_convert(&StrategySource::new("t", SOURCE))
            .unwrap()
            .strategy;
        let bars = bars();
        let pool = BacktestPool::new(1).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let first = pool.run(job(&strategy, &bars, 10.5).with_cancel(token));
        assert_eq!(first.state, RunState::Cancelled);

        let later = pool.run_all(vec![job(&strategy, &bars, 10.5), job(&strategy, &bars, 11.0)]);
        assert!(later.iter().all(|r| r.state == RunState::Completed));
        assert_eq!(pool.run(job(&strategy, &bars, 10.5)).state, RunState::Completed);
    }
}
