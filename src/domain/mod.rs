//! Core domain: Pine conversion, indicators, and the backtest engine.

pub mod ohlcv;
pub mod position;
pub mod portfolio;
pub mod execution;
pub mod indicator;
pub mod backtest;
pub mod metrics;
pub mod error;
pub mod warning;
pub mod parameter;
pub mod pine;
pub mod signal_eval;
pub mod generator;
pub mod conversion;
pub mod config_validation;
pub mod runner;
pub mod optimizer;
