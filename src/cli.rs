//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::json_report_adapter::JsonReportAdapter;
use crate::domain::backtest::{BacktestConfig, BacktestResult, BacktestRun, CancelToken};
use crate::domain::config_validation::load_backtest_config;
use crate::domain::conversion::{convert, convert_strict, ConversionOutput};
use crate::domain::error::PinetraderError;
use crate::domain::generator::GeneratedStrategy;
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::optimizer::{grid_search, Objective, ParameterGrid, SweepOutcome};
use crate::domain::parameter::ParamValue;
use crate::domain::pine::StrategySource;
use crate::domain::runner::BacktestPool;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::report_port::ReportPort;

#[derive(Parser, Debug)]
#[command(
    name = "pinetrader",
    about = "Convert Pine Script strategies and backtest them"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert a Pine strategy and report its parameters, indicators and warnings
    Convert {
        file: PathBuf,
        /// Display name; defaults to the file stem
        #[arg(long)]
        name: Option<String>,
        /// Print the generated program listing
        #[arg(long)]
        listing: bool,
        /// Print the conversion result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a backtest
    Backtest {
        #[arg(short, long)]
        strategy: PathBuf,
        #[arg(short, long)]
        config: PathBuf,
        /// CSV file of bars; overrides the [data] section
        #[arg(short, long)]
        data: Option<PathBuf>,
        /// Parameter override, repeatable
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
        /// Write the result as a JSON report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Grid-search parameter values and rank the runs
    Sweep {
        #[arg(short, long)]
        strategy: PathBuf,
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        data: Option<PathBuf>,
        /// `name=min:max:step` or `name=a,b,c`, repeatable
        #[arg(long = "param", value_name = "GRID", required = true)]
        params: Vec<String>,
        #[arg(long, default_value = "total_return")]
        objective: Objective,
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// Worker threads; 0 uses all available cores
        #[arg(long, default_value_t = 0)]
        threads: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let outcome = match cli.command {
        Command::Convert {
            file,
            name,
            listing,
            json,
        } => run_convert(&file, name, listing, json),
        Command::Backtest {
            strategy,
            config,
            data,
            set,
            output,
        } => run_backtest(&strategy, &config, data.as_ref(), &set, output.as_ref()),
        Command::Sweep {
            strategy,
            config,
            data,
            params,
            objective,
            top,
            threads,
            output,
        } => run_sweep(SweepArgs {
            strategy: &strategy,
            config: &config,
            data: data.as_ref(),
            params: &params,
            objective,
            top,
            threads,
            output: output.as_ref(),
        }),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(&e)
        }
    }
}

fn read_source(path: &Path, name: Option<String>) -> Result<StrategySource, PinetraderError> {
    let text = fs::read_to_string(path)?;
    let name = name.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "strategy".to_string())
    });
    Ok(StrategySource::new(name, text))
}

fn print_conversion(output: &ConversionOutput) {
    println!("parameters ({}):", output.parameters.len());
    for p in &output.parameters {
        println!("  {}: {} = {}", p.name, p.param_type, p.default);
    }
    println!("indicators found: {}", output.indicators_found);
    if !output.warnings.is_empty() {
        println!("warnings ({}):", output.warnings.len());
        for w in &output.warnings {
            println!("  {w}");
        }
    }
}

fn run_convert(
    path: &Path,
    name: Option<String>,
    listing: bool,
    json: bool,
) -> Result<ExitCode, PinetraderError> {
    let source = read_source(path, name)?;
    let output = convert(&source);

    if json {
        let text = serde_json::to_string_pretty(&output).map_err(|e| PinetraderError::Report {
            reason: format!("failed to serialize conversion: {e}"),
        })?;
        println!("{text}");
    } else {
        println!("strategy: {}", source.name);
        print_conversion(&output);
        if listing {
            if let Some(text) = &output.listing {
                println!("\n{text}");
            }
        }
    }

    if output.success {
        return Ok(ExitCode::SUCCESS);
    }
    if !json {
        if let Some(reason) = &output.error {
            eprintln!("error: {reason}");
        }
    }
    Ok(ExitCode::from(4))
}

/// Convert strictly, printing parse errors with a caret under the column.
fn load_strategy(path: &Path) -> Result<Arc<GeneratedStrategy>, PinetraderError> {
    let source = read_source(path, None)?;
    let converted = convert_strict(&source).inspect_err(|e| {
        if let PinetraderError::Parse(p) = e {
            eprintln!("{}", p.display_with_context(&source.text));
        }
    })?;
    for w in &converted.warnings {
        eprintln!("warning: {w}");
    }
    eprintln!("Loaded strategy: {}", converted.strategy.name());
    Ok(Arc::new(converted.strategy))
}

fn load_config(
    path: &Path,
    strategy: &GeneratedStrategy,
) -> Result<(FileConfigAdapter, BacktestConfig), PinetraderError> {
    eprintln!("Loading config from {}", path.display());
    let adapter = FileConfigAdapter::from_file(path)?;
    let config = load_backtest_config(&adapter, strategy.header())?;
    Ok((adapter, config))
}

pub fn parse_assignment(raw: &str) -> Result<(String, ParamValue), PinetraderError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), ParamValue::parse_loose(value)))
        }
        _ => Err(PinetraderError::binding(raw, "expected NAME=VALUE")),
    }
}

/// `--data` wins, then `[data] path`, then `[data] dir`.
fn data_port(adapter: &dyn ConfigPort, data: Option<&PathBuf>) -> Result<CsvAdapter, PinetraderError> {
    if let Some(path) = data {
        return Ok(CsvAdapter::from_file(path.clone()));
    }
    if let Some(path) = adapter.get_string("data", "path") {
        return Ok(CsvAdapter::from_file(PathBuf::from(path.trim())));
    }
    if let Some(dir) = adapter.get_string("data", "dir") {
        return Ok(CsvAdapter::new(PathBuf::from(dir.trim())));
    }
    Err(PinetraderError::ConfigMissing {
        section: "data".to_string(),
        key: "path".to_string(),
    })
}

fn fetch_bars(
    adapter: &dyn ConfigPort,
    data: Option<&PathBuf>,
    config: &BacktestConfig,
) -> Result<Vec<OhlcvBar>, PinetraderError> {
    let port = data_port(adapter, data)?;
    let bars = port.fetch_ohlcv(&config.symbol, &config.timeframe, config.start, config.end)?;
    eprintln!(
        "Loaded {} bars for {} ({})",
        bars.len(),
        config.symbol,
        config.timeframe
    );
    Ok(bars)
}

fn print_summary(result: &BacktestResult) {
    let m = &result.metrics;
    println!(
        "\n=== {} on {} ({}) ===",
        result.strategy, result.symbol, result.timeframe
    );
    println!("State:            {}", result.state);
    println!("Bars Processed:   {}", result.bars_processed);
    println!("Final Equity:     {:.2}", m.final_equity);
    println!("Total Return:     {:.2}%", m.total_return_pct);
    println!("Annualized:       {:.2}%", m.annualized_return_pct);
    println!("Sharpe Ratio:     {:.2}", m.sharpe_ratio);
    println!("Sortino Ratio:    {:.2}", m.sortino_ratio);
    println!("Calmar Ratio:     {:.2}", m.calmar_ratio);
    println!("Max Drawdown:     -{:.1}%", m.max_drawdown_pct);
    println!("Total Trades:     {}", m.total_trades);
    println!("Win Rate:         {:.1}%", m.win_rate_pct);
    match m.profit_factor {
        Some(pf) => println!("Profit Factor:    {pf:.2}"),
        None => println!("Profit Factor:    n/a"),
    }
    println!("VaR 95% (trade):  {:.2}", m.value_at_risk_95);
    for w in &result.warnings {
        eprintln!("warning: {w}");
    }
}

fn run_backtest(
    strategy_path: &Path,
    config_path: &Path,
    data: Option<&PathBuf>,
    set: &[String],
    output_path: Option<&PathBuf>,
) -> Result<ExitCode, PinetraderError> {
    let strategy = load_strategy(strategy_path)?;
    let (adapter, mut config) = load_config(config_path, &strategy)?;
    for raw in set {
        let (name, value) = parse_assignment(raw)?;
        config.overrides.insert(name, value);
    }
    let bars = fetch_bars(&adapter, data, &config)?;

    let result = BacktestRun::new(Arc::clone(&strategy), config).execute(&bars, &CancelToken::new());
    print_summary(&result);

    if let Some(path) = output_path {
        JsonReportAdapter::new().write(&result, strategy.name(), path)?;
        eprintln!("Report written to {}", path.display());
    }

    match &result.failure {
        Some(failure) => {
            eprintln!("error: {}", failure.message);
            Ok(ExitCode::from(failure.exit_code))
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

struct SweepArgs<'a> {
    strategy: &'a Path,
    config: &'a Path,
    data: Option<&'a PathBuf>,
    params: &'a [String],
    objective: Objective,
    top: usize,
    threads: usize,
    output: Option<&'a PathBuf>,
}

fn print_sweep(outcome: &SweepOutcome) {
    println!(
        "\n=== Sweep: {} combinations, {} failed, ranked by {} ===",
        outcome.evaluated, outcome.failed, outcome.objective
    );
    for (rank, candidate) in outcome.top.iter().enumerate() {
        let params: Vec<String> = candidate
            .parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        println!(
            "{:>3}. score {:>10.4}  return {:>8.2}%  trades {:>4}  {}",
            rank + 1,
            candidate.score,
            candidate.metrics.total_return_pct,
            candidate.metrics.total_trades,
            params.join(" ")
        );
    }
}

fn run_sweep(args: SweepArgs<'_>) -> Result<ExitCode, PinetraderError> {
    let strategy = load_strategy(args.strategy)?;
    let (adapter, config) = load_config(args.config, &strategy)?;
    let grids = args
        .params
        .iter()
        .map(|p| ParameterGrid::parse(p))
        .collect::<Result<Vec<_>, _>>()?;
    let bars = Arc::new(fetch_bars(&adapter, args.data, &config)?);

    let pool = BacktestPool::new(args.threads)?;
    let outcome = grid_search(
        &pool,
        strategy,
        &config,
        bars,
        &grids,
        args.objective,
        args.top,
        &CancelToken::new(),
    )?;
    print_sweep(&outcome);

    if let Some(path) = args.output {
        let json = serde_json::to_string_pretty(&outcome).map_err(|e| PinetraderError::Report {
            reason: format!("failed to serialize sweep: {e}"),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        eprintln!("Sweep written to {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backtest_args() {
        let cli = Cli::try_parse_from([
            "pinetrader",
            "backtest",
            "-s",
            "rsi.pine",
            "-c",
            "bt.ini",
            "--set",
            "rsi_period=21",
            "--set",
            "useFilter=false",
        ])
        .unwrap();
        match cli.command {
            Command::Backtest { set, data, .. } => {
                assert_eq!(set, vec!["rsi_period=21", "useFilter=false"]);
                assert!(data.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sweep_requires_a_param() {
        assert!(Cli::try_parse_from(["pinetrader", "sweep", "-s", "a.pine", "-c", "b.ini"]).is_err());
        let cli = Cli::try_parse_from([
            "pinetrader",
            "sweep",
            "-s",
            "a.pine",
            "-c",
            "b.ini",
            "--param",
            "len=10:20:5",
            "--objective",
            "sharpe",
        ])
        .unwrap();
        match cli.command {
            Command::Sweep { objective, top, .. } => {
                assert_eq!(objective, Objective::Sharpe);
                assert_eq!(top, 10);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn assignment_parsing() {
        assert_eq!(
            parse_assignment("len = 21").unwrap(),
            ("len".to_string(), ParamValue::Number(21.0))
        );
        assert_eq!(
            parse_assignment("on=true").unwrap(),
            ("on".to_string(), ParamValue::Bool(true))
        );
        assert!(matches!(
            parse_assignment("=3"),
            Err(PinetraderError::ParameterBinding { .. })
        ));
        assert!(parse_assignment("novalue").is_err());
    }
}
