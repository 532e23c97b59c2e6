//! CLI integration tests: real strategy, INI and CSV files on disk driven
//! through `cli::run`.

mod common;

use clap::Parser;
use common::*;
use pinetrader::adapters::file_config_adapter::FileConfigAdapter;
use pinetrader::cli::{self, Cli};
use pinetrader::domain::config_validation::load_backtest_config;
use pinetrader::domain::conversion::convert_strict;
use pinetrader::domain::pine::StrategySource;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tempfile::TempDir;

const BACKTEST_INI: &str = r#"
[backtest]
symbol = SINE
timeframe = 1d
start = 2024-01-01
end = 2024-07-18
slippage_rate = 0.0005
risk_free_rate = 0.02

[parameters]
rsi_period = 10
"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(ini: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("rsi.pine"), RSI_STRATEGY).unwrap();
        fs::write(dir.path().join("bt.ini"), ini).unwrap();
        fs::write(dir.path().join("bars.csv"), bars_to_csv(&sine_bars(200))).unwrap();
        Workspace { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn run(&self, args: &[&str]) -> ExitCode {
        let mut argv = vec!["pinetrader".to_string()];
        argv.extend(args.iter().map(|a| a.replace("{dir}", &self.dir.path().to_string_lossy())));
        cli::run(Cli::try_parse_from(argv).unwrap())
    }
}

fn same_code(actual: ExitCode, expected: ExitCode) -> bool {
    format!("{actual:?}") == format!("{expected:?}")
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

mod config_loading {
    use super::*;

    #[test]
    fn ini_values_override_pine_header() {
        let ws = Workspace::new(BACKTEST_INI);
        let strategy = convert_strict(&StrategySource::new("rsi", RSI_STRATEGY))
            .unwrap()
            .strategy;
        let adapter = FileConfigAdapter::from_file(ws.path("bt.ini")).unwrap();
        let config = load_backtest_config(&adapter, strategy.header()).unwrap();

        assert_eq!(config.symbol, "SINE");
        assert_eq!(config.start, day(2024, 1, 1));
        assert_eq!(config.end, day(2024, 7, 18) + chrono::Duration::seconds(86_399));
        assert_eq!(config.initial_capital, 10_000.0);
        assert!((config.commission_rate - 0.001).abs() < 1e-12);
        assert!((config.slippage_rate - 0.0005).abs() < 1e-12);
        assert_eq!(config.overrides.len(), 1);
        assert_eq!(
            config.overrides["rsi_period"],
            pinetrader::domain::parameter::ParamValue::Number(10.0)
        );
    }
}

mod backtest_command {
    use super::*;

    #[test]
    fn writes_json_report() {
        let ws = Workspace::new(BACKTEST_INI);
        let code = ws.run(&[
            "backtest",
            "-s",
            "{dir}/rsi.pine",
            "-c",
            "{dir}/bt.ini",
            "-d",
            "{dir}/bars.csv",
            "-o",
            "{dir}/out/report.json",
        ]);
        assert!(same_code(code, ExitCode::SUCCESS));

        let json = read_json(&ws.path("out/report.json"));
        assert_eq!(json["strategy"], "RSI Strategy");
        assert_eq!(json["result"]["state"], "COMPLETED");
        assert_eq!(json["result"]["symbol"], "SINE");
        assert_eq!(json["result"]["bars_processed"], 200);
        assert_eq!(json["result"]["parameters"]["rsi_period"], 10.0);
        assert!(!json["result"]["trades"].as_array().unwrap().is_empty());
        assert!(json["monthly_returns"].as_array().unwrap().len() == 1);
    }

    #[test]
    fn set_flag_beats_ini_parameters() {
        let ws = Workspace::new(BACKTEST_INI);
        let code = ws.run(&[
            "backtest",
            "-s",
            "{dir}/rsi.pine",
            "-c",
            "{dir}/bt.ini",
            "-d",
            "{dir}/bars.csv",
            "--set",
            "rsi_period=21",
            "-o",
            "{dir}/report.json",
        ]);
        assert!(same_code(code, ExitCode::SUCCESS));
        let json = read_json(&ws.path("report.json"));
        assert_eq!(json["result"]["parameters"]["rsi_period"], 21.0);
    }

    #[test]
    fn data_dir_from_ini() {
        let ini = format!("{BACKTEST_INI}\n[data]\ndir = {{dir}}\n");
        let ws = Workspace::new("");
        fs::write(
            ws.path("bt.ini"),
            ini.replace("{dir}", &ws.dir.path().to_string_lossy()),
        )
        .unwrap();
        fs::copy(ws.path("bars.csv"), ws.path("SINE_1d.csv")).unwrap();

        let code = ws.run(&[
            "backtest",
            "-s",
            "{dir}/rsi.pine",
            "-c",
            "{dir}/bt.ini",
            "-o",
            "{dir}/report.json",
        ]);
        assert!(same_code(code, ExitCode::SUCCESS));
        assert!(ws.path("report.json").exists());
    }

    #[test]
    fn unknown_override_exits_with_binding_code() {
        let ws = Workspace::new(BACKTEST_INI);
        let code = ws.run(&[
            "backtest",
            "-s",
            "{dir}/rsi.pine",
            "-c",
            "{dir}/bt.ini",
            "-d",
            "{dir}/bars.csv",
            "--set",
            "length=5",
            "-o",
            "{dir}/report.json",
        ]);
        assert!(same_code(code, ExitCode::from(5)));
        let json = read_json(&ws.path("report.json"));
        assert_eq!(json["result"]["state"], "FAILED");
        assert_eq!(json["result"]["bars_processed"], 0);
    }

    #[test]
    fn missing_symbol_is_a_config_error() {
        let ws = Workspace::new("[backtest]\nstart = 2024-01-01\nend = 2024-02-01\n");
        let code = ws.run(&[
            "backtest",
            "-s",
            "{dir}/rsi.pine",
            "-c",
            "{dir}/bt.ini",
            "-d",
            "{dir}/bars.csv",
        ]);
        assert!(same_code(code, ExitCode::from(2)));
    }

    #[test]
    fn missing_data_source_is_a_config_error() {
        let ws = Workspace::new(BACKTEST_INI);
        let code = ws.run(&["backtest", "-s", "{dir}/rsi.pine", "-c", "{dir}/bt.ini"]);
        assert!(same_code(code, ExitCode::from(2)));
    }

    #[test]
    fn unreadable_csv_is_a_data_error() {
        let ws = Workspace::new(BACKTEST_INI);
        fs::write(ws.path("bars.csv"), "time,open,high,low,close,volume\n2024-01-01,1,1,1,x,1\n").unwrap();
        let code = ws.run(&[
            "backtest",
            "-s",
            "{dir}/rsi.pine",
            "-c",
            "{dir}/bt.ini",
            "-d",
            "{dir}/bars.csv",
        ]);
        assert!(same_code(code, ExitCode::from(3)));
    }
}

mod convert_command {
    use super::*;

    #[test]
    fn converts_recognized_strategy() {
        let ws = Workspace::new(BACKTEST_INI);
        let code = ws.run(&["convert", "{dir}/rsi.pine", "--listing"]);
        assert!(same_code(code, ExitCode::SUCCESS));
    }

    #[test]
    fn indicator_script_fails_conversion() {
        let ws = Workspace::new(BACKTEST_INI);
        fs::write(ws.path("ind.pine"), "indicator(\"x\")\nplot(close)\n").unwrap();
        let code = ws.run(&["convert", "{dir}/ind.pine", "--json"]);
        assert!(same_code(code, ExitCode::from(4)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let ws = Workspace::new(BACKTEST_INI);
        let code = ws.run(&["convert", "{dir}/nope.pine"]);
        assert!(same_code(code, ExitCode::from(1)));
    }
}

mod sweep_command {
    use super::*;

    #[test]
    fn writes_ranked_candidates() {
        let ws = Workspace::new(BACKTEST_INI);
        let code = ws.run(&[
            "sweep",
            "-s",
            "{dir}/rsi.pine",
            "-c",
            "{dir}/bt.ini",
            "-d",
            "{dir}/bars.csv",
            "--param",
            "rsi_period=10:20:5",
            "--param",
            "oversold=25,30",
            "--top",
            "3",
            "--threads",
            "2",
            "-o",
            "{dir}/sweep.json",
        ]);
        assert!(same_code(code, ExitCode::SUCCESS));

        let json = read_json(&ws.path("sweep.json"));
        assert_eq!(json["evaluated"], 6);
        assert_eq!(json["failed"], 0);
        let top = json["top"].as_array().unwrap();
        assert_eq!(top.len(), 3);
        let scores: Vec<f64> = top.iter().map(|c| c["score"].as_f64().unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn unknown_grid_parameter_fails() {
        let ws = Workspace::new(BACKTEST_INI);
        let code = ws.run(&[
            "sweep",
            "-s",
            "{dir}/rsi.pine",
            "-c",
            "{dir}/bt.ini",
            "-d",
            "{dir}/bars.csv",
            "--param",
            "length=1,2",
        ]);
        assert!(same_code(code, ExitCode::from(5)));
    }
}
