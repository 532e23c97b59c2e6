//! Pine source to executable strategy, as one call.

use crate::domain::error::PinetraderError;
use crate::domain::generator::GeneratedStrategy;
use crate::domain::parameter::ParameterSpec;
use crate::domain::pine::{analyze, StrategySource};
use crate::domain::warning::Warning;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Result record of a conversion, successful or not.
///
/// Parameters and warnings are reported even when generation fails after a
/// successful parse.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutput {
    pub success: bool,
    pub parameters: Vec<ParameterSpec>,
    pub indicators_found: usize,
    pub warnings: Vec<Warning>,
    /// Program listing of the generated strategy.
    pub listing: Option<String>,
    #[serde(skip)]
    pub generated: Option<Arc<GeneratedStrategy>>,
    pub error: Option<String>,
}

/// A successful conversion.
#[derive(Debug, Clone)]
pub struct Converted {
    pub strategy: GeneratedStrategy,
    pub warnings: Vec<Warning>,
}

/// Analyze and generate, failing on the first hard error.
pub fn convert_strict(source: &StrategySource) -> Result<Converted, PinetraderError> {
    let analysis = analyze(source)?;
    let (strategy, generation_warnings) = GeneratedStrategy::generate(&analysis.strategy)?;
    let mut warnings = analysis.warnings;
    warnings.extend(generation_warnings);
    Ok(Converted { strategy, warnings })
}

pub fn convert(source: &StrategySource) -> ConversionOutput {
    let analysis = match analyze(source) {
        Ok(analysis) => analysis,
        Err(err) => {
            warn!(strategy = %source.name, error = %err, "conversion failed");
            return ConversionOutput {
                success: false,
                parameters: Vec::new(),
                indicators_found: 0,
                warnings: Vec::new(),
                listing: None,
                generated: None,
                error: Some(err.to_string()),
            };
        }
    };

    let parsed = &analysis.strategy;
    let mut output = ConversionOutput {
        success: false,
        parameters: parsed.parameters.clone(),
        indicators_found: parsed.indicators.len(),
        warnings: analysis.warnings.clone(),
        listing: None,
        generated: None,
        error: None,
    };

    match GeneratedStrategy::generate(parsed) {
        Ok((generated, warnings)) => {
            output.warnings.extend(warnings);
            output.listing = Some(generated.listing());
            output.generated = Some(Arc::new(generated));
            output.success = true;
        }
        Err(err) => {
            warn!(strategy = %source.name, error = %err, "strategy generation failed");
            output.error = Some(err.to_string());
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::warning::WarningKind;

    #[test]
    fn recognized_strategy_converts_cleanly() {
        let src = r#"//@version=5
strategy("RSI")
rsi_period = input.int(14, "RSI Period")
oversold = input.int(30)
overbought = input.int(70)
r = ta.rsi(close, rsi_period)
if r < oversold
    strategy.entry("Long", strategy.long)
if r > overbought
    strategy.close("Long")
"#;
        let out = convert(&StrategySource::new("rsi", src));
        assert!(out.success, "{:?}", out.error);
        assert!(out.warnings.is_empty());
        assert_eq!(out.parameters.len(), 3);
        assert_eq!(out.indicators_found, 1);
        assert!(out.generated.is_some());
        assert!(out.listing.unwrap().contains("rsi_1"));
    }

    #[test]
    fn missing_declaration_reports_error() {
        let out = convert(&StrategySource::new("x", "len = input(14)\n"));
        assert!(!out.success);
        assert!(out.error.unwrap().contains("strategy(...)"));
        assert!(out.parameters.is_empty());
    }

    #[test]
    fn parameters_survive_generation_failure() {
        let src = r#"strategy("x")
len = input.int(10)
m = ta.sma(close, len)
ma2 = close > m ? m : close
strategy.entry("L", strategy.long, when=close > ma2)
"#;
        let out = convert(&StrategySource::new("x", src));
        assert!(!out.success);
        assert_eq!(out.parameters.len(), 1);
        assert_eq!(out.indicators_found, 1);
        assert!(out.error.unwrap().contains("no usable entry condition"));
        let kinds: Vec<WarningKind> = out.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![WarningKind::UnsupportedConstruct, WarningKind::DroppedCondition]
        );
    }

    #[test]
    fn strict_conversion_propagates_errors() {
        let err = convert_strict(&StrategySource::new("x", "indicator(\"x\")\n")).unwrap_err();
        assert!(matches!(err, PinetraderError::Conversion { .. }));
    }
}
