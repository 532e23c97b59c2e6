//! Strategy generation: compiles a [`ParsedStrategy`] into an executable
//! [`GeneratedStrategy`].
//!
//! The generated strategy is an immutable value holding compiled indicator
//! programs and condition trees. `signals` is a pure function of the bars and
//! the parameter binding, so one instance can be shared across threads.

use crate::domain::error::PinetraderError;
use crate::domain::indicator::{compute, ArgSlot, IndicatorInputs, IndicatorKind, Series};
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::parameter::{bind_overrides, ParamBinding, ParamValue, ParameterSpec};
use crate::domain::pine::{ParsedStrategy, RuleRole, Side, StrategyHeader};
use crate::domain::signal_eval::{compile, Compiled, Frame, Layout};
use crate::domain::warning::Warning;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
struct IndicatorProgram {
    id: String,
    kind: IndicatorKind,
    args: Vec<Compiled>,
    /// Human-readable call, e.g. `rsi_1 = rsi(close, len)`.
    text: String,
}

#[derive(Debug, Clone, PartialEq)]
struct RuleProgram {
    label: String,
    condition: Compiled,
}

/// Entry/exit signals for one evaluation, one element per bar.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSeries {
    pub side: Side,
    pub entry: Vec<bool>,
    pub exit: Vec<bool>,
    /// Index into `entry_labels` of the first entry rule true on each bar.
    pub entry_fired: Vec<Option<usize>>,
    pub exit_fired: Vec<Option<usize>>,
    pub entry_labels: Vec<String>,
    pub exit_labels: Vec<String>,
}

impl SignalSeries {
    pub fn len(&self) -> usize {
        self.entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_empty()
    }

    /// Label of the entry rule that fired on bar `i`.
    pub fn entry_reason(&self, i: usize) -> Option<&str> {
        let idx = (*self.entry_fired.get(i)?)?;
        self.entry_labels.get(idx).map(String::as_str)
    }

    pub fn exit_reason(&self, i: usize) -> Option<&str> {
        let idx = (*self.exit_fired.get(i)?)?;
        self.exit_labels.get(idx).map(String::as_str)
    }
}

/// An executable strategy plus the parameter snapshot it was generated from.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedStrategy {
    name: String,
    version: Option<u32>,
    header: StrategyHeader,
    parameters: Vec<ParameterSpec>,
    side: Side,
    indicators: Vec<IndicatorProgram>,
    output_count: usize,
    entries: Vec<RuleProgram>,
    exits: Vec<RuleProgram>,
}

impl GeneratedStrategy {
    /// Compile `parsed`. Fails when no entry rule survives.
    pub fn generate(parsed: &ParsedStrategy) -> Result<(Self, Vec<Warning>), PinetraderError> {
        parsed.validate()?;
        let mut warnings = Vec::new();

        let has_long = parsed.entry_rules().any(|r| r.side == Some(Side::Long));
        let side = if has_long || parsed.entry_rules().next().is_none() {
            Side::Long
        } else {
            Side::Short
        };

        let mut layout = Layout::new(parsed.parameters.iter().map(|p| p.name.clone()).collect());
        let mut indicators = Vec::with_capacity(parsed.indicators.len());
        for usage in &parsed.indicators {
            let args = usage
                .args
                .iter()
                .map(|arg| compile(arg, &layout))
                .collect::<Result<Vec<_>, _>>()?;
            layout.add_outputs(&usage.id, usage.kind.outputs());
            indicators.push(IndicatorProgram {
                id: usage.id.clone(),
                kind: usage.kind,
                args,
                text: usage.to_string(),
            });
        }

        let traded_ids: BTreeSet<&str> = parsed
            .entry_rules()
            .filter(|r| r.side == Some(side))
            .map(|r| r.id.as_str())
            .collect();
        let opposite_ids: BTreeSet<&str> = parsed
            .entry_rules()
            .filter(|r| r.side != Some(side))
            .map(|r| r.id.as_str())
            .collect();

        let mut entries = Vec::new();
        let mut exits = Vec::new();
        for rule in &parsed.rules {
            let program = RuleProgram {
                label: rule.label(),
                condition: compile(&rule.condition, &layout)?,
            };
            match rule.role {
                RuleRole::Entry if rule.side == Some(side) => entries.push(program),
                RuleRole::Entry => {
                    // an opposite-side entry closes the traded position
                    exits.push(RuleProgram {
                        label: format!("{} (reversal): {}", rule.id, rule.condition),
                        ..program
                    });
                }
                RuleRole::Exit if opposite_ids.contains(rule.id.as_str()) && !traded_ids.contains(rule.id.as_str()) => {
                    warnings.push(Warning::ignored(
                        format!(
                            "exit rule '{}' closes {} entries, which are not traded; only {side} positions are opened",
                            rule.id,
                            opposite(side)
                        ),
                        rule.line,
                    ));
                }
                RuleRole::Exit => exits.push(program),
            }
        }

        if entries.is_empty() {
            return Err(PinetraderError::conversion("no usable entry condition", None));
        }

        let generated = GeneratedStrategy {
            name: parsed.name.clone(),
            version: parsed.version,
            header: parsed.header.clone(),
            parameters: parsed.parameters.clone(),
            side,
            indicators,
            output_count: layout.output_count(),
            entries,
            exits,
        };
        info!(
            strategy = %generated.name,
            side = %side,
            entries = generated.entries.len(),
            exits = generated.exits.len(),
            "generated strategy"
        );
        Ok((generated, warnings))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &StrategyHeader {
        &self.header
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn indicator_count(&self) -> usize {
        self.indicators.len()
    }

    /// Validate overrides against the parameter snapshot.
    pub fn bind(
        &self,
        overrides: &BTreeMap<String, ParamValue>,
    ) -> Result<(ParamBinding, Vec<Warning>), PinetraderError> {
        bind_overrides(&self.parameters, overrides)
    }

    /// Evaluate entry/exit signals over `bars`.
    pub fn signals(&self, bars: &[OhlcvBar], binding: &ParamBinding) -> Result<SignalSeries, PinetraderError> {
        if binding.len() != self.parameters.len() {
            return Err(PinetraderError::binding(
                &self.name,
                format!(
                    "binding has {} values for {} parameters",
                    binding.len(),
                    self.parameters.len()
                ),
            ));
        }

        let mut outputs: Vec<Series> = Vec::with_capacity(self.output_count);
        for program in &self.indicators {
            let frame = Frame {
                bars,
                params: binding.values(),
                outputs: &outputs,
            };
            let inputs = indicator_inputs(program, &frame)?;
            let series = compute(program.kind, bars, &inputs)?;
            debug!(indicator = %program.id, bars = bars.len(), "computed indicator");
            outputs.extend(series);
        }

        let frame = Frame {
            bars,
            params: binding.values(),
            outputs: &outputs,
        };
        let (entry, entry_fired) = combine(&self.entries, &frame)?;
        let (exit, exit_fired) = combine(&self.exits, &frame)?;

        Ok(SignalSeries {
            side: self.side,
            entry,
            exit,
            entry_fired,
            exit_fired,
            entry_labels: self.entries.iter().map(|r| r.label.clone()).collect(),
            exit_labels: self.exits.iter().map(|r| r.label.clone()).collect(),
        })
    }

    /// Deterministic program listing shown to users as the generated code.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        let version = self.version.map(|v| format!("v{v}")).unwrap_or_else(|| "v?".to_string());
        let _ = writeln!(out, "strategy \"{}\" (pine {version}, {} only)", self.header.title, self.side);

        let _ = writeln!(out, "\nparameters:");
        if self.parameters.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for p in &self.parameters {
            let _ = write!(out, "  {}: {} = {}", p.name, p.param_type, p.default);
            if p.min.is_some() || p.max.is_some() {
                let bound = |b: Option<f64>| b.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
                let _ = write!(out, " [{}, {}]", bound(p.min), bound(p.max));
            }
            if let Some(step) = p.step {
                let _ = write!(out, " step {step}");
            }
            if !p.options.is_empty() && !p.is_source() {
                let _ = write!(out, " options {:?}", p.options);
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "\nindicators:");
        if self.indicators.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for ind in &self.indicators {
            let _ = writeln!(out, "  {}", ind.text);
        }

        let _ = writeln!(out, "\nentry when any of:");
        for rule in &self.entries {
            let _ = writeln!(out, "  {}", rule.label);
        }
        let _ = writeln!(out, "\nexit when any of:");
        if self.exits.is_empty() {
            let _ = writeln!(out, "  (none; positions close at stop, target or end of data)");
        }
        for rule in &self.exits {
            let _ = writeln!(out, "  {}", rule.label);
        }
        out
    }
}

fn opposite(side: Side) -> Side {
    match side {
        Side::Long => Side::Short,
        Side::Short => Side::Long,
    }
}

fn indicator_inputs(program: &IndicatorProgram, frame: &Frame<'_>) -> Result<IndicatorInputs, PinetraderError> {
    let mut inputs = IndicatorInputs {
        source: None,
        lengths: Vec::new(),
        factor: None,
    };
    for (slot, arg) in program.kind.signature().iter().zip(&program.args) {
        match slot {
            ArgSlot::Source { .. } => inputs.source = Some(frame.number(arg)?),
            ArgSlot::Length => {
                let v = frame.scalar(arg)?;
                if !v.is_finite() || v < 1.0 || v.fract() != 0.0 {
                    return Err(PinetraderError::computation(
                        format!("indicator {}", program.id),
                        format!("period must be a positive integer, got {v}"),
                        None,
                    ));
                }
                inputs.lengths.push(v as usize);
            }
            ArgSlot::Factor { .. } => inputs.factor = Some(frame.scalar(arg)?),
        }
    }
    Ok(inputs)
}

/// OR the rules together, remembering which rule fired first on each bar.
/// Undefined collapses to false here.
fn combine(rules: &[RuleProgram], frame: &Frame<'_>) -> Result<(Vec<bool>, Vec<Option<usize>>), PinetraderError> {
    let n = frame.bars.len();
    let mut fired: Vec<Option<usize>> = vec![None; n];
    for (idx, rule) in rules.iter().enumerate() {
        let values = frame.condition(&rule.condition)?;
        for (slot, value) in fired.iter_mut().zip(values) {
            if slot.is_none() && value == Some(true) {
                *slot = Some(idx);
            }
        }
    }
    let flags = fired.iter().map(Option::is_some).collect();
    Ok((flags, fired))
}
