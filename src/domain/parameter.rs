//! Parameter registry: the declared inputs of a strategy and override binding.
//!
//! A [`ParameterSpec`] list is produced by the Pine analyzer and snapshotted
//! into every generated strategy. Callers bind overrides against that
//! snapshot with [`bind_overrides`], which yields one concrete value per
//! parameter, in declaration order.

use crate::domain::error::PinetraderError;
use crate::domain::ohlcv::PriceField;
use crate::domain::warning::Warning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ParamType {
    Number { integer: bool },
    Boolean,
    Enum,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Number { integer: true } => write!(f, "int"),
            ParamType::Number { integer: false } => write!(f, "float"),
            ParamType::Boolean => write!(f, "bool"),
            ParamType::Enum => write!(f, "enum"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a loosely typed value from the command line or an INI file:
    /// `true`/`false`, then a number, otherwise text.
    pub fn parse_loose(raw: &str) -> Self {
        let raw = raw.trim();
        match raw {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => raw
                .parse::<f64>()
                .map(ParamValue::Number)
                .unwrap_or_else(|_| ParamValue::Text(raw.trim_matches('"').to_string())),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Number(_) => "number",
            ParamValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Number(v) => write!(f, "{v}"),
            ParamValue::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

/// One declared strategy input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Variable name the input is assigned to; unique within a strategy.
    pub name: String,
    #[serde(flatten)]
    pub param_type: ParamType,
    pub default: ParamValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Display title, falling back to the name.
    pub title: String,
    pub description: String,
    pub group: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType, default: ParamValue) -> Self {
        let name = name.into();
        ParameterSpec {
            title: name.clone(),
            description: String::new(),
            name,
            param_type,
            default,
            min: None,
            max: None,
            step: None,
            options: Vec::new(),
            group: None,
        }
    }

    /// True for `input.source` style enums whose options are price fields.
    pub fn is_source(&self) -> bool {
        self.param_type == ParamType::Enum
            && !self.options.is_empty()
            && self.options.iter().all(|o| PriceField::from_name(o).is_some())
    }

    /// Check an override value against this spec.
    ///
    /// Returns the (possibly clamped) value and a warning when clamping happened.
    pub fn coerce(
        &self,
        value: &ParamValue,
    ) -> Result<(ParamValue, Option<Warning>), PinetraderError> {
        match (self.param_type, value) {
            (ParamType::Number { integer }, ParamValue::Number(v)) => {
                if !v.is_finite() {
                    return Err(PinetraderError::binding(&self.name, "value must be finite"));
                }
                if integer && v.fract() != 0.0 {
                    return Err(PinetraderError::binding(
                        &self.name,
                        format!("expected an integer, got {v}"),
                    ));
                }
                let lo = self.min.unwrap_or(f64::NEG_INFINITY);
                let hi = self.max.unwrap_or(f64::INFINITY);
                let clamped = v.clamp(lo, hi.max(lo));
                if clamped != *v {
                    let msg = format!(
                        "{}={} outside [{}, {}], clamped to {}",
                        self.name,
                        v,
                        fmt_bound(self.min),
                        fmt_bound(self.max),
                        clamped
                    );
                    warn!(parameter = %self.name, value = v, clamped, "override out of bounds");
                    return Ok((ParamValue::Number(clamped), Some(Warning::clamped(msg))));
                }
                Ok((ParamValue::Number(*v), None))
            }
            (ParamType::Boolean, ParamValue::Bool(b)) => Ok((ParamValue::Bool(*b), None)),
            (ParamType::Enum, ParamValue::Text(s)) => {
                if !self.options.is_empty() && !self.options.iter().any(|o| o == s) {
                    return Err(PinetraderError::binding(
                        &self.name,
                        format!("'{}' is not one of [{}]", s, self.options.join(", ")),
                    ));
                }
                Ok((ParamValue::Text(s.clone()), None))
            }
            (expected, got) => Err(PinetraderError::binding(
                &self.name,
                format!("expected {expected}, got {}", got.type_name()),
            )),
        }
    }
}

fn fmt_bound(bound: Option<f64>) -> String {
    bound.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Concrete values for every parameter of a strategy, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBinding {
    values: Vec<ParamValue>,
}

impl ParamBinding {
    pub fn defaults(specs: &[ParameterSpec]) -> Self {
        ParamBinding {
            values: specs.iter().map(|s| s.default.clone()).collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&ParamValue> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Bind caller overrides against a parameter snapshot.
///
/// Unknown names and wrong types are errors; out-of-range numbers are clamped
/// and reported as warnings. Parameters without an override keep their default.
pub fn bind_overrides(
    specs: &[ParameterSpec],
    overrides: &BTreeMap<String, ParamValue>,
) -> Result<(ParamBinding, Vec<Warning>), PinetraderError> {
    let mut binding = ParamBinding::defaults(specs);
    let mut warnings = Vec::new();

    for (name, value) in overrides {
        let index = specs
            .iter()
            .position(|s| &s.name == name)
            .ok_or_else(|| PinetraderError::binding(name, "unknown parameter"))?;
        let (value, warning) = specs[index].coerce(value)?;
        binding.values[index] = value;
        warnings.extend(warning);
    }

    Ok((binding, warnings))
}
