//! Recoverable findings returned alongside successful results.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Syntax the analyzer recognizes as Pine but cannot convert.
    UnsupportedConstruct,
    /// A condition was dropped because it depends on an unsupported construct.
    DroppedCondition,
    /// A numeric override fell outside its declared bounds and was clamped.
    OutOfBoundsOverride,
    /// A strategy setting was understood but has no effect in this engine.
    IgnoredSetting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
    /// 1-based source line, when the warning points at Pine source.
    pub line: Option<usize>,
}

impl Warning {
    pub fn unsupported(message: impl Into<String>, line: usize) -> Self {
        Warning {
            kind: WarningKind::UnsupportedConstruct,
            message: message.into(),
            line: Some(line),
        }
    }

    pub fn dropped(message: impl Into<String>, line: usize) -> Self {
        Warning {
            kind: WarningKind::DroppedCondition,
            message: message.into(),
            line: Some(line),
        }
    }

    pub fn clamped(message: impl Into<String>) -> Self {
        Warning {
            kind: WarningKind::OutOfBoundsOverride,
            message: message.into(),
            line: None,
        }
    }

    pub fn ignored(message: impl Into<String>, line: usize) -> Self {
        Warning {
            kind: WarningKind::IgnoredSetting,
            message: message.into(),
            line: Some(line),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
