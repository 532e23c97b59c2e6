//! Domain error types.
//!
//! Fatal failures are variants of [`PinetraderError`]; recoverable findings
//! travel separately as [`Warning`](crate::domain::warning::Warning)s.

/// A syntax error with position information for Pine source.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error at line {line}, column {column}: {message}")]
pub struct ParseError {
    pub message: String,
    /// Byte offset into the source.
    pub position: usize,
    /// 1-based line number.
    pub line: usize,
    /// 1-based column number.
    pub column: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the offending column of its line.
    pub fn display_with_context(&self, input: &str) -> String {
        let source_line = input.lines().nth(self.line.saturating_sub(1)).unwrap_or("");
        let caret = " ".repeat(self.column.saturating_sub(1)) + "^";
        format!(
            "{source_line}\n{caret}\n{err}",
            source_line = source_line,
            caret = caret,
            err = self
        )
    }
}

/// Top-level error type for pinetrader.
#[derive(Debug, thiserror::Error)]
pub enum PinetraderError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("conversion failed{}: {reason}", line_suffix(.line))]
    Conversion { reason: String, line: Option<usize> },

    #[error("parameter binding error for '{name}': {reason}")]
    ParameterBinding { name: String, reason: String },

    #[error("invalid backtest config field '{field}': {reason}")]
    ConfigValidation { field: String, reason: String },

    #[error("computation error in {context}{}: {reason}", bar_suffix(.bar_index))]
    Computation {
        context: String,
        reason: String,
        bar_index: Option<usize>,
    },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("report error: {reason}")]
    Report { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

fn bar_suffix(bar_index: &Option<usize>) -> String {
    bar_index.map(|i| format!(" at bar {i}")).unwrap_or_default()
}

impl PinetraderError {
    pub fn conversion(reason: impl Into<String>, line: Option<usize>) -> Self {
        PinetraderError::Conversion {
            reason: reason.into(),
            line,
        }
    }

    pub fn binding(name: impl Into<String>, reason: impl Into<String>) -> Self {
        PinetraderError::ParameterBinding {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        PinetraderError::ConfigValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn computation(
        context: impl Into<String>,
        reason: impl Into<String>,
        bar_index: Option<usize>,
    ) -> Self {
        PinetraderError::Computation {
            context: context.into(),
            reason: reason.into(),
            bar_index,
        }
    }
}

impl PinetraderError {
    /// Stable process exit code for this error family.
    pub fn exit_code(&self) -> u8 {
        match self {
            PinetraderError::Io(_) => 1,
            PinetraderError::ConfigParse { .. }
            | PinetraderError::ConfigMissing { .. }
            | PinetraderError::ConfigInvalid { .. }
            | PinetraderError::ConfigValidation { .. } => 2,
            PinetraderError::Data { .. } => 3,
            PinetraderError::Parse(_) | PinetraderError::Conversion { .. } => 4,
            PinetraderError::ParameterBinding { .. } => 5,
            PinetraderError::Computation { .. } => 6,
            PinetraderError::Report { .. } => 7,
        }
    }
}

impl From<&PinetraderError> for std::process::ExitCode {
    fn from(err: &PinetraderError) -> Self {
        std::process::ExitCode::from(err.exit_code())
    }
}
