//! Pine syntax tree.
//!
//! The tree covers the statement and expression forms the analyzer can
//! reason about. Anything else is kept as [`StmtKind::Unsupported`] so the
//! analyzer can warn about it with its line number instead of failing.

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Color(String),
    /// Plain or dotted name: `rsi`, `close`, `strategy.long`.
    Ident(String),
    /// `[a, b, c]` list literal, e.g. an `options=` argument.
    List(Vec<Expr>),
    /// History reference `base[offset]`.
    Index {
        base: Box<Expr>,
        offset: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Arg>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// Set for `name = value` arguments.
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// 1-based source line.
    pub line: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// A bare expression, in practice a call such as `strategy(...)` or `plot(...)`.
    Expr(Expr),
    /// `x = expr` or `[a, b, c] = expr`; `var` and type keywords are dropped.
    Assign { targets: Vec<String>, value: Expr },
    /// `if` / `else if` chain with an optional `else` body.
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Vec<Stmt>,
    },
    /// Syntax outside the supported subset. `defines` lists the names the
    /// statement (or its block) assigns, which become unusable downstream.
    Unsupported { reason: String, defines: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub version: Option<u32>,
    pub statements: Vec<Stmt>,
}

impl Expr {
    /// Call name and arguments, when this is a call.
    pub fn as_call(&self) -> Option<(&str, &[Arg])> {
        match self {
            Expr::Call { name, args } => Some((name, args)),
            _ => None,
        }
    }
}

impl Arg {
    pub fn positional(value: Expr) -> Self {
        Arg { name: None, value }
    }
}

/// Look up a call argument by name, falling back to its position among the
/// unnamed arguments.
pub fn find_arg<'a>(args: &'a [Arg], name: &str, position: usize) -> Option<&'a Expr> {
    args.iter()
        .find(|a| a.name.as_deref() == Some(name))
        .or_else(|| args.iter().filter(|a| a.name.is_none()).nth(position))
        .map(|a| &a.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_arg_prefers_name_then_position() {
        let args = vec![
            Arg::positional(Expr::Int(14)),
            Arg {
                name: Some("title".into()),
                value: Expr::Str("Length".into()),
            },
            Arg::positional(Expr::Int(1)),
        ];
        assert_eq!(find_arg(&args, "defval", 0), Some(&Expr::Int(14)));
        assert_eq!(find_arg(&args, "title", 1), Some(&Expr::Str("Length".into())));
        assert_eq!(find_arg(&args, "minval", 1), Some(&Expr::Int(1)));
        assert_eq!(find_arg(&args, "maxval", 2), None);
    }
}
