//! Pine Script front end.
//!
//! `lexer` → `parser` (typed [`ast`]) → `analyzer`, which resolves names and
//! produces a [`ParsedStrategy`]: declared parameters, indicator bindings and
//! entry/exit condition trees over them.

pub mod analyzer;
pub mod ast;
pub mod lexer;
pub mod parser;

pub use analyzer::{analyze, Analysis};

use crate::domain::error::PinetraderError;
use crate::domain::indicator::IndicatorKind;
use crate::domain::ohlcv::PriceField;
use crate::domain::parameter::ParameterSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Raw Pine text plus a display name. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategySource {
    pub name: String,
    pub text: String,
}

impl StrategySource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        StrategySource {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleRole {
    Entry,
    Exit,
}

impl fmt::Display for RuleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleRole::Entry => write!(f, "entry"),
            RuleRole::Exit => write!(f, "exit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossDir {
    Over,
    Under,
}

/// A resolved expression over price fields, parameters and indicator outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Number(f64),
    Bool(bool),
    Price(PriceField),
    Param(String),
    /// Named output of an indicator binding (`value` for single-output indicators).
    Output { binding: String, field: String },
    /// Value `offset` bars back.
    History { expr: Box<Node>, offset: Box<Node> },
    Neg(Box<Node>),
    Arith {
        op: ArithOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Compare {
        op: CmpOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Cross {
        dir: CrossDir,
        left: Box<Node>,
        right: Box<Node>,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
}

impl Node {
    pub fn and(self, other: Node) -> Node {
        Node::And(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Node {
        Node::Not(Box::new(self))
    }

    /// Call `visit` on this node and every descendant.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Node)) {
        visit(self);
        match self {
            Node::History { expr, offset } => {
                expr.walk(visit);
                offset.walk(visit);
            }
            Node::Neg(inner) | Node::Not(inner) => inner.walk(visit),
            Node::Arith { left, right, .. }
            | Node::Compare { left, right, .. }
            | Node::Cross { left, right, .. }
            | Node::And(left, right)
            | Node::Or(left, right) => {
                left.walk(visit);
                right.walk(visit);
            }
            Node::Number(_)
            | Node::Bool(_)
            | Node::Price(_)
            | Node::Param(_)
            | Node::Output { .. } => {}
        }
    }
}

fn fmt_number(v: f64) -> String {
    if v.is_nan() {
        "na".to_string()
    } else if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Number(v) => write!(f, "{}", fmt_number(*v)),
            Node::Bool(b) => write!(f, "{b}"),
            Node::Price(p) => write!(f, "{}", p.name()),
            Node::Param(name) => write!(f, "{name}"),
            Node::Output { binding, field } if field == "value" => write!(f, "{binding}"),
            Node::Output { binding, field } => write!(f, "{binding}.{field}"),
            Node::History { expr, offset } => write!(f, "{expr}[{offset}]"),
            Node::Neg(inner) => write!(f, "-{inner}"),
            Node::Arith { op, left, right } => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                    ArithOp::Mod => "%",
                };
                write!(f, "({left} {sym} {right})")
            }
            Node::Compare { op, left, right } => {
                let sym = match op {
                    CmpOp::Gt => ">",
                    CmpOp::Lt => "<",
                    CmpOp::Ge => ">=",
                    CmpOp::Le => "<=",
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                };
                write!(f, "{left} {sym} {right}")
            }
            Node::Cross { dir, left, right } => match dir {
                CrossDir::Over => write!(f, "crossover({left}, {right})"),
                CrossDir::Under => write!(f, "crossunder({left}, {right})"),
            },
            Node::And(l, r) => write!(f, "({l} and {r})"),
            Node::Or(l, r) => write!(f, "({l} or {r})"),
            Node::Not(inner) => write!(f, "not {inner}"),
        }
    }
}

/// One indicator evaluation, bound to a unique id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorUse {
    pub id: String,
    pub kind: IndicatorKind,
    /// One argument per signature slot, defaults filled in.
    pub args: Vec<Node>,
    pub line: usize,
}

impl fmt::Display for IndicatorUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "{} = {}({})", self.id, self.kind, args.join(", "))
    }
}

/// An entry or exit condition with the order id it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub role: RuleRole,
    /// Direction of an entry; exits carry none.
    pub side: Option<Side>,
    /// Order id (`strategy.entry` id, or the id closed; `all` for `close_all`).
    pub id: String,
    pub condition: Node,
    pub line: usize,
}

impl ConditionRule {
    /// Human-readable reason recorded on trades when this rule fires.
    pub fn label(&self) -> String {
        format!("{}: {}", self.id, self.condition)
    }
}

/// Settings read from the `strategy(...)` declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyHeader {
    pub title: String,
    pub initial_capital: Option<f64>,
    /// Commission as a fraction of traded value.
    pub commission_rate: Option<f64>,
    /// Position size as a fraction of equity.
    pub position_size: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedStrategy {
    pub name: String,
    pub version: Option<u32>,
    pub header: StrategyHeader,
    pub parameters: Vec<ParameterSpec>,
    pub indicators: Vec<IndicatorUse>,
    pub rules: Vec<ConditionRule>,
}

impl ParsedStrategy {
    pub fn entry_rules(&self) -> impl Iterator<Item = &ConditionRule> {
        self.rules.iter().filter(|r| r.role == RuleRole::Entry)
    }

    pub fn exit_rules(&self) -> impl Iterator<Item = &ConditionRule> {
        self.rules.iter().filter(|r| r.role == RuleRole::Exit)
    }

    /// Check the cross-reference invariants: unique parameter names and
    /// binding ids, and every reference resolving to an earlier definition.
    pub fn validate(&self) -> Result<(), PinetraderError> {
        let mut params = BTreeSet::new();
        for p in &self.parameters {
            if !params.insert(p.name.as_str()) {
                return Err(PinetraderError::conversion(
                    format!("duplicate parameter '{}'", p.name),
                    None,
                ));
            }
        }

        let mut bindings: Vec<&IndicatorUse> = Vec::new();
        for ind in &self.indicators {
            if bindings.iter().any(|b| b.id == ind.id) {
                return Err(PinetraderError::conversion(
                    format!("duplicate indicator binding '{}'", ind.id),
                    Some(ind.line),
                ));
            }
            if ind.args.len() != ind.kind.signature().len() {
                return Err(PinetraderError::conversion(
                    format!(
                        "{} expects {} arguments, got {}",
                        ind.kind,
                        ind.kind.signature().len(),
                        ind.args.len()
                    ),
                    Some(ind.line),
                ));
            }
            for arg in &ind.args {
                check_refs(arg, &params, &bindings, ind.line)?;
            }
            bindings.push(ind);
        }

        for rule in &self.rules {
            check_refs(&rule.condition, &params, &bindings, rule.line)?;
        }
        Ok(())
    }
}

fn check_refs(
    node: &Node,
    params: &BTreeSet<&str>,
    bindings: &[&IndicatorUse],
    line: usize,
) -> Result<(), PinetraderError> {
    let mut result = Ok(());
    node.walk(&mut |n| {
        if result.is_err() {
            return;
        }
        match n {
            Node::Param(name) if !params.contains(name.as_str()) => {
                result = Err(PinetraderError::conversion(
                    format!("unresolved parameter '{name}'"),
                    Some(line),
                ));
            }
            Node::Output { binding, field } => {
                let resolved = bindings
                    .iter()
                    .find(|b| &b.id == binding)
                    .is_some_and(|b| b.kind.outputs().contains(&field.as_str()));
                if !resolved {
                    result = Err(PinetraderError::conversion(
                        format!("unresolved indicator output '{binding}.{field}'"),
                        Some(line),
                    ));
                }
            }
            _ => {}
        }
    });
    result
}
