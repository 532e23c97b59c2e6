//! Signal evaluation over compiled condition trees.
//!
//! # Evaluation Semantics
//!
//! - Numeric nodes evaluate to a whole [`Series`]; `NaN` marks undefined bars
//!   and arithmetic producing a non-finite value yields `NaN`.
//! - Boolean nodes evaluate to `Option<bool>` per bar (three-valued logic):
//!   a comparison with an undefined operand is `None`, `and`/`or` follow
//!   Kleene logic, `not None` stays `None`.
//! - `crossover`/`crossunder` need the previous bar and are `None` at bar 0.
//! - `x[n]` shifts by `n` bars; the first `n` bars are undefined.

use crate::domain::error::PinetraderError;
use crate::domain::indicator::Series;
use crate::domain::ohlcv::{price_series, OhlcvBar, PriceField};
use crate::domain::parameter::ParamValue;
use crate::domain::pine::{ArithOp, CmpOp, CrossDir, Node};

const EPSILON: f64 = 1e-9;

/// A condition or value tree with names resolved to slot indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Compiled {
    Const(f64),
    Flag(bool),
    Price(PriceField),
    /// Index into the parameter binding.
    Param(usize),
    /// Index into the computed indicator output slots.
    Output(usize),
    History {
        expr: Box<Compiled>,
        offset: Box<Compiled>,
    },
    Neg(Box<Compiled>),
    Arith {
        op: ArithOp,
        left: Box<Compiled>,
        right: Box<Compiled>,
    },
    Compare {
        op: CmpOp,
        left: Box<Compiled>,
        right: Box<Compiled>,
    },
    Cross {
        dir: CrossDir,
        left: Box<Compiled>,
        right: Box<Compiled>,
    },
    And(Box<Compiled>, Box<Compiled>),
    Or(Box<Compiled>, Box<Compiled>),
    Not(Box<Compiled>),
}

/// Name-to-slot mapping used when compiling a [`Node`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layout {
    params: Vec<String>,
    outputs: Vec<(String, String)>,
}

impl Layout {
    pub fn new(params: Vec<String>) -> Self {
        Layout {
            params,
            outputs: Vec::new(),
        }
    }

    /// Reserve one slot per output of `binding`; returns the first slot.
    pub fn add_outputs(&mut self, binding: &str, fields: &[&str]) -> usize {
        let first = self.outputs.len();
        for field in fields {
            self.outputs.push((binding.to_string(), field.to_string()));
        }
        first
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn param(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p == name)
    }

    fn output(&self, binding: &str, field: &str) -> Option<usize> {
        self.outputs.iter().position(|(b, f)| b == binding && f == field)
    }
}

/// Resolve every name in `node` against `layout`.
pub fn compile(node: &Node, layout: &Layout) -> Result<Compiled, PinetraderError> {
    let boxed = |n: &Box<Node>| compile(n, layout).map(Box::new);
    let compiled = match node {
        Node::Number(v) => Compiled::Const(*v),
        Node::Bool(b) => Compiled::Flag(*b),
        Node::Price(field) => Compiled::Price(*field),
        Node::Param(name) => Compiled::Param(
            layout
                .param(name)
                .ok_or_else(|| PinetraderError::conversion(format!("unresolved parameter '{name}'"), None))?,
        ),
        Node::Output { binding, field } => Compiled::Output(layout.output(binding, field).ok_or_else(|| {
            PinetraderError::conversion(format!("unresolved indicator output '{binding}.{field}'"), None)
        })?),
        Node::History { expr, offset } => Compiled::History {
            expr: boxed(expr)?,
            offset: boxed(offset)?,
        },
        Node::Neg(inner) => Compiled::Neg(boxed(inner)?),
        Node::Arith { op, left, right } => Compiled::Arith {
            op: *op,
            left: boxed(left)?,
            right: boxed(right)?,
        },
        Node::Compare { op, left, right } => Compiled::Compare {
            op: *op,
            left: boxed(left)?,
            right: boxed(right)?,
        },
        Node::Cross { dir, left, right } => Compiled::Cross {
            dir: *dir,
            left: boxed(left)?,
            right: boxed(right)?,
        },
        Node::And(l, r) => Compiled::And(boxed(l)?, boxed(r)?),
        Node::Or(l, r) => Compiled::Or(boxed(l)?, boxed(r)?),
        Node::Not(inner) => Compiled::Not(boxed(inner)?),
    };
    Ok(compiled)
}

/// Everything an expression can read while being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub bars: &'a [OhlcvBar],
    pub params: &'a [ParamValue],
    pub outputs: &'a [Series],
}

fn eval_error(reason: impl Into<String>) -> PinetraderError {
    PinetraderError::computation("signal evaluation", reason, None)
}

impl Frame<'_> {
    fn param(&self, idx: usize) -> Result<&ParamValue, PinetraderError> {
        self.params
            .get(idx)
            .ok_or_else(|| eval_error(format!("parameter slot {idx} is not bound")))
    }

    /// Value of a bar-independent expression (a literal, input, or arithmetic over them).
    pub fn scalar(&self, expr: &Compiled) -> Result<f64, PinetraderError> {
        match expr {
            Compiled::Const(v) => Ok(*v),
            Compiled::Param(idx) => self
                .param(*idx)?
                .as_number()
                .ok_or_else(|| eval_error(format!("parameter slot {idx} is not numeric"))),
            Compiled::Neg(inner) => Ok(-self.scalar(inner)?),
            Compiled::Arith { op, left, right } => Ok(arith(*op, self.scalar(left)?, self.scalar(right)?)),
            _ => Err(eval_error("expected a constant value")),
        }
    }

    pub fn number(&self, expr: &Compiled) -> Result<Series, PinetraderError> {
        let n = self.bars.len();
        match expr {
            Compiled::Const(v) => Ok(vec![*v; n]),
            Compiled::Price(field) => Ok(price_series(self.bars, *field)),
            Compiled::Param(idx) => match self.param(*idx)? {
                ParamValue::Number(v) => Ok(vec![*v; n]),
                ParamValue::Text(name) => match PriceField::from_name(name) {
                    Some(field) => Ok(price_series(self.bars, field)),
                    None => Err(eval_error(format!("'{name}' is not a price source"))),
                },
                ParamValue::Bool(_) => Err(eval_error(format!("parameter slot {idx} is not numeric"))),
            },
            Compiled::Output(slot) => self
                .outputs
                .get(*slot)
                .cloned()
                .ok_or_else(|| eval_error(format!("indicator output slot {slot} is not computed"))),
            Compiled::History { expr, offset } => {
                let shift = self.offset(offset)?;
                Ok(shifted(&self.number(expr)?, shift, f64::NAN))
            }
            Compiled::Neg(inner) => Ok(self.number(inner)?.into_iter().map(|v| -v).collect()),
            Compiled::Arith { op, left, right } => {
                let l = self.number(left)?;
                let r = self.number(right)?;
                Ok(l.iter().zip(&r).map(|(a, b)| arith(*op, *a, *b)).collect())
            }
            _ => Err(eval_error("expected a numeric expression, found a condition")),
        }
    }

    pub fn condition(&self, expr: &Compiled) -> Result<Vec<Option<bool>>, PinetraderError> {
        let n = self.bars.len();
        match expr {
            Compiled::Flag(b) => Ok(vec![Some(*b); n]),
            Compiled::Param(idx) => match self.param(*idx)? {
                ParamValue::Bool(b) => Ok(vec![Some(*b); n]),
                _ => Err(eval_error(format!("parameter slot {idx} is not boolean"))),
            },
            Compiled::History { expr, offset } => {
                let shift = self.offset(offset)?;
                Ok(shifted(&self.condition(expr)?, shift, None))
            }
            Compiled::Compare { op, left, right } => {
                let l = self.number(left)?;
                let r = self.number(right)?;
                Ok(l.iter().zip(&r).map(|(a, b)| compare(*op, *a, *b)).collect())
            }
            Compiled::Cross { dir, left, right } => {
                let l = self.number(left)?;
                let r = self.number(right)?;
                Ok((0..n).map(|i| cross(*dir, &l, &r, i)).collect())
            }
            Compiled::And(a, b) => {
                let a = self.condition(a)?;
                let b = self.condition(b)?;
                Ok(a.iter().zip(&b).map(|(x, y)| and3(*x, *y)).collect())
            }
            Compiled::Or(a, b) => {
                let a = self.condition(a)?;
                let b = self.condition(b)?;
                Ok(a.iter().zip(&b).map(|(x, y)| or3(*x, *y)).collect())
            }
            Compiled::Not(inner) => Ok(self.condition(inner)?.into_iter().map(|v| v.map(|b| !b)).collect()),
            _ => Err(eval_error("expected a condition, found a numeric expression")),
        }
    }

    fn offset(&self, expr: &Compiled) -> Result<usize, PinetraderError> {
        let v = self.scalar(expr)?;
        if v < 0.0 || v.fract() != 0.0 || !v.is_finite() {
            return Err(eval_error(format!("history offset must be a non-negative integer, got {v}")));
        }
        Ok(v as usize)
    }
}

fn shifted<T: Copy>(values: &[T], shift: usize, fill: T) -> Vec<T> {
    (0..values.len())
        .map(|i| if i >= shift { values[i - shift] } else { fill })
        .collect()
}

fn arith(op: ArithOp, a: f64, b: f64) -> f64 {
    let v = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    };
    if v.is_finite() { v } else { f64::NAN }
}

fn compare(op: CmpOp, a: f64, b: f64) -> Option<bool> {
    if a.is_nan() || b.is_nan() {
        return None;
    }
    Some(match op {
        CmpOp::Gt => a > b,
        CmpOp::Lt => a < b,
        CmpOp::Ge => a >= b,
        CmpOp::Le => a <= b,
        CmpOp::Eq => (a - b).abs() < EPSILON,
        CmpOp::Ne => (a - b).abs() >= EPSILON,
    })
}

fn cross(dir: CrossDir, left: &[f64], right: &[f64], i: usize) -> Option<bool> {
    if i == 0 {
        return None;
    }
    let (lc, rc, lp, rp) = (left[i], right[i], left[i - 1], right[i - 1]);
    if [lc, rc, lp, rp].iter().any(|v| v.is_nan()) {
        return None;
    }
    Some(match dir {
        CrossDir::Over => lc > rc && lp <= rp,
        CrossDir::Under => lc < rc && lp >= rp,
    })
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}
