//! Pine analyzer: resolves the syntax tree into a [`ParsedStrategy`].
//!
//! # Degradation rules
//!
//! - A statement outside the supported subset yields an `UnsupportedConstruct`
//!   warning; the names it defines become *tainted*.
//! - An entry/exit condition that depends on a tainted name or on an
//!   unsupported construct is dropped with a `DroppedCondition` warning.
//! - A name defined nowhere is a hard conversion error, as is a script
//!   without a `strategy(...)` declaration.

use crate::domain::error::PinetraderError;
use crate::domain::indicator::{ArgSlot, IndicatorKind};
use crate::domain::ohlcv::PriceField;
use crate::domain::parameter::{ParamType, ParamValue, ParameterSpec};
use crate::domain::pine::ast::{find_arg, Arg, BinaryOp, Expr, Program, Stmt, StmtKind, UnaryOp};
use crate::domain::pine::parser::parse_program;
use crate::domain::pine::{
    ArithOp, CmpOp, ConditionRule, CrossDir, IndicatorUse, Node, ParsedStrategy, RuleRole, Side,
    StrategyHeader, StrategySource,
};
use crate::domain::warning::Warning;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Calls with no effect on trading, accepted and ignored.
const COSMETIC_CALLS: [&str; 12] = [
    "plot",
    "plotshape",
    "plotchar",
    "plotarrow",
    "plotcandle",
    "hline",
    "fill",
    "bgcolor",
    "barcolor",
    "alertcondition",
    "alert",
    "label.new",
];

/// Built-in series the engine cannot provide.
const UNSUPPORTED_BUILTINS: [&str; 10] = [
    "bar_index",
    "last_bar_index",
    "time",
    "timenow",
    "dayofweek",
    "dayofmonth",
    "hour",
    "minute",
    "month",
    "year",
];

const BUILTIN_NAMESPACES: [&str; 12] = [
    "strategy.",
    "syminfo.",
    "timeframe.",
    "barstate.",
    "session.",
    "math.",
    "ta.",
    "color.",
    "request.",
    "str.",
    "array.",
    "input.",
];

/// Analyzer output: the strategy plus every recoverable finding.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub strategy: ParsedStrategy,
    pub warnings: Vec<Warning>,
}

/// Parse and analyze a Pine strategy.
pub fn analyze(source: &StrategySource) -> Result<Analysis, PinetraderError> {
    let program = parse_program(&source.text)?;
    let header_line = find_declaration(&program)?;

    let mut analyzer = Analyzer::new();
    for stmt in &program.statements {
        analyzer.statement(stmt, &Guard::Always, header_line)?;
    }

    let mut header = analyzer.header.unwrap_or_default();
    if header.title.is_empty() {
        header.title = source.name.clone();
    }
    let strategy = ParsedStrategy {
        name: source.name.clone(),
        version: program.version,
        header,
        parameters: analyzer.parameters,
        indicators: analyzer.indicators,
        rules: analyzer.rules,
    };
    strategy.validate()?;

    info!(
        strategy = %strategy.name,
        parameters = strategy.parameters.len(),
        indicators = strategy.indicators.len(),
        rules = strategy.rules.len(),
        warnings = analyzer.warnings.len(),
        "analyzed pine strategy"
    );

    Ok(Analysis {
        strategy,
        warnings: analyzer.warnings,
    })
}

/// Line of the top-level `strategy(...)` call.
///
/// A script that tokenizes and parses but has no recognizable strategy
/// declaration fails here with [`PinetraderError::Conversion`], the same
/// exit code (4) as a syntax error. Indicator, study and library scripts
/// are named in the message.
fn find_declaration(program: &Program) -> Result<usize, PinetraderError> {
    for stmt in &program.statements {
        if let StmtKind::Expr(Expr::Call { name, .. }) = &stmt.kind {
            match name.as_str() {
                "strategy" => return Ok(stmt.line),
                "indicator" | "study" | "library" => {
                    return Err(PinetraderError::conversion(
                        format!("script declares '{name}', not a strategy"),
                        Some(stmt.line),
                    ));
                }
                _ => {}
            }
        }
    }
    Err(PinetraderError::conversion(
        "no recognizable strategy declaration: expected a top-level strategy(...) call",
        None,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Num,
    Bool,
}

#[derive(Debug, Clone)]
enum Symbol {
    Param(usize),
    Value(Node, Ty),
    /// Defined by an unsupported statement at `line`.
    Tainted { line: usize },
}

/// Why an expression could not be lowered.
#[derive(Debug, Clone)]
enum Failure {
    Unsupported(String),
    Tainted { name: String, line: usize },
    Unresolved(String),
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Failure::Unsupported(reason) => reason.clone(),
            Failure::Tainted { name, line } => {
                format!("depends on '{name}', which is unsupported (line {line})")
            }
            Failure::Unresolved(name) => format!("unresolved reference '{name}'"),
        }
    }
}

fn unsupported<T>(reason: impl Into<String>) -> Result<T, Failure> {
    Err(Failure::Unsupported(reason.into()))
}

/// Condition under which statements inside `if` blocks run.
#[derive(Debug, Clone)]
enum Guard {
    Always,
    When(Node),
    Broken(String),
}

impl Guard {
    fn and(&self, cond: Result<Node, String>) -> Guard {
        match (self, cond) {
            (Guard::Broken(why), _) => Guard::Broken(why.clone()),
            (_, Err(why)) => Guard::Broken(why),
            (Guard::Always, Ok(node)) => Guard::When(node),
            (Guard::When(outer), Ok(node)) => Guard::When(outer.clone().and(node)),
        }
    }
}

struct Analyzer {
    symbols: BTreeMap<String, Symbol>,
    parameters: Vec<ParameterSpec>,
    indicators: Vec<IndicatorUse>,
    counters: BTreeMap<&'static str, usize>,
    rules: Vec<ConditionRule>,
    header: Option<StrategyHeader>,
    warnings: Vec<Warning>,
    /// Line of the statement being analyzed.
    line: usize,
}

impl Analyzer {
    fn new() -> Self {
        Analyzer {
            symbols: BTreeMap::new(),
            parameters: Vec::new(),
            indicators: Vec::new(),
            counters: BTreeMap::new(),
            rules: Vec::new(),
            header: None,
            warnings: Vec::new(),
            line: 0,
        }
    }

    fn warn_unsupported(&mut self, reason: &str, line: usize) {
        warn!(line, reason, "unsupported pine construct");
        self.warnings.push(Warning::unsupported(reason, line));
    }

    fn warn_ignored(&mut self, message: String, line: usize) {
        debug!(line, %message, "ignored pine setting");
        self.warnings.push(Warning::ignored(message, line));
    }

    fn taint(&mut self, names: &[String], line: usize) {
        for name in names {
            self.symbols.insert(name.clone(), Symbol::Tainted { line });
        }
    }

    /// Turn a lowering failure into a warning, or into an error when the
    /// name is defined nowhere.
    fn report(&mut self, failure: &Failure, line: usize) -> Result<(), PinetraderError> {
        match failure {
            Failure::Unresolved(name) => Err(PinetraderError::conversion(
                format!("unresolved reference '{name}'"),
                Some(line),
            )),
            Failure::Unsupported(reason) => {
                self.warn_unsupported(reason, line);
                Ok(())
            }
            Failure::Tainted { name, .. } => {
                debug!(line, name = %name, "statement depends on unsupported name");
                Ok(())
            }
        }
    }

    fn statement(&mut self, stmt: &Stmt, guard: &Guard, header_line: usize) -> Result<(), PinetraderError> {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Unsupported { reason, defines } => {
                self.warn_unsupported(reason, stmt.line);
                self.taint(defines, stmt.line);
                Ok(())
            }
            StmtKind::Assign { targets, .. } if !matches!(guard, Guard::Always) => {
                self.warn_unsupported("assignments inside 'if' blocks are not supported", stmt.line);
                self.taint(targets, stmt.line);
                Ok(())
            }
            StmtKind::Assign { targets, value } => self.assign(targets, value, stmt.line),
            StmtKind::If {
                branches,
                otherwise,
            } => {
                let mut previous: Vec<Node> = Vec::new();
                let mut broken = None;
                for (cond, body) in branches {
                    let lowered = match self.lower_bool(cond) {
                        Ok(node) => Ok(node),
                        Err(failure) => {
                            self.report(&failure, stmt.line)?;
                            Err(failure.describe())
                        }
                    };
                    let branch_guard = match (&broken, lowered) {
                        (Some(why), _) => Guard::Broken(format!("earlier branch {why}")),
                        (None, Err(why)) => {
                            broken = Some(why.clone());
                            Guard::Broken(why)
                        }
                        (None, Ok(node)) => {
                            let cond = exclude(&previous, node.clone());
                            previous.push(node);
                            Guard::When(cond)
                        }
                    };
                    let combined = guard.and(match branch_guard {
                        Guard::When(node) => Ok(node),
                        Guard::Broken(why) => Err(why),
                        Guard::Always => Ok(Node::Bool(true)),
                    });
                    for inner in body {
                        self.statement(inner, &combined, header_line)?;
                    }
                }
                if !otherwise.is_empty() {
                    let cond = match &broken {
                        Some(why) => Err(format!("earlier branch {why}")),
                        None => Ok(exclude(&previous, Node::Bool(true))),
                    };
                    let combined = guard.and(cond);
                    for inner in otherwise {
                        self.statement(inner, &combined, header_line)?;
                    }
                }
                Ok(())
            }
            StmtKind::Expr(expr) => self.call_statement(expr, stmt.line, guard, header_line),
        }
    }

    fn call_statement(
        &mut self,
        expr: &Expr,
        line: usize,
        guard: &Guard,
        header_line: usize,
    ) -> Result<(), PinetraderError> {
        let Some((name, args)) = expr.as_call() else {
            self.warn_unsupported("expression statement has no effect", line);
            return Ok(());
        };

        match name {
            "strategy" if line == header_line => {
                self.header = Some(self.strategy_header(args, line));
                Ok(())
            }
            "strategy.entry" => self.entry(args, line, guard),
            "strategy.close" | "strategy.close_all" => self.close(name, args, line, guard),
            "strategy.exit" => {
                self.warn_unsupported(
                    "strategy.exit orders are not supported; configure stop_loss_pct/take_profit_pct instead",
                    line,
                );
                Ok(())
            }
            n if COSMETIC_CALLS.contains(&n) => {
                debug!(line, call = n, "ignoring cosmetic call");
                Ok(())
            }
            n => {
                self.warn_unsupported(&format!("call to '{n}' is not supported"), line);
                Ok(())
            }
        }
    }

    fn strategy_header(&mut self, args: &[Arg], line: usize) -> StrategyHeader {
        let mut header = StrategyHeader {
            title: match find_arg(args, "title", 0) {
                Some(Expr::Str(s)) => s.clone(),
                _ => String::new(),
            },
            ..StrategyHeader::default()
        };

        header.initial_capital = find_arg(args, "initial_capital", usize::MAX).and_then(literal_number);

        let commission_type = named_ident(args, "commission_type");
        if let Some(value) = find_arg(args, "commission_value", usize::MAX).and_then(literal_number) {
            match commission_type {
                None | Some("strategy.commission.percent") => header.commission_rate = Some(value / 100.0),
                Some(other) => self.warn_ignored(
                    format!("commission_type={other} is ignored; commission is a percentage of trade value"),
                    line,
                ),
            }
        }

        let qty_type = named_ident(args, "default_qty_type");
        if let Some(value) = find_arg(args, "default_qty_value", usize::MAX).and_then(literal_number) {
            match qty_type {
                Some("strategy.percent_of_equity") => header.position_size = Some(value / 100.0),
                other => self.warn_ignored(
                    format!(
                        "default_qty_type={} is ignored; positions are sized as a fraction of equity",
                        other.unwrap_or("strategy.fixed")
                    ),
                    line,
                ),
            }
        }

        if find_arg(args, "pyramiding", usize::MAX)
            .and_then(literal_number)
            .is_some_and(|p| p > 0.0)
        {
            self.warn_ignored("pyramiding is ignored; at most one position is open".into(), line);
        }
        if find_arg(args, "slippage", usize::MAX).is_some() {
            self.warn_ignored("slippage is taken from the backtest config".into(), line);
        }
        header
    }

    fn entry(&mut self, args: &[Arg], line: usize, guard: &Guard) -> Result<(), PinetraderError> {
        let Some(Expr::Str(id)) = find_arg(args, "id", 0) else {
            self.warn_unsupported("strategy.entry needs a string id", line);
            return Ok(());
        };
        let side = match find_arg(args, "direction", 1).or_else(|| find_arg(args, "long", usize::MAX)) {
            Some(Expr::Ident(d)) if d == "strategy.long" => Side::Long,
            Some(Expr::Ident(d)) if d == "strategy.short" => Side::Short,
            Some(Expr::Bool(true)) => Side::Long,
            Some(Expr::Bool(false)) => Side::Short,
            _ => {
                self.warn_unsupported(&format!("strategy.entry '{id}' has no recognizable direction"), line);
                return Ok(());
            }
        };
        for setting in ["qty", "limit", "stop"] {
            if args.iter().any(|a| a.name.as_deref() == Some(setting)) {
                self.warn_ignored(
                    format!("{setting}= on strategy.entry '{id}' is ignored; orders fill at the bar close"),
                    line,
                );
            }
        }
        self.add_rule(RuleRole::Entry, Some(side), id.clone(), args, line, guard)
    }

    fn close(&mut self, name: &str, args: &[Arg], line: usize, guard: &Guard) -> Result<(), PinetraderError> {
        let id = if name == "strategy.close_all" {
            "all".to_string()
        } else {
            match find_arg(args, "id", 0) {
                Some(Expr::Str(id)) => id.clone(),
                _ => {
                    self.warn_unsupported("strategy.close needs a string id", line);
                    return Ok(());
                }
            }
        };
        self.add_rule(RuleRole::Exit, None, id, args, line, guard)
    }

    fn add_rule(
        &mut self,
        role: RuleRole,
        side: Option<Side>,
        id: String,
        args: &[Arg],
        line: usize,
        guard: &Guard,
    ) -> Result<(), PinetraderError> {
        let when = args
            .iter()
            .find(|a| a.name.as_deref() == Some("when"))
            .map(|a| &a.value);

        let condition = match when.map(|w| self.lower_bool(w)) {
            None => Ok(None),
            Some(Ok(node)) => Ok(Some(node)),
            Some(Err(failure)) => {
                self.report(&failure, line)?;
                Err(failure.describe())
            }
        };

        let condition = match (guard, condition) {
            (Guard::Broken(why), _) => Err(why.clone()),
            (_, Err(why)) => Err(why),
            (Guard::Always, Ok(None)) => Ok(Node::Bool(true)),
            (Guard::Always, Ok(Some(node))) => Ok(node),
            (Guard::When(g), Ok(None)) => Ok(g.clone()),
            (Guard::When(g), Ok(Some(node))) => Ok(g.clone().and(node)),
        };
        let condition = match condition {
            Ok(node) => node,
            Err(why) => {
                let msg = format!("{role} rule '{id}' dropped: {why}");
                warn!(line, %msg, "dropping condition");
                self.warnings.push(Warning::dropped(msg, line));
                return Ok(());
            }
        };

        debug!(line, %role, id = %id, %condition, "recognized rule");
        self.rules.push(ConditionRule {
            role,
            side,
            id,
            condition,
            line,
        });
        Ok(())
    }

    fn assign(&mut self, targets: &[String], value: &Expr, line: usize) -> Result<(), PinetraderError> {
        if let [target] = targets {
            if let Some((name, args)) = value.as_call() {
                if name == "input" || name.starts_with("input.") {
                    return match self.declare_input(target, name, args) {
                        Ok(()) => Ok(()),
                        Err(failure) => {
                            self.report(&failure, line)?;
                            self.taint(targets, line);
                            Ok(())
                        }
                    };
                }
            }
            return match self.lower(value) {
                Ok((node, ty)) => {
                    debug!(line, name = %target, value = %node, "bound variable");
                    self.symbols.insert(target.clone(), Symbol::Value(node, ty));
                    Ok(())
                }
                Err(failure) => {
                    self.report(&failure, line)?;
                    self.taint(targets, line);
                    Ok(())
                }
            };
        }

        match self.tuple(targets, value) {
            Ok(()) => Ok(()),
            Err(failure) => {
                self.report(&failure, line)?;
                self.taint(targets, line);
                Ok(())
            }
        }
    }

    fn tuple(&mut self, targets: &[String], value: &Expr) -> Result<(), Failure> {
        let Some((name, args)) = value.as_call() else {
            return unsupported("tuple assignment needs a multi-output indicator call");
        };
        let Some(kind) = IndicatorKind::from_pine(name) else {
            return unsupported(format!("tuple assignment from '{name}' is not supported"));
        };
        let outputs = kind.outputs();
        if outputs.len() != targets.len() {
            return unsupported(format!(
                "{name} returns {} values, {} targets given",
                outputs.len(),
                targets.len()
            ));
        }
        let binding = self.register_indicator(kind, name, args)?;
        for (target, field) in targets.iter().zip(outputs) {
            if target == "_" {
                continue;
            }
            let node = Node::Output {
                binding: binding.clone(),
                field: field.to_string(),
            };
            self.symbols.insert(target.clone(), Symbol::Value(node, Ty::Num));
        }
        Ok(())
    }

    fn declare_input(&mut self, target: &str, call: &str, args: &[Arg]) -> Result<(), Failure> {
        if self.parameters.iter().any(|p| p.name == target) {
            return unsupported(format!("input '{target}' is declared twice"));
        }

        let defval = find_arg(args, "defval", 0)
            .ok_or_else(|| Failure::Unsupported(format!("input '{target}' has no default value")))?;

        // v4 `input(..., type=input.integer)` names the type explicitly.
        let declared = match call {
            "input" => named_ident(args, "type"),
            other => Some(other),
        };
        let positional_bounds = matches!(call, "input.int" | "input.float");

        let mut spec = match (declared, defval) {
            (Some("input.int" | "input.integer"), value) | (None, value @ Expr::Int(_)) => {
                let v = literal_number(value)
                    .ok_or_else(|| Failure::Unsupported(format!("input '{target}' default must be a number")))?;
                if v.fract() != 0.0 {
                    return unsupported(format!("input '{target}' is an int with default {v}"));
                }
                ParameterSpec::new(target, ParamType::Number { integer: true }, ParamValue::Number(v))
            }
            (Some("input.float" | "input.price"), value)
            | (None, value @ (Expr::Float(_) | Expr::Unary { .. })) => {
                let v = literal_number(value)
                    .ok_or_else(|| Failure::Unsupported(format!("input '{target}' default must be a number")))?;
                ParameterSpec::new(target, ParamType::Number { integer: false }, ParamValue::Number(v))
            }
            (Some("input.bool"), Expr::Bool(b)) | (None, Expr::Bool(b)) => {
                ParameterSpec::new(target, ParamType::Boolean, ParamValue::Bool(*b))
            }
            (Some("input.string"), Expr::Str(s)) | (None, Expr::Str(s)) => {
                let mut spec = ParameterSpec::new(target, ParamType::Enum, ParamValue::Text(s.clone()));
                let options = find_arg(args, "options", if call == "input.string" { 2 } else { usize::MAX });
                if let Some(Expr::List(items)) = options {
                    spec.options = items
                        .iter()
                        .map(|item| match item {
                            Expr::Str(s) => Ok(s.clone()),
                            _ => unsupported(format!("input '{target}' options must be strings")),
                        })
                        .collect::<Result<_, _>>()?;
                }
                spec
            }
            (Some("input.source") | None, Expr::Ident(field)) => {
                let field = PriceField::from_name(field)
                    .ok_or_else(|| Failure::Unsupported(format!("source input '{target}' defaults to '{field}'")))?;
                let mut spec =
                    ParameterSpec::new(target, ParamType::Enum, ParamValue::Text(field.name().to_string()));
                spec.options = PriceField::ALL.iter().map(|f| f.name().to_string()).collect();
                spec
            }
            (Some(other), _) => return unsupported(format!("{other} inputs are not supported")),
            (None, _) => return unsupported(format!("input '{target}' has a non-literal default")),
        };

        if let Some(Expr::Str(title)) = find_arg(args, "title", 1) {
            spec.title = title.clone();
        }
        if let Some(Expr::Str(tooltip)) = find_arg(args, "tooltip", usize::MAX) {
            spec.description = tooltip.clone();
        }
        if let Some(Expr::Str(group)) = find_arg(args, "group", usize::MAX) {
            spec.group = Some(group.clone());
        }

        if matches!(spec.param_type, ParamType::Number { .. }) {
            let pos = |n: usize| if positional_bounds { n } else { usize::MAX };
            spec.min = find_arg(args, "minval", pos(2)).and_then(literal_number);
            spec.max = find_arg(args, "maxval", pos(3)).and_then(literal_number);
            spec.step = find_arg(args, "step", pos(4)).and_then(literal_number);
            if let Some(Expr::List(items)) = find_arg(args, "options", usize::MAX) {
                let values: Vec<f64> = items.iter().filter_map(literal_number).collect();
                spec.options = values.iter().map(|v| v.to_string()).collect();
                spec.min = values.iter().copied().reduce(f64::min);
                spec.max = values.iter().copied().reduce(f64::max);
            }
        }

        debug!(name = %spec.name, kind = %spec.param_type, default = %spec.default, "declared input");
        self.symbols
            .insert(target.to_string(), Symbol::Param(self.parameters.len()));
        self.parameters.push(spec);
        Ok(())
    }

    fn lower_bool(&mut self, expr: &Expr) -> Result<Node, Failure> {
        match self.lower(expr)? {
            (node, Ty::Bool) => Ok(node),
            (node, Ty::Num) => unsupported(format!("'{node}' is not a boolean condition")),
        }
    }

    fn lower_num(&mut self, expr: &Expr) -> Result<Node, Failure> {
        match self.lower(expr)? {
            (node, Ty::Num) => Ok(node),
            (node, Ty::Bool) => unsupported(format!("'{node}' is a condition, a number was expected")),
        }
    }

    /// A number known before any bar is processed: literals, inputs and arithmetic over them.
    fn lower_scalar(&mut self, expr: &Expr) -> Result<Node, Failure> {
        let node = self.lower_num(expr)?;
        let mut scalar = true;
        node.walk(&mut |n| {
            if matches!(n, Node::Price(_) | Node::Output { .. } | Node::History { .. }) {
                scalar = false;
            }
            if let Node::Param(name) = n {
                if self.parameters.iter().any(|p| &p.name == name && p.is_source()) {
                    scalar = false;
                }
            }
        });
        if scalar {
            Ok(node)
        } else {
            unsupported(format!("'{node}' must be a literal or an input"))
        }
    }

    fn lower(&mut self, expr: &Expr) -> Result<(Node, Ty), Failure> {
        match expr {
            Expr::Int(v) => Ok((Node::Number(*v as f64), Ty::Num)),
            Expr::Float(v) => Ok((Node::Number(*v), Ty::Num)),
            Expr::Bool(b) => Ok((Node::Bool(*b), Ty::Bool)),
            Expr::Str(_) | Expr::Color(_) => unsupported("string values in expressions are not supported"),
            Expr::List(_) => unsupported("list values in expressions are not supported"),
            Expr::Ident(name) => self.resolve(name),
            Expr::Index { base, offset } => {
                let (base, ty) = self.lower(base)?;
                let offset = self.lower_scalar(offset)?;
                Ok((
                    Node::History {
                        expr: Box::new(base),
                        offset: Box::new(offset),
                    },
                    ty,
                ))
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => match self.lower_num(operand)? {
                Node::Number(v) => Ok((Node::Number(-v), Ty::Num)),
                node => Ok((Node::Neg(Box::new(node)), Ty::Num)),
            },
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => Ok((self.lower_bool(operand)?.not(), Ty::Bool)),
            Expr::Binary { op, left, right } => self.lower_binary(*op, left, right),
            Expr::Call { name, args } => self.lower_call(name, args),
        }
    }

    fn lower_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<(Node, Ty), Failure> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let l = Box::new(self.lower_bool(left)?);
                let r = Box::new(self.lower_bool(right)?);
                let node = if op == BinaryOp::And {
                    Node::And(l, r)
                } else {
                    Node::Or(l, r)
                };
                Ok((node, Ty::Bool))
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                let op = match op {
                    BinaryOp::Add => ArithOp::Add,
                    BinaryOp::Sub => ArithOp::Sub,
                    BinaryOp::Mul => ArithOp::Mul,
                    BinaryOp::Div => ArithOp::Div,
                    _ => ArithOp::Mod,
                };
                let node = Node::Arith {
                    op,
                    left: Box::new(self.lower_num(left)?),
                    right: Box::new(self.lower_num(right)?),
                };
                Ok((node, Ty::Num))
            }
            _ => {
                let op = match op {
                    BinaryOp::Gt => CmpOp::Gt,
                    BinaryOp::Lt => CmpOp::Lt,
                    BinaryOp::Ge => CmpOp::Ge,
                    BinaryOp::Le => CmpOp::Le,
                    BinaryOp::Eq => CmpOp::Eq,
                    _ => CmpOp::Ne,
                };
                let node = Node::Compare {
                    op,
                    left: Box::new(self.lower_num(left)?),
                    right: Box::new(self.lower_num(right)?),
                };
                Ok((node, Ty::Bool))
            }
        }
    }

    fn resolve(&mut self, name: &str) -> Result<(Node, Ty), Failure> {
        if let Some(symbol) = self.symbols.get(name) {
            return match symbol {
                Symbol::Param(idx) => self.param_node(*idx),
                Symbol::Value(node, ty) => Ok((node.clone(), *ty)),
                Symbol::Tainted { line } => Err(Failure::Tainted {
                    name: name.to_string(),
                    line: *line,
                }),
            };
        }
        if let Some(field) = PriceField::from_name(name) {
            return Ok((Node::Price(field), Ty::Num));
        }
        if name == "na" {
            return Ok((Node::Number(f64::NAN), Ty::Num));
        }
        // v5 exposes these as built-in series variables
        if let Some(kind @ (IndicatorKind::Vwap | IndicatorKind::Obv)) = IndicatorKind::from_pine(name) {
            let binding = self.register_indicator(kind, name, &[])?;
            return Ok((output(binding), Ty::Num));
        }
        if UNSUPPORTED_BUILTINS.contains(&name) || BUILTIN_NAMESPACES.iter().any(|ns| name.starts_with(ns)) {
            return unsupported(format!("built-in '{name}' is not supported"));
        }
        Err(Failure::Unresolved(name.to_string()))
    }

    fn param_node(&self, idx: usize) -> Result<(Node, Ty), Failure> {
        let spec = &self.parameters[idx];
        let node = Node::Param(spec.name.clone());
        match spec.param_type {
            ParamType::Number { .. } => Ok((node, Ty::Num)),
            ParamType::Boolean => Ok((node, Ty::Bool)),
            ParamType::Enum if spec.is_source() => Ok((node, Ty::Num)),
            ParamType::Enum => unsupported(format!(
                "string input '{}' cannot be used in an expression",
                spec.name
            )),
        }
    }

    fn lower_call(&mut self, name: &str, args: &[Arg]) -> Result<(Node, Ty), Failure> {
        let bare = name.strip_prefix("ta.").unwrap_or(name);
        let bare = bare.strip_prefix("math.").unwrap_or(bare);
        let positional: Vec<&Expr> = args.iter().filter(|a| a.name.is_none()).map(|a| &a.value).collect();

        match bare {
            "crossover" | "crossunder" | "cross" => {
                let [a, b] = &positional[..] else {
                    return unsupported(format!("{name} expects two arguments"));
                };
                let left = self.lower_num(a)?;
                let right = self.lower_num(b)?;
                let cross = |dir| Node::Cross {
                    dir,
                    left: Box::new(left.clone()),
                    right: Box::new(right.clone()),
                };
                let node = match bare {
                    "crossover" => cross(CrossDir::Over),
                    "crossunder" => cross(CrossDir::Under),
                    _ => Node::Or(Box::new(cross(CrossDir::Over)), Box::new(cross(CrossDir::Under))),
                };
                Ok((node, Ty::Bool))
            }
            "change" => {
                let source = positional
                    .first()
                    .ok_or_else(|| Failure::Unsupported(format!("{name} expects a source")))?;
                let source = self.lower_num(source)?;
                let offset = match positional.get(1) {
                    Some(len) => self.lower_scalar(len)?,
                    None => Node::Number(1.0),
                };
                let node = Node::Arith {
                    op: ArithOp::Sub,
                    left: Box::new(source.clone()),
                    right: Box::new(Node::History {
                        expr: Box::new(source),
                        offset: Box::new(offset),
                    }),
                };
                Ok((node, Ty::Num))
            }
            "avg" => {
                if let Some(binding) = self.midpoint_idiom(&positional)? {
                    return Ok((output(binding), Ty::Num));
                }
                if positional.is_empty() {
                    return unsupported(format!("{name} expects arguments"));
                }
                let mut sum = self.lower_num(positional[0])?;
                for arg in &positional[1..] {
                    sum = Node::Arith {
                        op: ArithOp::Add,
                        left: Box::new(sum),
                        right: Box::new(self.lower_num(arg)?),
                    };
                }
                let node = Node::Arith {
                    op: ArithOp::Div,
                    left: Box::new(sum),
                    right: Box::new(Node::Number(positional.len() as f64)),
                };
                Ok((node, Ty::Num))
            }
            "sum" => match self.tsv_idiom(&positional)? {
                Some(binding) => Ok((output(binding), Ty::Num)),
                None => unsupported(format!(
                    "{name} is only supported as math.sum(volume * ta.change(close), length)"
                )),
            },
            _ if name == "input" || name.starts_with("input.") => {
                unsupported("inputs must be assigned directly to a variable")
            }
            _ => match IndicatorKind::from_pine(name) {
                Some(kind) if kind.outputs().len() == 1 => {
                    let binding = self.register_indicator(kind, name, args)?;
                    Ok((output(binding), Ty::Num))
                }
                Some(_) => unsupported(format!("{name} returns several values; assign it with [a, b, c] = {name}(...)")),
                None => unsupported(format!("call to '{name}' is not supported")),
            },
        }
    }

    /// `math.avg(ta.highest(high, n), ta.lowest(low, n))` in either order.
    fn midpoint_idiom(&mut self, positional: &[&Expr]) -> Result<Option<String>, Failure> {
        let [a, b] = positional else {
            return Ok(None);
        };
        let (Some(high_len), Some(low_len)) = (
            extreme_length(a, IndicatorKind::Highest, "high").or_else(|| extreme_length(b, IndicatorKind::Highest, "high")),
            extreme_length(a, IndicatorKind::Lowest, "low").or_else(|| extreme_length(b, IndicatorKind::Lowest, "low")),
        ) else {
            return Ok(None);
        };
        let high_len = self.lower_scalar(high_len)?;
        let low_len = self.lower_scalar(low_len)?;
        if high_len != low_len {
            return Ok(None);
        }
        self.bind(IndicatorKind::Midpoint, vec![high_len]).map(Some)
    }

    /// `math.sum(volume * ta.change(close), n)`.
    fn tsv_idiom(&mut self, positional: &[&Expr]) -> Result<Option<String>, Failure> {
        let [flow, len] = positional else {
            return Ok(None);
        };
        let Expr::Binary {
            op: BinaryOp::Mul,
            left,
            right,
        } = flow
        else {
            return Ok(None);
        };
        let is_volume = |e: &Expr| matches!(e, Expr::Ident(n) if n == "volume");
        let is_change = |e: &Expr| match e.as_call() {
            Some((n, args)) => {
                matches!(n, "ta.change" | "change")
                    && args.len() == 1
                    && matches!(&args[0].value, Expr::Ident(src) if src == "close")
            }
            None => false,
        };
        let (left, right): (&Expr, &Expr) = (left, right);
        let matched = (is_volume(left) && is_change(right)) || (is_change(left) && is_volume(right));
        if !matched {
            return Ok(None);
        }
        let len = self.lower_scalar(len)?;
        self.bind(IndicatorKind::Tsv, vec![len]).map(Some)
    }

    /// Map call arguments onto the indicator signature and bind the result.
    fn register_indicator(&mut self, kind: IndicatorKind, name: &str, args: &[Arg]) -> Result<String, Failure> {
        let signature = kind.signature();
        let arg_names = kind.arg_names();

        for arg in args {
            if let Some(n) = &arg.name {
                if !arg_names.contains(&n.as_str()) {
                    return unsupported(format!("argument '{n}' of {name} is not supported"));
                }
            }
        }
        let positional: Vec<&Expr> = args.iter().filter(|a| a.name.is_none()).map(|a| &a.value).collect();
        if positional.len() > signature.len() {
            return unsupported(format!("too many arguments to {name}"));
        }
        let source_omitted = matches!(signature.first(), Some(ArgSlot::Source { default: Some(_) }))
            && positional.len() < signature.len()
            && !args.iter().any(|a| a.name.as_deref() == Some(arg_names[0]));

        let mut cursor = 0;
        let mut resolved = Vec::with_capacity(signature.len());
        for (i, slot) in signature.iter().enumerate() {
            let named = args
                .iter()
                .find(|a| a.name.as_deref() == Some(arg_names[i]))
                .map(|a| &a.value);
            let given = match named {
                Some(expr) => Some(expr),
                None if i == 0 && source_omitted => None,
                None => {
                    cursor += 1;
                    positional.get(cursor - 1).copied()
                }
            };

            let node = match (slot, given) {
                (ArgSlot::Source { .. }, Some(expr)) => self.lower_num(expr)?,
                (ArgSlot::Source { default: Some(field) }, None) => Node::Price(*field),
                (ArgSlot::Length, Some(expr)) => {
                    let len = self.lower_scalar(expr)?;
                    if let Node::Number(v) = &len {
                        if *v < 1.0 || v.fract() != 0.0 {
                            return unsupported(format!("{name} length must be a positive integer, got {v}"));
                        }
                    }
                    len
                }
                (ArgSlot::Factor { .. }, Some(expr)) => self.lower_scalar(expr)?,
                (ArgSlot::Factor { default: Some(v) }, None) => Node::Number(*v),
                (_, None) => {
                    return unsupported(format!("{name} is missing its '{}' argument", arg_names[i]));
                }
            };
            resolved.push(node);
        }

        self.bind(kind, resolved)
    }

    /// Reuse an identical binding or create a new one.
    fn bind(&mut self, kind: IndicatorKind, args: Vec<Node>) -> Result<String, Failure> {
        if let Some(existing) = self.indicators.iter().find(|i| i.kind == kind && i.args == args) {
            return Ok(existing.id.clone());
        }
        let counter = self.counters.entry(kind.name()).or_insert(0);
        *counter += 1;
        let id = format!("{}_{}", kind.name(), counter);
        let usage = IndicatorUse {
            id: id.clone(),
            kind,
            args,
            line: self.line,
        };
        debug!(line = self.line, indicator = %usage, "bound indicator");
        self.indicators.push(usage);
        Ok(id)
    }
}

fn output(binding: String) -> Node {
    Node::Output {
        binding,
        field: "value".to_string(),
    }
}

/// `cond and not p1 and not p2 ...` for an `else if` / `else` branch.
fn exclude(previous: &[Node], cond: Node) -> Node {
    let mut guard: Option<Node> = None;
    for p in previous {
        let negated = p.clone().not();
        guard = Some(match guard {
            None => negated,
            Some(g) => g.and(negated),
        });
    }
    match (guard, cond) {
        (None, cond) => cond,
        (Some(g), Node::Bool(true)) => g,
        (Some(g), cond) => g.and(cond),
    }
}

/// Length argument of `ta.highest(len)` / `ta.highest(high, len)` style calls.
fn extreme_length<'e>(expr: &'e Expr, kind: IndicatorKind, field: &str) -> Option<&'e Expr> {
    let (name, args) = expr.as_call()?;
    if IndicatorKind::from_pine(name) != Some(kind) || args.iter().any(|a| a.name.is_some()) {
        return None;
    }
    match args {
        [len] => Some(&len.value),
        [src, len] if matches!(&src.value, Expr::Ident(s) if s == field) => Some(&len.value),
        _ => None,
    }
}

fn literal_number(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Int(v) => Some(*v as f64),
        Expr::Float(v) => Some(*v),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => literal_number(operand).map(|v| -v),
        _ => None,
    }
}

fn named_ident<'a>(args: &'a [Arg], name: &str) -> Option<&'a str> {
    match find_arg(args, name, usize::MAX) {
        Some(Expr::Ident(value)) => Some(value.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::warning::WarningKind;

    fn run(text: &str) -> Analysis {
        analyze(&StrategySource::new("test", text)).unwrap()
    }

    const RSI_STRATEGY: &str = r#"//@version=5
strategy("RSI Strategy", overlay=true, initial_capital=10000, commission_value=0.1)
rsi_period = input.int(14, "RSI Period", minval=2, maxval=50)
oversold = input.int(30, "Oversold")
overbought = input.int(70, "Overbought")
rsi = ta.rsi(close, rsi_period)
if rsi < oversold
    strategy.entry("Long", strategy.long)
if rsi > overbought
    strategy.close("Long")
plot(rsi)
"#;

    #[test]
    fn recognizes_rsi_strategy_without_warnings() {
        let analysis = run(RSI_STRATEGY);
        assert!(analysis.warnings.is_empty(), "{:?}", analysis.warnings);

        let s = &analysis.strategy;
        assert_eq!(s.version, Some(5));
        assert_eq!(s.header.title, "RSI Strategy");
        assert_eq!(s.header.initial_capital, Some(10000.0));
        assert!((s.header.commission_rate.unwrap() - 0.001).abs() < 1e-12);

        let names: Vec<&str> = s.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["rsi_period", "oversold", "overbought"]);
        assert_eq!(s.parameters[0].min, Some(2.0));
        assert_eq!(s.parameters[0].max, Some(50.0));
        assert_eq!(s.parameters[0].title, "RSI Period");

        assert_eq!(s.indicators.len(), 1);
        assert_eq!(s.indicators[0].to_string(), "rsi_1 = rsi(close, rsi_period)");

        let entries: Vec<_> = s.entry_rules().collect();
        let exits: Vec<_> = s.exit_rules().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(exits.len(), 1);
        assert_eq!(entries[0].side, Some(Side::Long));
        assert_eq!(entries[0].condition.to_string(), "rsi_1 < oversold");
        assert_eq!(exits[0].condition.to_string(), "rsi_1 > overbought");
        assert_eq!(exits[0].line, 10);
    }

    #[test]
    fn missing_declaration_is_an_error() {
        let err = analyze(&StrategySource::new("x", "a = 1\nplot(a)")).unwrap_err();
        assert!(matches!(err, PinetraderError::Conversion { line: None, .. }));
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("no recognizable strategy declaration"));
        assert!(err.to_string().contains("strategy(...)"));
    }

    #[test]
    fn indicator_script_is_rejected() {
        let err = analyze(&StrategySource::new("x", "indicator(\"x\")\nplot(close)")).unwrap_err();
        assert!(err.to_string().contains("not a strategy"));
    }

    #[test]
    fn unresolved_reference_is_an_error_with_line() {
        let src = "strategy(\"x\")\nif close > mystery\n    strategy.entry(\"L\", strategy.long)";
        let err = analyze(&StrategySource::new("x", src)).unwrap_err();
        assert!(matches!(err, PinetraderError::Conversion { line: Some(2), .. }));
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn unsupported_definition_drops_dependent_condition() {
        let src = r#"strategy("x")
len = input.int(20, "Length")
basis = ta.sma(close, len)
ma = close > basis ? ta.ema(close, 9) : ta.sma(close, 9)
if ta.crossover(close, ma)
    strategy.entry("L", strategy.long)
if ta.crossover(close, basis)
    strategy.entry("L2", strategy.long)
"#;
        let analysis = run(src);
        let kinds: Vec<WarningKind> = analysis.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![WarningKind::UnsupportedConstruct, WarningKind::DroppedCondition]
        );
        assert_eq!(analysis.warnings[0].line, Some(4));
        assert_eq!(analysis.warnings[1].line, Some(6));
        assert!(analysis.warnings[1].message.contains("'ma'"));

        // the recognized parts survive
        assert_eq!(analysis.strategy.parameters.len(), 1);
        let entries: Vec<_> = analysis.strategy.entry_rules().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "L2");
    }

    #[test]
    fn v4_when_arguments_and_bare_names() {
        let src = r#"//@version=4
strategy("MA Cross", default_qty_type=strategy.percent_of_equity, default_qty_value=50)
fast = input(9, title="Fast", type=input.integer)
slow = input(21, title="Slow")
fastMA = ema(close, fast)
slowMA = sma(close, slow)
strategy.entry("L", strategy.long, when=crossover(fastMA, slowMA))
strategy.close("L", when=crossunder(fastMA, slowMA))
"#;
        let analysis = run(src);
        assert!(analysis.warnings.is_empty(), "{:?}", analysis.warnings);
        let s = &analysis.strategy;
        assert_eq!(s.header.position_size, Some(0.5));
        assert_eq!(s.parameters[0].param_type, ParamType::Number { integer: true });
        assert_eq!(s.indicators.len(), 2);
        assert_eq!(
            s.rules[0].condition.to_string(),
            "crossover(ema_1, sma_1)"
        );
        assert_eq!(s.rules[1].role, RuleRole::Exit);
    }

    #[test]
    fn tuple_assignment_binds_named_outputs() {
        let src = r#"strategy("BB")
length = input.int(20)
mult = input.float(2.0)
[middle, upper, lower] = ta.bb(close, length, mult)
if ta.crossunder(close, lower)
    strategy.entry("L", strategy.long)
if close > upper
    strategy.close_all()
"#;
        let analysis = run(src);
        assert!(analysis.warnings.is_empty(), "{:?}", analysis.warnings);
        let s = &analysis.strategy;
        assert_eq!(s.indicators.len(), 1);
        assert_eq!(s.rules[0].condition.to_string(), "crossunder(close, bb_1.lower)");
        assert_eq!(s.rules[1].id, "all");
        assert_eq!(s.rules[1].condition.to_string(), "close > bb_1.upper");
    }

    #[test]
    fn identical_calls_share_one_binding() {
        let src = r#"strategy("x")
a = ta.ema(close, 10)
b = ta.ema(close, 10)
c = ta.ema(close, 20)
strategy.entry("L", strategy.long, when=a > c and b > c)
"#;
        let analysis = run(src);
        let ids: Vec<&str> = analysis.strategy.indicators.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["ema_1", "ema_2"]);
    }

    #[test]
    fn midpoint_and_tsv_idioms() {
        let src = r#"strategy("Ichimoku TSV")
tenkan = math.avg(ta.highest(high, 9), ta.lowest(low, 9))
kijun = math.avg(ta.lowest(26), ta.highest(26))
tsv = math.sum(volume * ta.change(close), 13)
if ta.crossover(tenkan, kijun) and tsv > 0
    strategy.entry("L", strategy.long)
"#;
        let analysis = run(src);
        assert!(analysis.warnings.is_empty(), "{:?}", analysis.warnings);
        let rendered: Vec<String> = analysis.strategy.indicators.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["midpoint_1 = midpoint(9)", "midpoint_2 = midpoint(26)", "tsv_1 = tsv(13)"]
        );
    }

    #[test]
    fn else_branch_negates_previous_conditions() {
        let src = r#"strategy("x")
fast = ta.sma(close, 5)
if close > fast
    strategy.entry("L", strategy.long)
else
    strategy.close("L")
"#;
        let analysis = run(src);
        assert_eq!(analysis.strategy.rules[1].condition.to_string(), "not close > sma_1");
    }

    #[test]
    fn source_input_feeds_indicator() {
        let src = r#"strategy("x")
src = input.source(close, "Source")
len = input(14)
r = ta.rsi(src, len)
strategy.entry("L", strategy.long, when=r < 30)
"#;
        let analysis = run(src);
        let s = &analysis.strategy;
        assert!(s.parameters[0].is_source());
        assert_eq!(s.parameters[0].default, ParamValue::Text("close".into()));
        assert_eq!(s.indicators[0].to_string(), "rsi_1 = rsi(src, len)");
    }

    #[test]
    fn string_input_options() {
        let src = r#"strategy("x")
mode = input.string("Fast", "Mode", options=["Fast", "Slow"])
strategy.entry("L", strategy.long, when=close > open)
"#;
        let analysis = run(src);
        assert_eq!(analysis.strategy.parameters[0].options, vec!["Fast", "Slow"]);
    }

    #[test]
    fn strategy_exit_and_position_state_are_unsupported() {
        let src = r#"strategy("x", pyramiding=3)
strategy.entry("L", strategy.long, when=close > open)
strategy.exit("TP", "L", profit=100)
if strategy.position_size > 0 and close < open
    strategy.close("L")
"#;
        let analysis = run(src);
        let kinds: Vec<WarningKind> = analysis.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WarningKind::IgnoredSetting,
                WarningKind::UnsupportedConstruct,
                WarningKind::UnsupportedConstruct,
                WarningKind::DroppedCondition,
            ]
        );
        assert_eq!(analysis.strategy.rules.len(), 1);
    }

    #[test]
    fn history_and_change() {
        let src = r#"strategy("x")
mom = ta.change(close, 3)
strategy.entry("L", strategy.long, when=mom > 0 and close[1] < close)
"#;
        let analysis = run(src);
        assert_eq!(
            analysis.strategy.rules[0].condition.to_string(),
            "((close - close[3]) > 0 and close[1] < close)"
        );
    }

    #[test]
    fn zero_length_literal_is_unsupported() {
        let src = r#"strategy("x")
m = ta.sma(close, 0)
strategy.entry("L", strategy.long, when=close > open)
"#;
        let analysis = run(src);
        assert_eq!(analysis.warnings.len(), 1);
        assert!(analysis.warnings[0].message.contains("positive integer"));
    }
}
