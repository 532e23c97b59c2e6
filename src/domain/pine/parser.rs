//! Pine statement and expression parser.
//!
//! Recursive descent over the logical lines produced by the lexer. Only a
//! lexical failure aborts parsing; a statement that does not fit the grammar
//! becomes [`StmtKind::Unsupported`] carrying the reason and the names it
//! would have defined.

use crate::domain::error::ParseError;
use crate::domain::pine::ast::{Arg, BinaryOp, Expr, Program, Stmt, StmtKind, UnaryOp};
use crate::domain::pine::lexer::{tokenize, LogicalLine, Token, TokenKind};

const TYPE_KEYWORDS: [&str; 10] = [
    "int", "float", "bool", "string", "color", "series", "simple", "const", "line", "label",
];

pub fn parse_program(src: &str) -> Result<Program, ParseError> {
    let lexed = tokenize(src)?;
    Ok(Program {
        version: lexed.version,
        statements: parse_block(&lexed.lines),
    })
}

fn word(token: Option<&Token>) -> Option<&str> {
    match token.map(|t| &t.kind) {
        Some(TokenKind::Ident(name)) => Some(name),
        _ => None,
    }
}

/// Index one past the last line belonging to the block headed by `lines[start]`.
fn block_end(lines: &[LogicalLine], start: usize) -> usize {
    let indent = lines[start].indent;
    let mut end = start + 1;
    while end < lines.len() && lines[end].indent > indent {
        end += 1;
    }
    end
}

fn unsupported(line: usize, reason: impl Into<String>, defines: Vec<String>) -> Stmt {
    Stmt {
        line,
        kind: StmtKind::Unsupported {
            reason: reason.into(),
            defines,
        },
    }
}

fn parse_block(lines: &[LogicalLine]) -> Vec<Stmt> {
    let mut statements = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let header = &lines[i];
        let end = block_end(lines, i);
        let body = &lines[i + 1..end];
        i = end;

        if word(header.tokens.first()) == Some("if") {
            let mut branches = Vec::new();
            let mut otherwise = Vec::new();
            let mut failed = None;

            match parse_expression(&header.tokens[1..], header) {
                Ok(cond) => branches.push((cond, parse_block(body))),
                Err(e) => failed = Some(e.message),
            }

            while i < lines.len()
                && lines[i].indent == header.indent
                && word(lines[i].tokens.first()) == Some("else")
            {
                let else_line = &lines[i];
                let else_end = block_end(lines, i);
                let else_body = &lines[i + 1..else_end];
                i = else_end;

                if word(else_line.tokens.get(1)) == Some("if") {
                    match parse_expression(&else_line.tokens[2..], else_line) {
                        Ok(cond) => branches.push((cond, parse_block(else_body))),
                        Err(e) => failed = failed.or(Some(e.message)),
                    }
                } else {
                    otherwise = parse_block(else_body);
                    break;
                }
            }

            statements.push(match failed {
                Some(reason) => unsupported(header.line, reason, Vec::new()),
                None => Stmt {
                    line: header.line,
                    kind: StmtKind::If {
                        branches,
                        otherwise,
                    },
                },
            });
            continue;
        }

        statements.push(parse_statement(header, body));
        if !body.is_empty() && !opens_block(header) {
            statements.push(unsupported(
                body[0].line,
                "unexpected indented block",
                defines_in(body),
            ));
        }
    }

    statements
}

/// Statement forms whose indented body is consumed by [`parse_statement`].
fn opens_block(header: &LogicalLine) -> bool {
    matches!(
        word(header.tokens.first()),
        Some("for" | "while" | "switch" | "type" | "method" | "export" | "else")
    ) || header.tokens.iter().any(|t| t.kind == TokenKind::Arrow)
        || header.tokens.iter().any(|t| {
            matches!(&t.kind, TokenKind::Ident(w) if w == "switch" || w == "if" || w == "for" || w == "while")
        })
}

/// Names assigned anywhere in a block, in first-seen order.
fn defines_in(lines: &[LogicalLine]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in lines {
        let Some(p) = line
            .tokens
            .iter()
            .position(|t| matches!(t.kind, TokenKind::Assign | TokenKind::Reassign))
        else {
            continue;
        };
        let found: Vec<String> = match line.tokens[..p].last().map(|t| &t.kind) {
            Some(TokenKind::Ident(name)) => vec![name.clone()],
            Some(TokenKind::RBracket) => line.tokens[..p]
                .iter()
                .filter_map(|t| match &t.kind {
                    TokenKind::Ident(name) => Some(name.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        for name in found {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

fn parse_statement(header: &LogicalLine, body: &[LogicalLine]) -> Stmt {
    let tokens = header.tokens.as_slice();
    let line = header.line;

    match word(tokens.first()) {
        Some(w @ ("for" | "while")) => {
            return unsupported(line, format!("'{w}' loops are not supported"), defines_in(body));
        }
        Some("switch") => {
            return unsupported(line, "'switch' blocks are not supported", defines_in(body));
        }
        Some(w @ ("import" | "export" | "type" | "method" | "enum")) => {
            return unsupported(line, format!("'{w}' declarations are not supported"), Vec::new());
        }
        Some("else") => return unsupported(line, "'else' without a matching 'if'", defines_in(body)),
        _ => {}
    }

    if tokens.iter().any(|t| t.kind == TokenKind::Arrow) {
        let name = word(tokens.first()).map(str::to_string);
        return unsupported(
            line,
            "function definitions are not supported",
            name.into_iter().collect(),
        );
    }

    let mut k = 0;
    if matches!(word(tokens.first()), Some("var" | "varip")) {
        k += 1;
    }
    if word(tokens.get(k)).is_some_and(|w| TYPE_KEYWORDS.contains(&w))
        && word(tokens.get(k + 1)).is_some()
    {
        k += 1;
    }

    match (tokens.get(k).map(|t| &t.kind), tokens.get(k + 1).map(|t| &t.kind)) {
        (Some(TokenKind::Ident(name)), Some(TokenKind::Assign)) => {
            assignment(header, vec![name.clone()], &tokens[k + 2..])
        }
        (Some(TokenKind::Ident(name)), Some(TokenKind::Reassign)) => unsupported(
            line,
            format!("reassignment of '{name}' is not supported"),
            vec![name.clone()],
        ),
        (Some(TokenKind::LBracket), _) => match tuple_targets(&tokens[k..]) {
            Some((targets, rest)) => assignment(header, targets, rest),
            None => expression_statement(header, tokens),
        },
        _ => expression_statement(header, tokens),
    }
}

/// `[a, b, c] =` prefix: the target names and the tokens after `=`.
fn tuple_targets(tokens: &[Token]) -> Option<(Vec<String>, &[Token])> {
    let close = tokens.iter().position(|t| t.kind == TokenKind::RBracket)?;
    if tokens.get(close + 1).map(|t| &t.kind) != Some(&TokenKind::Assign) {
        return None;
    }
    let mut targets = Vec::new();
    for (i, token) in tokens[1..close].iter().enumerate() {
        match (&token.kind, i % 2) {
            (TokenKind::Ident(name), 0) => targets.push(name.clone()),
            (TokenKind::Comma, 1) => {}
            _ => return None,
        }
    }
    Some((targets, &tokens[close + 2..]))
}

fn assignment(header: &LogicalLine, targets: Vec<String>, value: &[Token]) -> Stmt {
    if let Some(w @ ("if" | "switch" | "for" | "while")) = word(value.first()) {
        return unsupported(header.line, format!("'{w}' expressions are not supported"), targets);
    }
    match parse_expression(value, header) {
        Ok(value) => Stmt {
            line: header.line,
            kind: StmtKind::Assign { targets, value },
        },
        Err(e) => unsupported(header.line, e.message, targets),
    }
}

fn expression_statement(header: &LogicalLine, tokens: &[Token]) -> Stmt {
    match parse_expression(tokens, header) {
        Ok(expr) => Stmt {
            line: header.line,
            kind: StmtKind::Expr(expr),
        },
        Err(e) => unsupported(header.line, e.message, Vec::new()),
    }
}

/// Parse a complete expression from a token slice.
pub fn parse_expression(tokens: &[Token], line: &LogicalLine) -> Result<Expr, ParseError> {
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        line,
    };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(parser.error(format!("unexpected '{}'", tok.kind.describe()))),
    }
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: &'a LogicalLine,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&'a TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_word(&self) -> Option<&'a str> {
        word(self.peek())
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(tok)
    }

    fn error(&self, message: String) -> ParseError {
        match self.peek().or_else(|| self.tokens.last()) {
            Some(tok) => ParseError {
                message,
                position: tok.position,
                line: tok.line,
                column: tok.column,
            },
            None => ParseError {
                message,
                position: 0,
                line: self.line.line,
                column: self.line.indent + 1,
            },
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        match self.peek_kind() {
            Some(k) if *k == kind => {
                self.pos += 1;
                Ok(())
            }
            Some(k) => Err(self.error(format!(
                "expected '{}', found '{}'",
                kind.describe(),
                k.describe()
            ))),
            None => Err(self.error(format!(
                "expected '{}', found end of line",
                kind.describe()
            ))),
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let expr = self.or()?;
        if self.peek_kind() == Some(&TokenKind::Question) {
            return Err(self.error("ternary operator '?:' is not supported".to_string()));
        }
        Ok(expr)
    }

    fn binary_chain(
        &mut self,
        next: fn(&mut Self) -> Result<Expr, ParseError>,
        op_of: fn(&TokenKind) -> Option<BinaryOp>,
    ) -> Result<Expr, ParseError> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_kind().and_then(op_of) {
            self.pos += 1;
            let right = next(self)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::and, |k| match k {
            TokenKind::Ident(w) if w == "or" => Some(BinaryOp::Or),
            _ => None,
        })
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::equality, |k| match k {
            TokenKind::Ident(w) if w == "and" => Some(BinaryOp::And),
            _ => None,
        })
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::comparison, |k| match k {
            TokenKind::EqEq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            _ => None,
        })
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::additive, |k| match k {
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            TokenKind::Le => Some(BinaryOp::Le),
            _ => None,
        })
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::multiplicative, |k| match k {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::unary, |k| match k {
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::Percent => Some(BinaryOp::Mod),
            _ => None,
        })
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => Some(UnaryOp::Neg),
            Some(TokenKind::Plus) => {
                self.pos += 1;
                return self.unary();
            }
            Some(TokenKind::Ident(w)) if w == "not" => Some(UnaryOp::Not),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                })
            }
            None => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        while self.peek_kind() == Some(&TokenKind::LBracket) {
            self.pos += 1;
            let offset = self.expr()?;
            self.expect(TokenKind::RBracket)?;
            expr = Expr::Index {
                base: Box::new(expr),
                offset: Box::new(offset),
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let Some(tok) = self.advance() else {
            return Err(self.error("expected expression, found end of line".to_string()));
        };

        match &tok.kind {
            TokenKind::Int(v) => Ok(Expr::Int(*v)),
            TokenKind::Float(v) => Ok(Expr::Float(*v)),
            TokenKind::Str(s) => Ok(Expr::Str(s.clone())),
            TokenKind::Color(c) => Ok(Expr::Color(c.clone())),
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if self.peek_kind() != Some(&TokenKind::RBracket) {
                    items.push(self.expr()?);
                    while self.peek_kind() == Some(&TokenKind::Comma) {
                        self.pos += 1;
                        items.push(self.expr()?);
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::List(items))
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "if" | "switch" | "for" | "while" => {
                    self.pos -= 1;
                    Err(self.error(format!("'{name}' expressions are not supported")))
                }
                _ if self.peek_kind() == Some(&TokenKind::LParen) => {
                    self.pos += 1;
                    let args = self.arguments()?;
                    Ok(Expr::Call {
                        name: name.clone(),
                        args,
                    })
                }
                _ => Ok(Expr::Ident(name.clone())),
            },
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected '{}'", other.describe())))
            }
        }
    }

    /// Call arguments after the opening parenthesis, through the closing one.
    fn arguments(&mut self) -> Result<Vec<Arg>, ParseError> {
        let mut args = Vec::new();
        if self.peek_kind() == Some(&TokenKind::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            let named = match (self.peek_word(), self.tokens.get(self.pos + 1).map(|t| &t.kind)) {
                (Some(name), Some(TokenKind::Assign)) => Some(name.to_string()),
                _ => None,
            };
            if named.is_some() {
                self.pos += 2;
            }
            let value = self.expr()?;
            args.push(Arg { name: named, value });

            match self.peek_kind() {
                Some(TokenKind::Comma) => self.pos += 1,
                _ => break,
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }
}
