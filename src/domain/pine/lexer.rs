//! Pine tokenizer.
//!
//! Source is split into logical lines: a physical line continues the
//! previous one while a bracket is open, when the previous line ends with a
//! binary operator or comma, or when it is indented by a width that is not a
//! multiple of four. Block structure is left to the parser via each line's
//! indentation width.

use crate::domain::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    /// `#rrggbb` colour literal.
    Color(String),
    /// Identifier, possibly dotted (`ta.rsi`, `strategy.long`).
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    /// `=`
    Assign,
    /// `:=` and the compound forms `+=` `-=` `*=` `/=` `%=`.
    Reassign,
    /// `=>`
    Arrow,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Gt,
    Lt,
    Ge,
    Le,
    EqEq,
    Ne,
    Question,
    Colon,
}

impl TokenKind {
    fn is_binary_operator(&self) -> bool {
        match self {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::Gt
            | TokenKind::Lt
            | TokenKind::Ge
            | TokenKind::Le
            | TokenKind::EqEq
            | TokenKind::Ne
            | TokenKind::Question
            | TokenKind::Colon
            | TokenKind::Comma => true,
            TokenKind::Ident(word) => word == "and" || word == "or",
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TokenKind::Int(v) => v.to_string(),
            TokenKind::Float(v) => v.to_string(),
            TokenKind::Str(s) => format!("\"{s}\""),
            TokenKind::Color(c) => c.clone(),
            TokenKind::Ident(name) => name.clone(),
            TokenKind::LParen => "(".into(),
            TokenKind::RParen => ")".into(),
            TokenKind::LBracket => "[".into(),
            TokenKind::RBracket => "]".into(),
            TokenKind::Comma => ",".into(),
            TokenKind::Assign => "=".into(),
            TokenKind::Reassign => ":=".into(),
            TokenKind::Arrow => "=>".into(),
            TokenKind::Plus => "+".into(),
            TokenKind::Minus => "-".into(),
            TokenKind::Star => "*".into(),
            TokenKind::Slash => "/".into(),
            TokenKind::Percent => "%".into(),
            TokenKind::Gt => ">".into(),
            TokenKind::Lt => "<".into(),
            TokenKind::Ge => ">=".into(),
            TokenKind::Le => "<=".into(),
            TokenKind::EqEq => "==".into(),
            TokenKind::Ne => "!=".into(),
            TokenKind::Question => "?".into(),
            TokenKind::Colon => ":".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset into the source.
    pub position: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalLine {
    /// Indentation width of the first physical line (a tab counts as four).
    pub indent: usize,
    /// 1-based line number of the first physical line.
    pub line: usize,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lexed {
    pub version: Option<u32>,
    pub lines: Vec<LogicalLine>,
}

fn indent_width(text: &str) -> usize {
    text.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

pub fn tokenize(src: &str) -> Result<Lexed, ParseError> {
    let mut lexed = Lexed {
        version: None,
        lines: Vec::new(),
    };
    let mut depth: usize = 0;
    let mut offset = 0;

    for (idx, raw) in src.split('\n').enumerate() {
        let line_no = idx + 1;
        let line_start = offset;
        offset += raw.len() + 1;
        let text = raw.strip_suffix('\r').unwrap_or(raw);

        if let Some(rest) = text.trim_start().strip_prefix("//@version=") {
            lexed.version = rest.trim().parse().ok();
            continue;
        }

        let open_before = depth > 0;
        let indent = indent_width(text);
        let tokens = LineLexer::new(text, line_no, line_start).run(&mut depth)?;
        if tokens.is_empty() {
            continue;
        }

        let continues = match lexed.lines.last() {
            Some(prev) => {
                open_before
                    || prev
                        .tokens
                        .last()
                        .is_some_and(|t| t.kind.is_binary_operator())
                    || (indent % 4 != 0 && indent > prev.indent)
            }
            None => false,
        };

        match lexed.lines.last_mut() {
            Some(prev) if continues => prev.tokens.extend(tokens),
            _ => lexed.lines.push(LogicalLine {
                indent,
                line: line_no,
                tokens,
            }),
        }
    }

    if depth > 0 {
        let (line, column) = match lexed.lines.last().and_then(|l| l.tokens.last()) {
            Some(tok) => (tok.line, tok.column),
            None => (1, 1),
        };
        return Err(ParseError {
            message: "unclosed bracket at end of input".to_string(),
            position: src.len(),
            line,
            column,
        });
    }

    Ok(lexed)
}

struct LineLexer<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
    line_start: usize,
}

impl<'a> LineLexer<'a> {
    fn new(text: &'a str, line: usize, line_start: usize) -> Self {
        Self {
            text,
            pos: 0,
            line,
            line_start,
        }
    }

    fn remaining(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.remaining().chars().nth(n)
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn error(&self, at: usize, message: String) -> ParseError {
        ParseError {
            message,
            position: self.line_start + at,
            line: self.line,
            column: self.text[..at].chars().count() + 1,
        }
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        Token {
            kind,
            position: self.line_start + start,
            line: self.line,
            column: self.text[..start].chars().count() + 1,
        }
    }

    fn run(mut self, depth: &mut usize) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();

        while let Some(ch) = self.peek() {
            let start = self.pos;
            if ch.is_whitespace() {
                self.advance();
                continue;
            }
            if self.remaining().starts_with("//") {
                break;
            }

            let starts_number = ch.is_ascii_digit()
                || (ch == '.' && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()));
            let kind = if starts_number {
                self.number(start)?
            } else if ch.is_alphabetic() || ch == '_' {
                self.ident()
            } else if ch == '"' || ch == '\'' {
                self.string(start)?
            } else if ch == '#' {
                self.color(start)?
            } else {
                self.operator(start, depth)?
            };
            tokens.push(self.token(kind, start));
        }

        Ok(tokens)
    }

    fn number(&mut self, start: usize) -> Result<TokenKind, ParseError> {
        let mut is_float = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_at(1).is_none_or(|c| !c.is_alphabetic()) {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+' | '-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                for _ in 0..=sign {
                    self.advance();
                }
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }

        let literal = &self.text[start..self.pos];
        if is_float {
            literal
                .parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(start, format!("invalid number: {literal}")))
        } else {
            literal
                .parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| self.error(start, format!("invalid integer: {literal}")))
        }
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.pos;
        loop {
            while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                self.advance();
            }
            let dotted = self.peek() == Some('.')
                && self.peek_at(1).is_some_and(|c| c.is_alphabetic() || c == '_');
            if !dotted {
                break;
            }
            self.advance();
        }
        TokenKind::Ident(self.text[start..self.pos].to_string())
    }

    fn string(&mut self, start: usize) -> Result<TokenKind, ParseError> {
        let quote = self.advance();
        let mut value = String::new();
        loop {
            match self.advance() {
                None => return Err(self.error(start, "unterminated string literal".to_string())),
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(other) => value.push(other),
                    None => {
                        return Err(self.error(start, "unterminated string literal".to_string()));
                    }
                },
                Some(c) if Some(c) == quote => break,
                Some(c) => value.push(c),
            }
        }
        Ok(TokenKind::Str(value))
    }

    fn color(&mut self, start: usize) -> Result<TokenKind, ParseError> {
        self.advance();
        while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
            self.advance();
        }
        let literal = &self.text[start..self.pos];
        match literal.len() {
            7 | 9 => Ok(TokenKind::Color(literal.to_string())),
            _ => Err(self.error(start, format!("invalid colour literal '{literal}'"))),
        }
    }

    fn operator(&mut self, start: usize, depth: &mut usize) -> Result<TokenKind, ParseError> {
        const TWO_CHAR: [(&str, TokenKind); 11] = [
            (":=", TokenKind::Reassign),
            ("+=", TokenKind::Reassign),
            ("-=", TokenKind::Reassign),
            ("*=", TokenKind::Reassign),
            ("/=", TokenKind::Reassign),
            ("%=", TokenKind::Reassign),
            ("=>", TokenKind::Arrow),
            ("==", TokenKind::EqEq),
            ("!=", TokenKind::Ne),
            (">=", TokenKind::Ge),
            ("<=", TokenKind::Le),
        ];

        for (text, kind) in TWO_CHAR {
            if self.remaining().starts_with(text) {
                self.pos += 2;
                return Ok(kind);
            }
        }

        let ch = self.advance().unwrap_or_default();
        let kind = match ch {
            '(' => {
                *depth += 1;
                TokenKind::LParen
            }
            ')' => {
                *depth = depth.saturating_sub(1);
                TokenKind::RParen
            }
            '[' => {
                *depth += 1;
                TokenKind::LBracket
            }
            ']' => {
                *depth = depth.saturating_sub(1);
                TokenKind::RBracket
            }
            ',' => TokenKind::Comma,
            '=' => TokenKind::Assign,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '>' => TokenKind::Gt,
            '<' => TokenKind::Lt,
            '?' => TokenKind::Question,
            ':' => TokenKind::Colon,
            other => return Err(self.error(start, format!("unexpected character '{other}'"))),
        };
        Ok(kind)
    }
}
