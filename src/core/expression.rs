//! Restricted expression language for `${{ }}` templates and `if` conditions
//!
//! Expressions are parsed once when a definition is built. Every reference is
//! resolved into a typed [`Reference`] at parse time, so an unknown context or
//! property is a build error rather than an empty string at run time.

use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Error produced while tokenizing or parsing an expression
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} (at offset {offset})")]
pub struct ExpressionError {
    pub message: String,
    pub offset: usize,
}

impl ExpressionError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Runtime value of an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
        }
    }

    fn as_number(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Number(n) => *n,
            Value::String(s) if s.trim().is_empty() => 0.0,
            Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        }
    }

    /// Loose equality: strings compare case-insensitively, everything else numerically
    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
            (Value::Null, Value::Null) => true,
            _ => self.as_number() == other.as_number(),
        }
    }

    /// Display form, moving the buffer out of a string value
    pub fn into_string(mut self) -> String {
        match &mut self {
            Value::String(s) => std::mem::take(s),
            other => other.to_string(),
        }
    }

    fn lowercase(&self) -> Zeroizing<String> {
        let text = Zeroizing::new(self.to_string());
        Zeroizing::new(text.to_lowercase())
    }
}

// Strings may carry secret values resolved during evaluation
impl Drop for Value {
    fn drop(&mut self) {
        if let Value::String(s) = self {
            s.zeroize();
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
        }
    }
}

/// Properties of the `github` (event) context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextField {
    EventName,
    Ref,
    RefName,
    RefType,
    BaseRef,
    HeadRef,
    Sha,
    Actor,
    Repository,
}

impl ContextField {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "event_name" => ContextField::EventName,
            "ref" => ContextField::Ref,
            "ref_name" => ContextField::RefName,
            "ref_type" => ContextField::RefType,
            "base_ref" => ContextField::BaseRef,
            "head_ref" => ContextField::HeadRef,
            "sha" => ContextField::Sha,
            "actor" => ContextField::Actor,
            "repository" => ContextField::Repository,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextField::EventName => "event_name",
            ContextField::Ref => "ref",
            ContextField::RefName => "ref_name",
            ContextField::RefType => "ref_type",
            ContextField::BaseRef => "base_ref",
            ContextField::HeadRef => "head_ref",
            ContextField::Sha => "sha",
            ContextField::Actor => "actor",
            ContextField::Repository => "repository",
        }
    }
}

/// A typed reference into the expression namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Github(ContextField),
    Env(String),
    NeedsResult { job: String },
    NeedsOutput { job: String, output: String },
    StepOutcome { step: String },
    StepOutput { step: String, output: String },
    Secret(String),
}

impl Reference {
    fn from_path(path: &[String], offset: usize) -> Result<Self, ExpressionError> {
        let dotted = path.join(".");
        let invalid = || ExpressionError::new(format!("invalid reference `{}`", dotted), offset);

        match path[0].as_str() {
            "github" => match path {
                [_, field] => ContextField::from_name(field)
                    .map(Reference::Github)
                    .ok_or_else(|| ExpressionError::new(format!("unknown property `{}`", dotted), offset)),
                _ => Err(invalid()),
            },
            "env" => match path {
                [_, name] => Ok(Reference::Env(name.clone())),
                _ => Err(invalid()),
            },
            "secrets" => match path {
                [_, name] => Ok(Reference::Secret(name.clone())),
                _ => Err(invalid()),
            },
            "needs" => match path {
                [_, job, result] if result == "result" => Ok(Reference::NeedsResult { job: job.clone() }),
                [_, job, outputs, output] if outputs == "outputs" => Ok(Reference::NeedsOutput {
                    job: job.clone(),
                    output: output.clone(),
                }),
                _ => Err(invalid()),
            },
            "steps" => match path {
                [_, step, outcome] if outcome == "outcome" || outcome == "conclusion" => {
                    Ok(Reference::StepOutcome { step: step.clone() })
                }
                [_, step, outputs, output] if outputs == "outputs" => Ok(Reference::StepOutput {
                    step: step.clone(),
                    output: output.clone(),
                }),
                _ => Err(invalid()),
            },
            other => Err(ExpressionError::new(format!("unknown context `{}`", other), offset)),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Github(field) => write!(f, "github.{}", field.as_str()),
            Reference::Env(name) => write!(f, "env.{}", name),
            Reference::NeedsResult { job } => write!(f, "needs.{}.result", job),
            Reference::NeedsOutput { job, output } => write!(f, "needs.{}.outputs.{}", job, output),
            Reference::StepOutcome { step } => write!(f, "steps.{}.outcome", step),
            Reference::StepOutput { step, output } => write!(f, "steps.{}.outputs.{}", step, output),
            Reference::Secret(name) => write!(f, "secrets.{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Success,
    Failure,
    Always,
    Cancelled,
    Contains,
    StartsWith,
    EndsWith,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "success" => Function::Success,
            "failure" => Function::Failure,
            "always" => Function::Always,
            "cancelled" => Function::Cancelled,
            "contains" => Function::Contains,
            "startswith" => Function::StartsWith,
            "endswith" => Function::EndsWith,
            _ => return None,
        })
    }

    fn arity(&self) -> usize {
        match self {
            Function::Success | Function::Failure | Function::Always | Function::Cancelled => 0,
            Function::Contains | Function::StartsWith | Function::EndsWith => 2,
        }
    }

    fn is_status(&self) -> bool {
        self.arity() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    And,
    Or,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Reference(Reference),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

/// Job/step status flags consulted by the status functions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub failed: bool,
    pub cancelled: bool,
}

/// Source of values for references during evaluation
pub trait Scope {
    fn lookup(&self, reference: &Reference) -> Value;

    fn status(&self) -> StatusFlags {
        StatusFlags::default()
    }
}

impl Expr {
    /// Parse a bare expression (no `${{ }}` wrapper)
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        match parser.peek() {
            (Token::Eof, _) => Ok(expr),
            (token, offset) => Err(ExpressionError::new(
                format!("unexpected token `{}`", token),
                *offset,
            )),
        }
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Reference(reference) => scope.lookup(reference),
            Expr::Not(inner) => Value::Bool(!inner.evaluate(scope).is_truthy()),
            Expr::Binary { op, left, right } => {
                let lhs = left.evaluate(scope);
                match op {
                    BinaryOp::And if !lhs.is_truthy() => lhs,
                    BinaryOp::Or if lhs.is_truthy() => lhs,
                    BinaryOp::And | BinaryOp::Or => right.evaluate(scope),
                    BinaryOp::Eq => Value::Bool(lhs.loose_eq(&right.evaluate(scope))),
                    BinaryOp::Ne => Value::Bool(!lhs.loose_eq(&right.evaluate(scope))),
                }
            }
            Expr::Call { function, args } => {
                let status = scope.status();
                match function {
                    Function::Success => Value::Bool(!status.failed && !status.cancelled),
                    Function::Failure => Value::Bool(status.failed),
                    Function::Always => Value::Bool(true),
                    Function::Cancelled => Value::Bool(status.cancelled),
                    Function::Contains | Function::StartsWith | Function::EndsWith => {
                        let haystack = args[0].evaluate(scope).lowercase();
                        let needle = args[1].evaluate(scope).lowercase();
                        Value::Bool(match function {
                            Function::Contains => haystack.contains(needle.as_str()),
                            Function::StartsWith => haystack.starts_with(needle.as_str()),
                            _ => haystack.ends_with(needle.as_str()),
                        })
                    }
                }
            }
        }
    }

    /// All references appearing anywhere in the expression
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Reference(reference) => out.push(reference),
            Expr::Not(inner) => inner.collect_references(out),
            Expr::Binary { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_references(out)),
        }
    }

    pub fn has_status_function(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::Reference(_) => false,
            Expr::Not(inner) => inner.has_status_function(),
            Expr::Binary { left, right, .. } => left.has_status_function() || right.has_status_function(),
            Expr::Call { function, args } => {
                function.is_status() || args.iter().any(Expr::has_status_function)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Expr),
}

/// A string with embedded `${{ expr }}` placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut consumed = 0;

        while let Some(start) = rest.find("${{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let body_start = start + 3;
            let end = rest[body_start..]
                .find("}}")
                .ok_or_else(|| ExpressionError::new("unterminated `${{`", consumed + start))?;
            let body = &rest[body_start..body_start + end];
            let expr = Expr::parse(body).map_err(|e| ExpressionError {
                offset: consumed + body_start + e.offset,
                ..e
            })?;
            segments.push(Segment::Expr(expr));

            let next = body_start + end + 2;
            consumed += next;
            rest = &rest[next..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn references(&self) -> Vec<&Reference> {
        self.segments
            .iter()
            .flat_map(|segment| match segment {
                Segment::Text(_) => Vec::new(),
                Segment::Expr(expr) => expr.references(),
            })
            .collect()
    }

    pub fn render(&self, scope: &dyn Scope) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&Zeroizing::new(expr.evaluate(scope).into_string())),
            }
        }
        out
    }

    /// Like [`Template::render`], into a buffer zeroed on drop.
    ///
    /// The output is allocated once at its final size so no partial copy of
    /// a secret value is left behind by reallocation.
    pub fn render_zeroizing(&self, scope: &dyn Scope) -> Zeroizing<String> {
        let parts: Vec<Zeroizing<String>> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Text(text) => Zeroizing::new(text.clone()),
                Segment::Expr(expr) => Zeroizing::new(expr.evaluate(scope).into_string()),
            })
            .collect();
        let mut out = Zeroizing::new(String::with_capacity(parts.iter().map(|p| p.len()).sum()));
        for part in &parts {
            out.push_str(part);
        }
        out
    }
}

/// A step or job `if` condition
///
/// A condition that does not mention a status function is evaluated as
/// `success() && (<expr>)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let trimmed = source.trim();
        let body = trimmed
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);
        let expr = Expr::parse(body)?;
        let expr = if expr.has_status_function() {
            expr
        } else {
            Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(Expr::Call {
                    function: Function::Success,
                    args: Vec::new(),
                }),
                right: Box::new(expr),
            }
        };
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The implicit condition of a step or job without `if`
    pub fn success() -> Self {
        Self {
            source: "success()".to_string(),
            expr: Expr::Call {
                function: Function::Success,
                args: Vec::new(),
            },
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn references(&self) -> Vec<&Reference> {
        self.expr.references()
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> bool {
        self.expr.evaluate(scope).is_truthy()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Null,
    True,
    False,
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Not,
    Eq,
    Ne,
    And,
    Or,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Not => write!(f, "!"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '.' => {
                tokens.push((Token::Dot, offset));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, offset));
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, offset));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, offset));
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push((Token::Ne, offset));
                i += 2;
            }
            '!' => {
                tokens.push((Token::Not, offset));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((Token::Eq, offset));
                i += 2;
            }
            '&' if next == Some('&') => {
                tokens.push((Token::And, offset));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((Token::Or, offset));
                i += 2;
            }
            '\'' => {
                // '' inside a string is an escaped quote
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::new("unterminated string", offset)),
                        Some((_, '\'')) if chars.get(i + 1).map(|(_, c)| *c) == Some('\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some((_, '\'')) => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((Token::Str(value), offset));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::new(format!("invalid number `{}`", text), offset))?;
                tokens.push((Token::Number(number), offset));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.as_str() {
                    "null" => Token::Null,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                };
                tokens.push((token, offset));
            }
            other => {
                return Err(ExpressionError::new(
                    format!("unexpected character `{}`", other),
                    offset,
                ))
            }
        }
    }

    tokens.push((Token::Eof, source.len()));
    Ok(tokens)
}

/// Deepest expression tree the parser accepts; evaluation recurses per level
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    /// Nesting of the subtree being built
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &(Token, usize) {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> (Token, usize) {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let (token, offset) = self.advance();
        if token == expected {
            Ok(())
        } else {
            Err(ExpressionError::new(
                format!("expected `{}`, found `{}`", expected, token),
                offset,
            ))
        }
    }

    fn descend(&mut self, offset: usize) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::new(
                format!("expression nested deeper than {} levels", MAX_DEPTH),
                offset,
            ));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let entry = self.depth;
        let mut left = self.parse_and()?;
        while self.peek().0 == Token::Or {
            let (_, offset) = self.advance();
            self.descend(offset)?;
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = entry;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let entry = self.depth;
        let mut left = self.parse_equality()?;
        while self.peek().0 == Token::And {
            let (_, offset) = self.advance();
            self.descend(offset)?;
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = entry;
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let entry = self.depth;
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().0 {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => {
                    self.depth = entry;
                    return Ok(left);
                }
            };
            let (_, offset) = self.advance();
            self.descend(offset)?;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek().0 == Token::Not {
            let (_, offset) = self.advance();
            self.descend(offset)?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let (token, offset) = self.advance();
        match token {
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                self.descend(offset)?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Token::Ident(name) if self.peek().0 == Token::LParen => self.parse_call(name, offset),
            Token::Ident(name) => {
                let mut path = vec![name];
                while self.peek().0 == Token::Dot {
                    self.advance();
                    match self.advance() {
                        (Token::Ident(segment), _) => path.push(segment),
                        (other, at) => {
                            return Err(ExpressionError::new(
                                format!("expected property name, found `{}`", other),
                                at,
                            ))
                        }
                    }
                }
                Reference::from_path(&path, offset).map(Expr::Reference)
            }
            other => Err(ExpressionError::new(
                format!("unexpected token `{}`", other),
                offset,
            )),
        }
    }

    fn parse_call(&mut self, name: String, offset: usize) -> Result<Expr, ExpressionError> {
        let function = Function::from_name(&name)
            .ok_or_else(|| ExpressionError::new(format!("unknown function `{}`", name), offset))?;
        self.expect(Token::LParen)?;
        self.descend(offset)?;

        let mut args = Vec::new();
        if self.peek().0 != Token::RParen {
            args.push(self.parse_or()?);
            while self.peek().0 == Token::Comma {
                self.advance();
                args.push(self.parse_or()?);
            }
        }
        self.expect(Token::RParen)?;
        self.depth -= 1;

        if args.len() != function.arity() {
            return Err(ExpressionError::new(
                format!(
                    "`{}` takes {} argument(s), got {}",
                    name,
                    function.arity(),
                    args.len()
                ),
                offset,
            ));
        }
        Ok(Expr::Call { function, args })
    }
}
