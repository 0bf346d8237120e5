//! User-authored predicate "checks": a small sandboxed expression language,
//! the check registry with its two-tier timing validation, and the shared
//! result cache.
//!
//! Checks are compiled from source text into an AST and interpreted with a
//! wall-clock deadline. The language deliberately has no loops, no
//! assignment and no ambient I/O; the only runtime faults are deadline
//! overruns and bad regex patterns, both of which coerce to `passed=false`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::logdeck_core::LogEntry;

pub const MAX_CHECKS: usize = 100;
pub const TRIAL_BUDGET: Duration = Duration::from_millis(10);
pub const KILL_THRESHOLD: Duration = Duration::from_millis(25);

/// How long a single check's timings are retained for the stats readout.
const TIMING_WINDOW: Duration = Duration::from_secs(60);

/// Evaluation steps between deadline probes. Probing on every node would
/// spend more time in `Instant::now` than in user code.
const DEADLINE_PROBE_EVERY: u32 = 64;

const MAX_PARSE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Expression language
// ---------------------------------------------------------------------------

/// The five values bound into every check invocation, named as they
/// appear on the wire: `date`, `type`, `callLine`, `argList`, `boundDatas`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Param {
    Date,
    Type,
    CallLine,
    ArgList,
    BoundDatas,
}

impl Param {
    fn from_name(name: &str) -> Option<Param> {
        match name {
            "date" => Some(Param::Date),
            "type" => Some(Param::Type),
            "callLine" => Some(Param::CallLine),
            "argList" => Some(Param::ArgList),
            "boundDatas" => Some(Param::BoundDatas),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Builtin {
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Len,
    Str,
    Num,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Builtin> {
        match name {
            "contains" => Some(Builtin::Contains),
            "startsWith" => Some(Builtin::StartsWith),
            "endsWith" => Some(Builtin::EndsWith),
            "matches" => Some(Builtin::Matches),
            "len" => Some(Builtin::Len),
            "str" => Some(Builtin::Str),
            "num" => Some(Builtin::Num),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Builtin::Contains | Builtin::StartsWith | Builtin::EndsWith | Builtin::Matches => 2,
            Builtin::Len | Builtin::Str | Builtin::Num => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug)]
enum Expr {
    Literal(Value),
    Param(Param),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("unexpected character `{ch}` at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unterminated string starting at offset {pos}")]
    UnterminatedString { pos: usize },
    #[error("invalid number at offset {pos}")]
    InvalidNumber { pos: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token at offset {pos}")]
    UnexpectedToken { pos: usize },
    #[error("unknown identifier `{0}` (available: date, type, callLine, argList, boundDatas)")]
    UnknownIdentifier(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{name}` takes {expected} argument(s), got {got}")]
    BadArity { name: &'static str, expected: usize, got: usize },
    #[error("expression is nested too deeply")]
    TooDeep,
    #[error("empty expression")]
    Empty,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("evaluation deadline exceeded")]
    DeadlineExceeded,
    #[error("invalid pattern in matches(): {0}")]
    BadPattern(String),
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Bang,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

fn tokenize(source: &str) -> Result<Vec<(Tok, usize)>, CompileError> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = source.chars().collect();
    let mut idx = 0usize;

    while idx < bytes.len() {
        let ch = bytes[idx];
        let pos = idx;
        match ch {
            ' ' | '\t' | '\r' | '\n' => idx += 1,
            '(' => {
                tokens.push((Tok::LParen, pos));
                idx += 1;
            }
            ')' => {
                tokens.push((Tok::RParen, pos));
                idx += 1;
            }
            '[' => {
                tokens.push((Tok::LBracket, pos));
                idx += 1;
            }
            ']' => {
                tokens.push((Tok::RBracket, pos));
                idx += 1;
            }
            '.' => {
                tokens.push((Tok::Dot, pos));
                idx += 1;
            }
            ',' => {
                tokens.push((Tok::Comma, pos));
                idx += 1;
            }
            '+' => {
                tokens.push((Tok::Plus, pos));
                idx += 1;
            }
            '-' => {
                tokens.push((Tok::Minus, pos));
                idx += 1;
            }
            '*' => {
                tokens.push((Tok::Star, pos));
                idx += 1;
            }
            '/' => {
                tokens.push((Tok::Slash, pos));
                idx += 1;
            }
            '%' => {
                tokens.push((Tok::Percent, pos));
                idx += 1;
            }
            '!' => {
                if bytes.get(idx + 1) == Some(&'=') {
                    tokens.push((Tok::NotEq, pos));
                    idx += 2;
                } else {
                    tokens.push((Tok::Bang, pos));
                    idx += 1;
                }
            }
            '=' => {
                if bytes.get(idx + 1) == Some(&'=') {
                    tokens.push((Tok::EqEq, pos));
                    idx += 2;
                } else {
                    return Err(CompileError::UnexpectedChar { ch, pos });
                }
            }
            '<' => {
                if bytes.get(idx + 1) == Some(&'=') {
                    tokens.push((Tok::Le, pos));
                    idx += 2;
                } else {
                    tokens.push((Tok::Lt, pos));
                    idx += 1;
                }
            }
            '>' => {
                if bytes.get(idx + 1) == Some(&'=') {
                    tokens.push((Tok::Ge, pos));
                    idx += 2;
                } else {
                    tokens.push((Tok::Gt, pos));
                    idx += 1;
                }
            }
            '&' => {
                if bytes.get(idx + 1) == Some(&'&') {
                    tokens.push((Tok::AndAnd, pos));
                    idx += 2;
                } else {
                    return Err(CompileError::UnexpectedChar { ch, pos });
                }
            }
            '|' => {
                if bytes.get(idx + 1) == Some(&'|') {
                    tokens.push((Tok::OrOr, pos));
                    idx += 2;
                } else {
                    return Err(CompileError::UnexpectedChar { ch, pos });
                }
            }
            '"' | '\'' => {
                let quote = ch;
                let mut text = String::new();
                idx += 1;
                loop {
                    match bytes.get(idx) {
                        None => return Err(CompileError::UnterminatedString { pos }),
                        Some(&c) if c == quote => {
                            idx += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = bytes
                                .get(idx + 1)
                                .ok_or(CompileError::UnterminatedString { pos })?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            idx += 2;
                        }
                        Some(&c) => {
                            text.push(c);
                            idx += 1;
                        }
                    }
                }
                tokens.push((Tok::Str(text), pos));
            }
            c if c.is_ascii_digit() => {
                let start = idx;
                while idx < bytes.len() && (bytes[idx].is_ascii_digit() || bytes[idx] == '.') {
                    idx += 1;
                }
                let text: String = bytes[start..idx].iter().collect();
                let num: f64 =
                    text.parse().map_err(|_| CompileError::InvalidNumber { pos: start })?;
                tokens.push((Tok::Num(num), start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = idx;
                while idx < bytes.len()
                    && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == '_')
                {
                    idx += 1;
                }
                let text: String = bytes[start..idx].iter().collect();
                tokens.push((Tok::Ident(text), start));
            }
            other => return Err(CompileError::UnexpectedChar { ch: other, pos }),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Tok, usize)>,
    idx: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.idx).map(|(tok, _)| tok)
    }

    fn pos(&self) -> usize {
        self.tokens.get(self.idx).map(|(_, pos)| *pos).unwrap_or(usize::MAX)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.idx).map(|(tok, _)| tok.clone());
        self.idx += 1;
        tok
    }

    fn expect(&mut self, expected: Tok) -> Result<(), CompileError> {
        match self.peek() {
            Some(tok) if *tok == expected => {
                self.idx += 1;
                Ok(())
            }
            Some(_) => Err(CompileError::UnexpectedToken { pos: self.pos() }),
            None => Err(CompileError::UnexpectedEnd),
        }
    }

    fn parse_or(&mut self, depth: usize) -> Result<Expr, CompileError> {
        if depth > MAX_PARSE_DEPTH {
            return Err(CompileError::TooDeep);
        }
        let mut lhs = self.parse_and(depth + 1)?;
        while self.peek() == Some(&Tok::OrOr) {
            self.idx += 1;
            let rhs = self.parse_and(depth + 1)?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self, depth: usize) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_equality(depth + 1)?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.idx += 1;
            let rhs = self.parse_equality(depth + 1)?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self, depth: usize) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_comparison(depth + 1)?;
        loop {
            let op = match self.peek() {
                Some(Tok::EqEq) => BinOp::Eq,
                Some(Tok::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.idx += 1;
            let rhs = self.parse_comparison(depth + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self, depth: usize) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_additive(depth + 1)?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Ge) => BinOp::Ge,
                _ => break,
            };
            self.idx += 1;
            let rhs = self.parse_additive(depth + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self, depth: usize) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_multiplicative(depth + 1)?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.idx += 1;
            let rhs = self.parse_multiplicative(depth + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self, depth: usize) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary(depth + 1)?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            self.idx += 1;
            let rhs = self.parse_unary(depth + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, depth: usize) -> Result<Expr, CompileError> {
        if depth > MAX_PARSE_DEPTH {
            return Err(CompileError::TooDeep);
        }
        match self.peek() {
            Some(Tok::Bang) => {
                self.idx += 1;
                let inner = self.parse_unary(depth + 1)?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)))
            }
            Some(Tok::Minus) => {
                self.idx += 1;
                let inner = self.parse_unary(depth + 1)?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)))
            }
            _ => self.parse_postfix(depth + 1),
        }
    }

    fn parse_postfix(&mut self, depth: usize) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary(depth + 1)?;
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.idx += 1;
                    match self.bump() {
                        Some(Tok::Ident(name)) => {
                            expr = Expr::Field(Box::new(expr), name);
                        }
                        Some(_) => {
                            return Err(CompileError::UnexpectedToken { pos: self.pos() })
                        }
                        None => return Err(CompileError::UnexpectedEnd),
                    }
                }
                Some(Tok::LBracket) => {
                    self.idx += 1;
                    let index = self.parse_or(depth + 1)?;
                    self.expect(Tok::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<Expr, CompileError> {
        if depth > MAX_PARSE_DEPTH {
            return Err(CompileError::TooDeep);
        }
        let pos = self.pos();
        match self.bump() {
            Some(Tok::Num(num)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(num).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Tok::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Tok::LParen) => {
                let inner = self.parse_or(depth + 1)?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Ident(name)) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.idx += 1;
                    let builtin = Builtin::from_name(&name)
                        .ok_or_else(|| CompileError::UnknownFunction(name.clone()))?;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Tok::RParen) {
                        loop {
                            args.push(self.parse_or(depth + 1)?);
                            if self.peek() == Some(&Tok::Comma) {
                                self.idx += 1;
                                continue;
                            }
                            break;
                        }
                    }
                    self.expect(Tok::RParen)?;
                    if args.len() != builtin.arity() {
                        return Err(CompileError::BadArity {
                            name: builtin_name(builtin),
                            expected: builtin.arity(),
                            got: args.len(),
                        });
                    }
                    return Ok(Expr::Call(builtin, args));
                }
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    "null" => Ok(Expr::Literal(Value::Null)),
                    _ => Param::from_name(&name)
                        .map(Expr::Param)
                        .ok_or(CompileError::UnknownIdentifier(name)),
                }
            }
            Some(_) => Err(CompileError::UnexpectedToken { pos }),
            None => Err(CompileError::UnexpectedEnd),
        }
    }
}

fn builtin_name(builtin: Builtin) -> &'static str {
    match builtin {
        Builtin::Contains => "contains",
        Builtin::StartsWith => "startsWith",
        Builtin::EndsWith => "endsWith",
        Builtin::Matches => "matches",
        Builtin::Len => "len",
        Builtin::Str => "str",
        Builtin::Num => "num",
    }
}

/// A compiled check body: one expression with an implicit return.
#[derive(Clone, Debug)]
pub struct CheckProgram {
    expr: Expr,
}

impl CheckProgram {
    pub fn compile(source: &str) -> Result<CheckProgram, CompileError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(CompileError::Empty);
        }
        let mut parser = Parser { tokens, idx: 0 };
        let expr = parser.parse_or(0)?;
        if parser.idx != parser.tokens.len() {
            return Err(CompileError::UnexpectedToken { pos: parser.pos() });
        }
        Ok(CheckProgram { expr })
    }

    /// Evaluates against the bound inputs with a hard wall-clock budget.
    /// The result is coerced to boolean.
    pub fn eval(&self, inputs: &CheckInputs, budget: Duration) -> Result<bool, EvalError> {
        let mut ctx = EvalCtx { inputs, deadline: Instant::now() + budget, steps: 0 };
        let value = eval_expr(&self.expr, &mut ctx)?;
        Ok(truthy(&value))
    }
}

/// The five named values visible to check source text.
#[derive(Clone, Debug)]
pub struct CheckInputs {
    pub date: Value,
    pub level: Value,
    pub call_line: Value,
    pub arg_list: Value,
    pub bound_datas: Value,
}

impl CheckInputs {
    pub fn for_entry(entry: &LogEntry) -> CheckInputs {
        CheckInputs {
            date: Value::String(entry.timestamp.to_rfc3339()),
            level: Value::String(entry.level.as_str().to_string()),
            call_line: entry
                .origin
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
            arg_list: Value::Array(entry.args.clone()),
            bound_datas: Value::Object(entry.bound_data.clone()),
        }
    }

    /// Synthetic inputs used for the authoring-time trial execution.
    pub fn trial() -> CheckInputs {
        CheckInputs {
            date: Value::String(chrono::Utc::now().to_rfc3339()),
            level: Value::String("log".to_string()),
            call_line: Value::String("test:1".to_string()),
            arg_list: Value::Array(Vec::new()),
            bound_datas: Value::Object(Map::new()),
        }
    }
}

struct EvalCtx<'a> {
    inputs: &'a CheckInputs,
    deadline: Instant,
    steps: u32,
}

fn eval_expr(expr: &Expr, ctx: &mut EvalCtx<'_>) -> Result<Value, EvalError> {
    ctx.steps = ctx.steps.wrapping_add(1);
    if ctx.steps % DEADLINE_PROBE_EVERY == 0 && Instant::now() > ctx.deadline {
        return Err(EvalError::DeadlineExceeded);
    }

    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Param(param) => Ok(match param {
            Param::Date => ctx.inputs.date.clone(),
            Param::Type => ctx.inputs.level.clone(),
            Param::CallLine => ctx.inputs.call_line.clone(),
            Param::ArgList => ctx.inputs.arg_list.clone(),
            Param::BoundDatas => ctx.inputs.bound_datas.clone(),
        }),
        Expr::Field(target, name) => {
            let target = eval_expr(target, ctx)?;
            Ok(target.get(name.as_str()).cloned().unwrap_or(Value::Null))
        }
        Expr::Index(target, index) => {
            let target = eval_expr(target, ctx)?;
            let index = eval_expr(index, ctx)?;
            Ok(index_value(&target, &index))
        }
        Expr::Unary(op, inner) => {
            let inner = eval_expr(inner, ctx)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!truthy(&inner)),
                UnaryOp::Neg => match as_number(&inner) {
                    Some(num) => number(-num),
                    None => Value::Null,
                },
            })
        }
        Expr::And(lhs, rhs) => {
            let lhs = eval_expr(lhs, ctx)?;
            if !truthy(&lhs) {
                return Ok(lhs);
            }
            eval_expr(rhs, ctx)
        }
        Expr::Or(lhs, rhs) => {
            let lhs = eval_expr(lhs, ctx)?;
            if truthy(&lhs) {
                return Ok(lhs);
            }
            eval_expr(rhs, ctx)
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval_expr(lhs, ctx)?;
            let rhs = eval_expr(rhs, ctx)?;
            Ok(eval_binary(*op, &lhs, &rhs))
        }
        Expr::Call(builtin, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, ctx)?);
            }
            eval_builtin(*builtin, &values)
        }
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(items), _) => match as_number(index) {
            Some(num) if num >= 0.0 => {
                items.get(num as usize).cloned().unwrap_or(Value::Null)
            }
            _ => Value::Null,
        },
        (Value::Object(map), Value::String(key)) => {
            map.get(key).cloned().unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn eval_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Value {
    match op {
        BinOp::Add => match (lhs, rhs) {
            (Value::String(left), _) => Value::String(format!("{left}{}", to_text(rhs))),
            (_, Value::String(right)) => Value::String(format!("{}{right}", to_text(lhs))),
            _ => numeric_op(lhs, rhs, |a, b| Some(a + b)),
        },
        BinOp::Sub => numeric_op(lhs, rhs, |a, b| Some(a - b)),
        BinOp::Mul => numeric_op(lhs, rhs, |a, b| Some(a * b)),
        BinOp::Div => numeric_op(lhs, rhs, |a, b| (b != 0.0).then(|| a / b)),
        BinOp::Rem => numeric_op(lhs, rhs, |a, b| (b != 0.0).then(|| a % b)),
        BinOp::Eq => Value::Bool(loose_eq(lhs, rhs)),
        BinOp::Ne => Value::Bool(!loose_eq(lhs, rhs)),
        BinOp::Lt => ordered(lhs, rhs, |ord| ord == std::cmp::Ordering::Less),
        BinOp::Le => ordered(lhs, rhs, |ord| ord != std::cmp::Ordering::Greater),
        BinOp::Gt => ordered(lhs, rhs, |ord| ord == std::cmp::Ordering::Greater),
        BinOp::Ge => ordered(lhs, rhs, |ord| ord != std::cmp::Ordering::Less),
    }
}

fn numeric_op(lhs: &Value, rhs: &Value, op: impl Fn(f64, f64) -> Option<f64>) -> Value {
    match (as_number(lhs), as_number(rhs)) {
        (Some(left), Some(right)) => op(left, right).map(number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn ordered(lhs: &Value, rhs: &Value, test: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    let ord = match (lhs, rhs) {
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        _ => match (as_number(lhs), as_number(rhs)) {
            (Some(left), Some(right)) => left.partial_cmp(&right),
            _ => None,
        },
    };
    ord.map(|ord| Value::Bool(test(ord))).unwrap_or(Value::Bool(false))
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if lhs == rhs {
        return true;
    }
    match (as_number(lhs), as_number(rhs)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

fn eval_builtin(builtin: Builtin, args: &[Value]) -> Result<Value, EvalError> {
    let value = match builtin {
        Builtin::Contains => {
            Value::Bool(contains_value(&args[0], &args[1]))
        }
        Builtin::StartsWith => {
            Value::Bool(to_text(&args[0]).starts_with(&to_text(&args[1])))
        }
        Builtin::EndsWith => {
            Value::Bool(to_text(&args[0]).ends_with(&to_text(&args[1])))
        }
        Builtin::Matches => {
            let pattern = to_text(&args[1]);
            let regex = regex::Regex::new(&pattern)
                .map_err(|err| EvalError::BadPattern(err.to_string()))?;
            Value::Bool(regex.is_match(&to_text(&args[0])))
        }
        Builtin::Len => {
            let len = match &args[0] {
                Value::String(text) => Some(text.chars().count()),
                Value::Array(items) => Some(items.len()),
                Value::Object(map) => Some(map.len()),
                _ => None,
            };
            len.map(|len| number(len as f64)).unwrap_or(Value::Null)
        }
        Builtin::Str => Value::String(to_text(&args[0])),
        Builtin::Num => as_number(&args[0]).map(number).unwrap_or(Value::Null),
    };
    Ok(value)
}

fn contains_value(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        _ => to_text(haystack).contains(&to_text(needle)),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(num) => num.as_f64().map(|num| num != 0.0).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(num) => num.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn number(num: f64) -> Value {
    serde_json::Number::from_f64(num).map(Value::Number).unwrap_or(Value::Null)
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Result cache
// ---------------------------------------------------------------------------

/// Result of one predicate evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub eval_millis: f64,
}

impl CheckOutcome {
    fn skipped() -> CheckOutcome {
        CheckOutcome { passed: false, eval_millis: 0.0 }
    }
}

/// Memoized `(entry id, check id) -> outcome` rows. Purged by entry when
/// the store evicts, and by check when a check is edited or removed.
#[derive(Debug, Default)]
pub struct ResultCache {
    rows: HashMap<(u64, u64), CheckOutcome>,
}

impl ResultCache {
    pub fn get(&self, entry_id: u64, check_id: u64) -> Option<&CheckOutcome> {
        self.rows.get(&(entry_id, check_id))
    }

    pub fn insert(&mut self, entry_id: u64, check_id: u64, outcome: CheckOutcome) {
        self.rows.insert((entry_id, check_id), outcome);
    }

    pub fn purge_entry(&mut self, entry_id: u64) {
        self.rows.retain(|(entry, _), _| *entry != entry_id);
    }

    pub fn purge_check(&mut self, check_id: u64) {
        self.rows.retain(|(_, check), _| *check != check_id);
    }

    /// Drops every row whose entry id is no longer retained by the store.
    pub fn retain_entries(&mut self, valid_ids: &HashSet<u64>) {
        self.rows.retain(|(entry, _), _| valid_ids.contains(entry));
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A named, user-authored predicate with enable/kill state.
#[derive(Clone, Debug)]
pub struct Check {
    pub id: u64,
    pub name: String,
    pub source: String,
    pub enabled: bool,
    pub killed: bool,
    program: CheckProgram,
}

/// Durable form of a check: source text only, recompiled on load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredCheck {
    pub name: String,
    pub source: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Emitted when the steady-state killswitch trips.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckNotice {
    pub check_id: u64,
    pub name: String,
    pub eval_millis: f64,
}

/// Timing budgets, injectable so tests can exercise the killswitch without
/// real 25ms predicates.
#[derive(Clone, Copy, Debug)]
pub struct CheckLimits {
    pub max_checks: usize,
    pub trial_budget: Duration,
    pub kill_threshold: Duration,
}

impl Default for CheckLimits {
    fn default() -> Self {
        Self {
            max_checks: MAX_CHECKS,
            trial_budget: TRIAL_BUDGET,
            kill_threshold: KILL_THRESHOLD,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("check limit reached ({0} max)")]
    AtCapacity(usize),
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("trial execution failed: {0}")]
    TrialFailed(EvalError),
    #[error("trial execution took {millis:.1}ms (budget {budget_millis:.0}ms)")]
    TrialTooSlow { millis: f64, budget_millis: f64 },
    #[error("unknown check id: {0}")]
    NotFound(u64),
}

/// Stores and executes user predicates. Two-tier timing validation: a
/// trial budget rejects slow code at authoring time, and the steady-state
/// killswitch permanently disables code that only degrades on real data.
#[derive(Debug)]
pub struct CheckRegistry {
    checks: Vec<Check>,
    next_id: u64,
    limits: CheckLimits,
    enabled_cache: Option<Vec<u64>>,
    timings: HashMap<u64, VecDeque<(Instant, f64)>>,
    notices: Vec<CheckNotice>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::with_limits(CheckLimits::default())
    }
}

impl CheckRegistry {
    pub fn with_limits(limits: CheckLimits) -> Self {
        Self {
            checks: Vec::new(),
            next_id: 1,
            limits,
            enabled_cache: None,
            timings: HashMap::new(),
            notices: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn get(&self, id: u64) -> Option<&Check> {
        self.checks.iter().find(|check| check.id == id)
    }

    /// Validates and stores a new check. The trial runs once against
    /// synthetic inputs and must finish within the trial budget.
    pub fn add(&mut self, name: &str, source: &str) -> Result<u64, CheckError> {
        if self.checks.len() >= self.limits.max_checks {
            return Err(CheckError::AtCapacity(self.limits.max_checks));
        }
        let program = self.validate(source)?;

        let id = self.next_id;
        self.next_id += 1;
        let name = if name.trim().is_empty() {
            format!("check-{id}")
        } else {
            name.trim().to_string()
        };
        self.checks.push(Check {
            id,
            name,
            source: source.to_string(),
            enabled: true,
            killed: false,
            program,
        });
        self.enabled_cache = None;
        Ok(id)
    }

    /// Re-validates and replaces a check in place. Clears the kill flag and
    /// re-enables the check; the caller must purge its cached results.
    pub fn update(
        &mut self,
        id: u64,
        name: &str,
        source: &str,
        cache: &mut ResultCache,
    ) -> Result<(), CheckError> {
        let program = self.validate(source)?;
        let check = self
            .checks
            .iter_mut()
            .find(|check| check.id == id)
            .ok_or(CheckError::NotFound(id))?;

        if !name.trim().is_empty() {
            check.name = name.trim().to_string();
        }
        check.source = source.to_string();
        check.program = program;
        check.killed = false;
        check.enabled = true;
        // Results produced by the old code are no longer valid.
        cache.purge_check(id);
        self.timings.remove(&id);
        self.enabled_cache = None;
        Ok(())
    }

    pub fn remove(&mut self, id: u64, cache: &mut ResultCache) -> Result<(), CheckError> {
        let idx = self
            .checks
            .iter()
            .position(|check| check.id == id)
            .ok_or(CheckError::NotFound(id))?;
        self.checks.remove(idx);
        cache.purge_check(id);
        self.timings.remove(&id);
        self.enabled_cache = None;
        Ok(())
    }

    /// Flips the user-facing enabled flag. A killed check stays dead
    /// regardless; only `update` clears the kill.
    pub fn toggle(&mut self, id: u64) -> Result<bool, CheckError> {
        let check = self
            .checks
            .iter_mut()
            .find(|check| check.id == id)
            .ok_or(CheckError::NotFound(id))?;
        check.enabled = !check.enabled;
        self.enabled_cache = None;
        Ok(check.enabled)
    }

    /// Ids of checks that are enabled and not killed. Cached until the next
    /// registry mutation.
    pub fn enabled_ids(&mut self) -> Vec<u64> {
        if let Some(cached) = &self.enabled_cache {
            return cached.clone();
        }
        let ids: Vec<u64> = self
            .checks
            .iter()
            .filter(|check| check.enabled && !check.killed)
            .map(|check| check.id)
            .collect();
        self.enabled_cache = Some(ids.clone());
        ids
    }

    /// Evaluates one check against one entry through the shared cache.
    ///
    /// The cache is authoritative even for checks disabled or killed since
    /// the row was written; a given render pass stays self-consistent. The
    /// disabled/killed short-circuit is deliberately not cached so a later
    /// enable is evaluated fresh.
    pub fn run_check(
        &mut self,
        check_id: u64,
        entry: &LogEntry,
        cache: &mut ResultCache,
    ) -> CheckOutcome {
        if let Some(hit) = cache.get(entry.id, check_id) {
            return hit.clone();
        }

        let kill_threshold = self.limits.kill_threshold;
        let Some(idx) = self.checks.iter().position(|check| check.id == check_id) else {
            return CheckOutcome::skipped();
        };
        if self.checks[idx].killed || !self.checks[idx].enabled {
            return CheckOutcome::skipped();
        }

        let inputs = CheckInputs::for_entry(entry);
        let started = Instant::now();
        let passed = self.checks[idx].program.eval(&inputs, kill_threshold).unwrap_or(false);
        let elapsed = started.elapsed();
        let eval_millis = elapsed.as_secs_f64() * 1000.0;

        self.record_timing(check_id, eval_millis);

        if elapsed > kill_threshold {
            let check = &mut self.checks[idx];
            check.killed = true;
            check.enabled = false;
            let notice =
                CheckNotice { check_id, name: check.name.clone(), eval_millis };
            self.notices.push(notice);
            self.enabled_cache = None;
        }

        let outcome = CheckOutcome { passed, eval_millis };
        cache.insert(entry.id, check_id, outcome.clone());
        outcome
    }

    fn record_timing(&mut self, check_id: u64, eval_millis: f64) {
        let now = Instant::now();
        let series = self.timings.entry(check_id).or_default();
        series.push_back((now, eval_millis));
        while let Some((at, _)) = series.front() {
            if now.duration_since(*at) > TIMING_WINDOW {
                series.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(samples, avg ms, max ms)` over the trailing window.
    pub fn timing_stats(&self, check_id: u64) -> Option<(usize, f64, f64)> {
        let series = self.timings.get(&check_id)?;
        if series.is_empty() {
            return None;
        }
        let count = series.len();
        let sum: f64 = series.iter().map(|(_, millis)| millis).sum();
        let max = series.iter().map(|(_, millis)| *millis).fold(0.0, f64::max);
        Some((count, sum / count as f64, max))
    }

    /// Killswitch notices accumulated since the last drain.
    pub fn take_notices(&mut self) -> Vec<CheckNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn export(&self) -> Vec<StoredCheck> {
        self.checks
            .iter()
            .map(|check| StoredCheck {
                name: check.name.clone(),
                source: check.source.clone(),
                enabled: check.enabled,
            })
            .collect()
    }

    /// Restores persisted checks, skipping any whose source no longer
    /// compiles or passes trial. Returns the number restored.
    pub fn restore(&mut self, stored: Vec<StoredCheck>) -> usize {
        let mut restored = 0;
        for item in stored {
            match self.add(&item.name, &item.source) {
                Ok(id) => {
                    restored += 1;
                    if !item.enabled {
                        let _ = self.toggle(id);
                    }
                }
                Err(error) => {
                    tracing::warn!(name = %item.name, %error, "dropping persisted check");
                }
            }
        }
        restored
    }

    fn validate(&self, source: &str) -> Result<CheckProgram, CheckError> {
        let program = CheckProgram::compile(source)?;
        let inputs = CheckInputs::trial();
        let started = Instant::now();
        let result = program.eval(&inputs, self.limits.trial_budget);
        let elapsed = started.elapsed();
        if let Err(error) = result {
            if error == EvalError::DeadlineExceeded || elapsed > self.limits.trial_budget {
                return Err(CheckError::TrialTooSlow {
                    millis: elapsed.as_secs_f64() * 1000.0,
                    budget_millis: self.limits.trial_budget.as_secs_f64() * 1000.0,
                });
            }
            return Err(CheckError::TrialFailed(error));
        }
        if elapsed > self.limits.trial_budget {
            return Err(CheckError::TrialTooSlow {
                millis: elapsed.as_secs_f64() * 1000.0,
                budget_millis: self.limits.trial_budget.as_secs_f64() * 1000.0,
            });
        }
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::{fixture, rstest};
    use serde_json::json;

    use crate::logdeck_core::Level;

    fn entry(id: u64, level: Level, args: Vec<Value>) -> LogEntry {
        LogEntry {
            id,
            level,
            timestamp: Utc::now(),
            origin: Some("src/app.js:12".to_string()),
            args,
            bound_data: serde_json::Map::new(),
            is_new: false,
        }
    }

    fn eval_source(source: &str, entry: &LogEntry) -> bool {
        let program = CheckProgram::compile(source).expect("compile");
        program
            .eval(&CheckInputs::for_entry(entry), Duration::from_millis(100))
            .expect("eval")
    }

    #[rstest]
    #[case("true", true)]
    #[case("false", false)]
    #[case("1 + 1 == 2", true)]
    #[case("type == 'error'", true)]
    #[case("type == 'warn'", false)]
    #[case("contains(callLine, 'app.js')", true)]
    #[case("startsWith(callLine, 'src/')", true)]
    #[case("endsWith(callLine, ':12')", true)]
    #[case("len(argList) > 0", true)]
    #[case("argList[0] == 'boom'", true)]
    #[case("matches(str(argList[0]), '^bo+m$')", true)]
    #[case("!contains(argList, 'quiet')", true)]
    #[case("num('3') * 2 == 6", true)]
    #[case("boundDatas.user == null", true)]
    #[case("(1 < 2) && (2 < 1) || true", true)]
    fn expression_language_evaluates(#[case] source: &str, #[case] expected: bool) {
        let entry = entry(1, Level::Error, vec![json!("boom")]);
        assert_eq!(eval_source(source, &entry), expected, "source: {source}");
    }

    #[rstest]
    #[case("")]
    #[case("1 +")]
    #[case("unknownIdent")]
    #[case("frobnicate(1)")]
    #[case("contains(argList)")]
    #[case("'unterminated")]
    #[case("a = b")]
    fn bad_sources_fail_compilation(#[case] source: &str) {
        assert!(CheckProgram::compile(source).is_err(), "source: {source}");
    }

    #[test]
    fn bound_data_fields_are_reachable() {
        let mut entry = entry(1, Level::Info, vec![]);
        entry
            .bound_data
            .insert("requestId".to_string(), json!("abc-123"));
        assert!(eval_source("boundDatas.requestId == 'abc-123'", &entry));
        assert!(eval_source("boundDatas['requestId'] != null", &entry));
    }

    #[test]
    fn runtime_bad_pattern_is_an_eval_error() {
        let program = CheckProgram::compile("matches('x', '[unclosed')").expect("compile");
        let result = program.eval(&CheckInputs::trial(), Duration::from_millis(100));
        assert!(matches!(result, Err(EvalError::BadPattern(_))));
    }

    #[fixture]
    fn registry() -> CheckRegistry {
        CheckRegistry::default()
    }

    #[fixture]
    fn cache() -> ResultCache {
        ResultCache::default()
    }

    #[rstest]
    fn add_assigns_ids_and_defaults_blank_names(mut registry: CheckRegistry) {
        let first = registry.add("errors only", "type == 'error'").expect("add");
        let second = registry.add("   ", "true").expect("add");
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(registry.get(second).unwrap().name, "check-2");
        assert!(registry.get(first).unwrap().enabled);
        assert!(!registry.get(first).unwrap().killed);
    }

    #[rstest]
    fn add_rejects_at_capacity() {
        let mut registry = CheckRegistry::with_limits(CheckLimits {
            max_checks: 2,
            ..CheckLimits::default()
        });
        registry.add("a", "true").expect("add");
        registry.add("b", "true").expect("add");
        let result = registry.add("c", "true");
        assert!(matches!(result, Err(CheckError::AtCapacity(2))));
        assert_eq!(registry.len(), 2);
    }

    #[rstest]
    fn add_rejects_compile_errors_without_storing(mut registry: CheckRegistry) {
        let result = registry.add("bad", "1 +");
        assert!(matches!(result, Err(CheckError::Compile(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn add_rejects_slow_trial_without_storing() {
        // A zero budget makes any execution exceed the trial limit.
        let mut registry = CheckRegistry::with_limits(CheckLimits {
            trial_budget: Duration::ZERO,
            ..CheckLimits::default()
        });
        let result = registry.add("slow", "1 + 1 == 2");
        assert!(matches!(result, Err(CheckError::TrialTooSlow { .. })));
        assert!(registry.is_empty());
    }

    #[rstest]
    fn run_check_caches_and_returns_identical_outcome(
        mut registry: CheckRegistry,
        mut cache: ResultCache,
    ) {
        let id = registry.add("always", "true").expect("add");
        let entry = entry(7, Level::Log, vec![]);

        let first = registry.run_check(id, &entry, &mut cache);
        assert!(first.passed);
        assert_eq!(cache.len(), 1);

        let second = registry.run_check(id, &entry, &mut cache);
        assert_eq!(first, second);
        assert_eq!(second.eval_millis, first.eval_millis);
    }

    #[rstest]
    fn disabled_check_short_circuits_without_caching(
        mut registry: CheckRegistry,
        mut cache: ResultCache,
    ) {
        let id = registry.add("always", "true").expect("add");
        registry.toggle(id).expect("toggle");

        let entry = entry(3, Level::Log, vec![]);
        let outcome = registry.run_check(id, &entry, &mut cache);
        assert!(!outcome.passed);
        assert_eq!(outcome.eval_millis, 0.0);
        assert!(cache.is_empty());

        // Re-enabling evaluates fresh instead of seeing a stale skip row.
        registry.toggle(id).expect("toggle");
        let outcome = registry.run_check(id, &entry, &mut cache);
        assert!(outcome.passed);
    }

    #[rstest]
    fn cached_result_wins_even_after_disable(
        mut registry: CheckRegistry,
        mut cache: ResultCache,
    ) {
        let id = registry.add("always", "true").expect("add");
        let entry = entry(5, Level::Log, vec![]);
        let cached = registry.run_check(id, &entry, &mut cache);
        assert!(cached.passed);

        registry.toggle(id).expect("toggle");
        let after_disable = registry.run_check(id, &entry, &mut cache);
        assert_eq!(after_disable, cached);
    }

    #[test]
    fn killswitch_trips_once_and_sticks() {
        // Zero kill threshold: the first real execution exceeds it.
        let mut registry = CheckRegistry::with_limits(CheckLimits {
            kill_threshold: Duration::ZERO,
            ..CheckLimits::default()
        });
        let mut cache = ResultCache::default();
        let id = registry.add("hot", "len(str(argList)) >= 0").expect("add");

        let first = entry(1, Level::Log, vec![json!("x")]);
        let outcome = registry.run_check(id, &first, &mut cache);
        assert!(!outcome.passed);

        let check = registry.get(id).unwrap();
        assert!(check.killed);
        assert!(!check.enabled);

        let notices = registry.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].check_id, id);

        // Subsequent entries skip execution entirely.
        let second = entry(2, Level::Log, vec![json!("y")]);
        let outcome = registry.run_check(id, &second, &mut cache);
        assert_eq!(outcome, CheckOutcome::skipped());
        assert!(registry.take_notices().is_empty());

        // Toggling enabled cannot resurrect a killed check.
        registry.toggle(id).expect("toggle");
        let outcome = registry.run_check(id, &second, &mut cache);
        assert_eq!(outcome, CheckOutcome::skipped());
    }

    #[test]
    fn update_clears_kill_and_purges_stale_results() {
        let mut registry = CheckRegistry::with_limits(CheckLimits {
            kill_threshold: Duration::ZERO,
            ..CheckLimits::default()
        });
        let mut cache = ResultCache::default();
        let id = registry.add("hot", "true").expect("add");

        let first = entry(1, Level::Log, vec![]);
        registry.run_check(id, &first, &mut cache);
        assert!(registry.get(id).unwrap().killed);
        assert_eq!(cache.len(), 1);

        // Relax the threshold, then edit the source; the kill must clear
        // and the old cached row must be gone.
        registry.limits.kill_threshold = Duration::from_millis(100);
        registry.update(id, "hot", "false", &mut cache).expect("update");
        let check = registry.get(id).unwrap();
        assert!(!check.killed);
        assert!(check.enabled);
        assert!(cache.is_empty());

        let outcome = registry.run_check(id, &first, &mut cache);
        assert!(!outcome.passed, "recomputed with the new source");
        assert_eq!(cache.len(), 1);
    }

    #[rstest]
    fn remove_purges_cache_rows(mut registry: CheckRegistry, mut cache: ResultCache) {
        let id = registry.add("gone", "true").expect("add");
        let entry = entry(1, Level::Log, vec![]);
        registry.run_check(id, &entry, &mut cache);
        assert_eq!(cache.len(), 1);

        registry.remove(id, &mut cache).expect("remove");
        assert!(registry.is_empty());
        assert!(cache.is_empty());

        let outcome = registry.run_check(id, &entry, &mut cache);
        assert_eq!(outcome, CheckOutcome::skipped());
    }

    #[rstest]
    fn runtime_errors_evaluate_to_false_but_keep_the_check(
        mut registry: CheckRegistry,
        mut cache: ResultCache,
    ) {
        // Pattern built from entry data: compiles and passes trial (the
        // synthetic argList yields a harmless pattern) but fails on real
        // input.
        let id = registry
            .add("dynamic", "matches('x', str(argList[0]))")
            .expect("add");
        let bad = entry(1, Level::Log, vec![json!("[unclosed")]);
        let outcome = registry.run_check(id, &bad, &mut cache);
        assert!(!outcome.passed);
        let check = registry.get(id).unwrap();
        assert!(check.enabled);
        assert!(!check.killed);
    }

    #[rstest]
    fn enabled_ids_cache_invalidates_on_mutation(mut registry: CheckRegistry) {
        let first = registry.add("a", "true").expect("add");
        let second = registry.add("b", "true").expect("add");
        assert_eq!(registry.enabled_ids(), vec![first, second]);

        registry.toggle(first).expect("toggle");
        assert_eq!(registry.enabled_ids(), vec![second]);

        let mut cache = ResultCache::default();
        registry.remove(second, &mut cache).expect("remove");
        assert!(registry.enabled_ids().is_empty());
    }

    #[rstest]
    fn clean_cache_drops_rows_for_evicted_entries(
        mut registry: CheckRegistry,
        mut cache: ResultCache,
    ) {
        let id = registry.add("always", "true").expect("add");
        for entry_id in 1..=4 {
            let entry = entry(entry_id, Level::Log, vec![]);
            registry.run_check(id, &entry, &mut cache);
        }
        assert_eq!(cache.len(), 4);

        let valid: HashSet<u64> = [2, 3, 4].into_iter().collect();
        cache.retain_entries(&valid);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(1, id).is_none());
    }

    #[rstest]
    fn export_restore_round_trips_sources(mut registry: CheckRegistry) {
        let first = registry.add("errors", "type == 'error'").expect("add");
        registry.add("all", "true").expect("add");
        registry.toggle(first).expect("toggle");

        let stored = registry.export();
        let mut fresh = CheckRegistry::default();
        assert_eq!(fresh.restore(stored), 2);
        assert_eq!(fresh.len(), 2);
        assert!(!fresh.checks()[0].enabled);
        assert!(fresh.checks()[1].enabled);
    }

    #[rstest]
    fn timing_stats_cover_recent_runs(mut registry: CheckRegistry, mut cache: ResultCache) {
        let id = registry.add("always", "true").expect("add");
        for entry_id in 1..=3 {
            let entry = entry(entry_id, Level::Log, vec![]);
            registry.run_check(id, &entry, &mut cache);
        }
        let (count, avg, max) = registry.timing_stats(id).expect("stats");
        assert_eq!(count, 3);
        assert!(avg >= 0.0);
        assert!(max >= avg);
    }
}
