//! Arithmetic expressions over metric keys.
//!
//! Supports:
//! - numeric literals and metric references (`orders_total`, `a.b` style keys)
//! - `+ - * /`, unary minus, parentheses
//! - `nullif(a, b)`, `coalesce(a, ...)`, `abs(a)`, `round(a[, digits])`
//!
//! Evaluation never raises on data: division by zero and null operands give null.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::value::as_f64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    Number {
        value: f64,
    },
    MetricRef {
        name: String,
    },
    Negate {
        expr: Box<Expr>,
    },
    Binary {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Func {
        func: Function,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    NullIf,
    Coalesce,
    Abs,
    Round,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "nullif" => Some(Function::NullIf),
            "coalesce" => Some(Function::Coalesce),
            "abs" => Some(Function::Abs),
            "round" => Some(Function::Round),
            _ => None,
        }
    }

    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Function::NullIf => (2, Some(2)),
            Function::Coalesce => (1, None),
            Function::Abs => (1, Some(1)),
            Function::Round => (1, Some(2)),
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            Function::NullIf => "NULLIF",
            Function::Coalesce => "COALESCE",
            Function::Abs => "ABS",
            Function::Round => "ROUND",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// A metric reference with no value in the row being evaluated.
    #[error("missing value for {0}")]
    MissingRef(String),
    #[error("{function} called with {got} arguments")]
    Arity { function: &'static str, got: usize },
}

pub fn parse_expr(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some((offset, tok)) => Err(ParseError {
            offset: *offset,
            message: format!("unexpected {tok:?}"),
        }),
    }
}

impl Expr {
    pub fn metric(name: &str) -> Self {
        Expr::MetricRef {
            name: name.to_string(),
        }
    }

    /// Metric keys referenced by this expression, first occurrence order.
    pub fn references(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<String>) {
        match self {
            Expr::MetricRef { name } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Negate { expr } => expr.collect_refs(out),
            Expr::Binary { left, right, .. } => {
                left.collect_refs(out);
                right.collect_refs(out);
            }
            Expr::Func { args, .. } => args.iter().for_each(|a| a.collect_refs(out)),
            Expr::Number { .. } => {}
        }
    }

    /// Evaluate against a lookup; `None` from the lookup means the key is absent.
    pub fn evaluate<'a, F>(&self, lookup: F) -> Result<Option<f64>, EvalError>
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        self.eval_with(&lookup)
    }

    fn eval_with<'a, F>(&self, lookup: &F) -> Result<Option<f64>, EvalError>
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        match self {
            Expr::Number { value } => Ok(Some(*value)),
            Expr::MetricRef { name } => match lookup(name) {
                Some(v) => Ok(as_f64(v)),
                None => Err(EvalError::MissingRef(name.clone())),
            },
            Expr::Negate { expr } => Ok(expr.eval_with(lookup)?.map(|v| -v)),
            Expr::Binary { op, left, right } => {
                let l = left.eval_with(lookup)?;
                let r = right.eval_with(lookup)?;
                let (Some(l), Some(r)) = (l, r) else {
                    return Ok(None);
                };
                let out = match op {
                    ArithOp::Add => l + r,
                    ArithOp::Subtract => l - r,
                    ArithOp::Multiply => l * r,
                    ArithOp::Divide => {
                        if r == 0.0 {
                            return Ok(None);
                        }
                        l / r
                    }
                };
                Ok(out.is_finite().then_some(out))
            }
            Expr::Func { func, args } => {
                let (min, max) = func.arity();
                if args.len() < min || max.is_some_and(|max| args.len() > max) {
                    return Err(EvalError::Arity {
                        function: func.sql_name(),
                        got: args.len(),
                    });
                }
                let values = args
                    .iter()
                    .map(|a| a.eval_with(lookup))
                    .collect::<Result<Vec<_>, _>>()?;
                let arg = |i: usize| values.get(i).copied().flatten();
                Ok(match func {
                    Function::NullIf => match (arg(0), arg(1)) {
                        (Some(a), Some(b)) if a == b => None,
                        (a, _) => a,
                    },
                    Function::Coalesce => values.iter().copied().flatten().next(),
                    Function::Abs => arg(0).map(f64::abs),
                    Function::Round => {
                        let digits = arg(1).unwrap_or(0.0);
                        arg(0).map(|v| {
                            let scale = 10f64.powi(digits as i32);
                            (v * scale).round() / scale
                        })
                    }
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' | '-' | '*' | '/' | '(' | ')' | ',' => {
                let tok = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Comma,
                };
                tokens.push((offset, tok));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let value = text.parse::<f64>().map_err(|_| ParseError {
                    offset,
                    message: format!("invalid number {text}"),
                })?;
                tokens.push((offset, Token::Number(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_ascii_alphanumeric()
                        || chars[i].1 == '_'
                        || chars[i].1 == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((offset, Token::Ident(text)));
            }
            other => {
                return Err(ParseError {
                    offset,
                    message: format!("unexpected character '{other}'"),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn offset(&self) -> usize {
        self.peek()
            .map(|(o, _)| *o)
            .or_else(|| self.tokens.last().map(|(o, _)| *o + 1))
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek().map(|(_, t)| t) == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat(&Token::Plus) {
                ArithOp::Add
            } else if self.eat(&Token::Minus) {
                ArithOp::Subtract
            } else {
                return Ok(left);
            };
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.factor()?;
        loop {
            let op = if self.eat(&Token::Star) {
                ArithOp::Multiply
            } else if self.eat(&Token::Slash) {
                ArithOp::Divide
            } else {
                return Ok(left);
            };
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Minus) => Ok(Expr::Negate {
                expr: Box::new(self.factor()?),
            }),
            Some(Token::Number(value)) => Ok(Expr::Number { value }),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    self.call(&name, offset)
                } else {
                    Ok(Expr::MetricRef { name })
                }
            }
            Some(tok) => Err(ParseError {
                offset,
                message: format!("unexpected {tok:?}"),
            }),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn call(&mut self, name: &str, offset: usize) -> Result<Expr, ParseError> {
        let func = Function::from_name(name).ok_or_else(|| ParseError {
            offset,
            message: format!("unknown function {name}"),
        })?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expression()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                if self.eat(&Token::RParen) {
                    break;
                }
                return Err(self.error("expected ',' or ')'"));
            }
        }
        let (min, max) = func.arity();
        if args.len() < min || max.is_some_and(|m| args.len() > m) {
            return Err(ParseError {
                offset,
                message: format!("{name} called with {} arguments", args.len()),
            });
        }
        Ok(Expr::Func { func, args })
    }
}
