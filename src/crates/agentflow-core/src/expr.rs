//! Expression parsing and evaluation for declarative workflows
//!
//! Action fields whose string value starts with the `=` sigil are
//! expressions; everything else is a literal. Expressions are parsed once
//! at compile time into a typed tree and evaluated against scope state
//! through a [`ScopeReader`] - the evaluator is pure, has a closed
//! built-in function table, and never issues scope writes.
//!
//! Supported constructs: variable paths (`topic.items.count`), literals,
//! arithmetic (`+ - * / %`), comparison, boolean operators, string
//! concatenation (`&`), indexing (`topic.items[0]`) and the built-in
//! functions `UserMessage`, `Len`, `Count`, `IsBlank`, `Lower`, `Upper`,
//! `ParseNumber`, `ParseBool`, `Concat`, `First`, `Last`.

use crate::scopes::{ScopeKind, ScopeState};
use serde_json::{json, Value};
use thiserror::Error;

/// Sigil marking a string field as an expression
pub const EXPR_SIGIL: char = '=';

/// Expression evaluation or parse failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (offset {offset})")]
pub struct ExprError {
    pub message: String,
    pub offset: usize,
}

impl ExprError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Read access to scope state during evaluation
pub trait ScopeReader {
    fn read(&self, scope: ScopeKind, key: &str) -> Option<Value>;
}

impl ScopeReader for ScopeState {
    fn read(&self, scope: ScopeKind, key: &str) -> Option<Value> {
        ScopeState::read(self, scope, key).cloned()
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// A parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Scope plus dotted path segments
    Path(ScopeKind, Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
}

/// A compiled action field: literal as written, or a parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledValue {
    Literal(Value),
    Expr { source: String, expr: Expr },
}

impl CompiledValue {
    /// Compile a raw YAML field; strings starting with `=` are parsed
    pub fn compile(raw: &Value) -> Result<Self, ExprError> {
        if let Some(text) = raw.as_str() {
            if let Some(body) = text.strip_prefix(EXPR_SIGIL) {
                return Ok(CompiledValue::Expr {
                    source: text.to_string(),
                    expr: parse(body)?,
                });
            }
        }
        Ok(CompiledValue::Literal(raw.clone()))
    }

    /// Evaluate against scope state
    pub fn evaluate(&self, reader: &dyn ScopeReader) -> Result<Value, ExprError> {
        match self {
            CompiledValue::Literal(value) => Ok(value.clone()),
            CompiledValue::Expr { expr, .. } => evaluate(expr, reader),
        }
    }

    /// Source text for diagnostics
    pub fn source(&self) -> String {
        match self {
            CompiledValue::Literal(value) => value.to_string(),
            CompiledValue::Expr { source, .. } => source.clone(),
        }
    }
}

/// Parse an expression body (without the sigil)
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(ExprError::new(
            format!("unexpected trailing token '{}'", parser.tokens[parser.pos].0),
            parser.tokens[parser.pos].1,
        ));
    }
    Ok(expr)
}

/// Evaluate a parsed expression against scope state
pub fn evaluate(expr: &Expr, reader: &dyn ScopeReader) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(scope, segments) => {
            let mut value = reader.read(*scope, &segments[0]).unwrap_or(Value::Null);
            for segment in &segments[1..] {
                value = value.get(segment).cloned().unwrap_or(Value::Null);
            }
            Ok(value)
        }
        Expr::Unary(op, inner) => {
            let value = evaluate(inner, reader)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOp::Neg => {
                    if let Some(n) = value.as_i64() {
                        Ok(json!(-n))
                    } else if let Some(n) = value.as_f64() {
                        Ok(json!(-n))
                    } else {
                        Err(ExprError::new("cannot negate a non-number", 0))
                    }
                }
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            // Short-circuit boolean operators.
            match op {
                BinOp::And => {
                    let left = evaluate(lhs, reader)?;
                    if !is_truthy(&left) {
                        return Ok(Value::Bool(false));
                    }
                    return Ok(Value::Bool(is_truthy(&evaluate(rhs, reader)?)));
                }
                BinOp::Or => {
                    let left = evaluate(lhs, reader)?;
                    if is_truthy(&left) {
                        return Ok(Value::Bool(true));
                    }
                    return Ok(Value::Bool(is_truthy(&evaluate(rhs, reader)?)));
                }
                _ => {}
            }
            let left = evaluate(lhs, reader)?;
            let right = evaluate(rhs, reader)?;
            apply_binary(*op, &left, &right)
        }
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, reader)?);
            }
            call_builtin(name, &values, reader)
        }
        Expr::Index(container, index) => {
            let container = evaluate(container, reader)?;
            let index = evaluate(index, reader)?;
            Ok(match (&container, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            })
        }
    }
}

/// Truthiness used by boolean operators and conditions
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Render a value the way string concatenation sees it
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Concat => Ok(json!(format!(
            "{}{}",
            to_display_string(left),
            to_display_string(right)
        ))),
        BinOp::Add => {
            if left.is_string() || right.is_string() {
                return Ok(json!(format!(
                    "{}{}",
                    to_display_string(left),
                    to_display_string(right)
                )));
            }
            numeric_op(left, right, |a, b| a + b)
        }
        BinOp::Sub => numeric_op(left, right, |a, b| a - b),
        BinOp::Mul => numeric_op(left, right, |a, b| a * b),
        BinOp::Mod => numeric_op(left, right, |a, b| a % b),
        BinOp::Div => {
            let a = as_number(left)?;
            let b = as_number(right)?;
            if b == 0.0 {
                return Err(ExprError::new("division by zero", 0));
            }
            Ok(number_value(a / b))
        }
        BinOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(left, right)?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinOp::And | BinOp::Or => unreachable!("short-circuited above"),
    }
}

fn numeric_op(left: &Value, right: &Value, op: impl Fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    let a = as_number(left)?;
    let b = as_number(right)?;
    Ok(number_value(op(a, b)))
}

fn as_number(value: &Value) -> Result<f64, ExprError> {
    value
        .as_f64()
        .ok_or_else(|| ExprError::new(format!("'{}' is not a number", value), 0))
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let a = as_number(left)?;
            let b = as_number(right)?;
            a.partial_cmp(&b)
                .ok_or_else(|| ExprError::new("values are not comparable", 0))
        }
    }
}

fn call_builtin(name: &str, args: &[Value], reader: &dyn ScopeReader) -> Result<Value, ExprError> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    match name {
        "UserMessage" => Ok(reader
            .read(ScopeKind::System, "user_message")
            .unwrap_or(Value::Null)),
        "Len" | "Count" => Ok(match arg(0) {
            Value::String(s) => json!(s.chars().count()),
            Value::Array(items) => json!(items.len()),
            Value::Object(map) => match map.get("rows").and_then(Value::as_array) {
                Some(rows) => json!(rows.len()),
                None => json!(map.len()),
            },
            Value::Null => json!(0),
            other => {
                return Err(ExprError::new(
                    format!("{}() expects a string, list or table, got '{}'", name, other),
                    0,
                ))
            }
        }),
        "IsBlank" => Ok(Value::Bool(match arg(0) {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        })),
        "Lower" => Ok(json!(to_display_string(&arg(0)).to_lowercase())),
        "Upper" => Ok(json!(to_display_string(&arg(0)).to_uppercase())),
        "ParseNumber" => match arg(0) {
            Value::Number(n) => Ok(Value::Number(n)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(number_value)
                .map_err(|_| ExprError::new(format!("cannot parse '{}' as a number", s), 0)),
            other => Err(ExprError::new(
                format!("cannot parse '{}' as a number", other),
                0,
            )),
        },
        "ParseBool" => match arg(0) {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => Ok(Value::Bool(true)),
                "false" | "no" => Ok(Value::Bool(false)),
                _ => Err(ExprError::new(format!("cannot parse '{}' as a bool", s), 0)),
            },
            other => Err(ExprError::new(
                format!("cannot parse '{}' as a bool", other),
                0,
            )),
        },
        "Concat" => Ok(json!(args
            .iter()
            .map(to_display_string)
            .collect::<Vec<_>>()
            .join(""))),
        "First" => Ok(arg(0)
            .as_array()
            .and_then(|items| items.first().cloned())
            .unwrap_or(Value::Null)),
        "Last" => Ok(arg(0)
            .as_array()
            .and_then(|items| items.last().cloned())
            .unwrap_or(Value::Null)),
        other => Err(ExprError::new(format!("unknown function '{}'", other), 0)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Symbol(&'static str),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Int(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Symbol(s) => write!(f, "{}", s),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() {
            let mut text = String::new();
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                if chars[i] == '.' {
                    // A trailing dot belongs to member access, not the number.
                    if i + 1 >= chars.len() || !chars[i + 1].is_ascii_digit() {
                        break;
                    }
                    is_float = true;
                }
                text.push(chars[i]);
                i += 1;
            }
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| {
                    ExprError::new(format!("invalid number '{}'", text), start)
                })?)
            } else {
                Token::Int(text.parse().map_err(|_| {
                    ExprError::new(format!("invalid number '{}'", text), start)
                })?)
            };
            tokens.push((token, start));
        } else if c.is_alphabetic() || c == '_' {
            let mut text = String::new();
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                text.push(chars[i]);
                i += 1;
            }
            tokens.push((Token::Ident(text), start));
        } else if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            let mut closed = false;
            while i < chars.len() {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    text.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if chars[i] == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                text.push(chars[i]);
                i += 1;
            }
            if !closed {
                return Err(ExprError::new("unterminated string literal", start));
            }
            tokens.push((Token::Str(text), start));
        } else {
            let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let symbol = match two.as_str() {
                "==" | "!=" | "<=" | ">=" | "&&" | "||" => {
                    i += 2;
                    match two.as_str() {
                        "==" => "==",
                        "!=" => "!=",
                        "<=" => "<=",
                        ">=" => ">=",
                        "&&" => "&&",
                        _ => "||",
                    }
                }
                _ => {
                    i += 1;
                    match c {
                        '+' => "+",
                        '-' => "-",
                        '*' => "*",
                        '/' => "/",
                        '%' => "%",
                        '&' => "&",
                        '<' => "<",
                        '>' => ">",
                        '!' => "!",
                        '(' => "(",
                        ')' => ")",
                        '[' => "[",
                        ']' => "]",
                        ',' => ",",
                        '.' => ".",
                        other => {
                            return Err(ExprError::new(
                                format!("unexpected character '{}'", other),
                                start,
                            ))
                        }
                    }
                }
            };
            tokens.push((Token::Symbol(symbol), start));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, o)| *o)
            .unwrap_or_else(|| self.tokens.last().map(|(_, o)| o + 1).unwrap_or(0))
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> Result<(), ExprError> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(ExprError::new(
                format!("expected '{}'", symbol),
                self.offset(),
            ))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.eat_symbol("||") {
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_equality()?;
        while self.eat_symbol("&&") {
            let right = self.parse_equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.eat_symbol("==") {
                BinOp::Eq
            } else if self.eat_symbol("!=") {
                BinOp::Ne
            } else {
                return Ok(left);
            };
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.eat_symbol("<=") {
                BinOp::Le
            } else if self.eat_symbol(">=") {
                BinOp::Ge
            } else if self.eat_symbol("<") {
                BinOp::Lt
            } else if self.eat_symbol(">") {
                BinOp::Gt
            } else {
                return Ok(left);
            };
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_symbol("+") {
                BinOp::Add
            } else if self.eat_symbol("-") {
                BinOp::Sub
            } else if self.eat_symbol("&") {
                BinOp::Concat
            } else {
                return Ok(left);
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat_symbol("*") {
                BinOp::Mul
            } else if self.eat_symbol("/") {
                BinOp::Div
            } else if self.eat_symbol("%") {
                BinOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat_symbol("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)));
        }
        if self.eat_symbol("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_symbol("[") {
                let index = self.parse_or()?;
                self.expect_symbol("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_symbol(".") {
                let offset = self.offset();
                match self.peek().cloned() {
                    Some(Token::Ident(name)) => {
                        self.pos += 1;
                        expr = Expr::Index(Box::new(expr), Box::new(Expr::Literal(json!(name))));
                    }
                    _ => return Err(ExprError::new("expected member name after '.'", offset)),
                }
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.peek().cloned() {
            Some(Token::Int(n)) => {
                self.pos += 1;
                Ok(Expr::Literal(json!(n)))
            }
            Some(Token::Float(n)) => {
                self.pos += 1;
                Ok(Expr::Literal(json!(n)))
            }
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Expr::Literal(json!(s)))
            }
            Some(Token::Symbol("(")) => {
                self.pos += 1;
                let expr = self.parse_or()?;
                self.expect_symbol(")")?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => return Ok(Expr::Literal(json!(true))),
                    "false" => return Ok(Expr::Literal(json!(false))),
                    "null" => return Ok(Expr::Literal(Value::Null)),
                    _ => {}
                }
                if let Some(scope) = ScopeKind::parse(&name) {
                    let mut segments = Vec::new();
                    // A path needs at least one key after the scope name.
                    self.expect_symbol(".")?;
                    loop {
                        match self.peek().cloned() {
                            Some(Token::Ident(segment)) => {
                                self.pos += 1;
                                segments.push(segment);
                            }
                            _ => {
                                return Err(ExprError::new(
                                    "expected key after '.'",
                                    self.offset(),
                                ))
                            }
                        }
                        if !matches!(self.peek(), Some(Token::Symbol("."))) {
                            break;
                        }
                        // Stop consuming dots that belong to a postfix on
                        // something else (paths only chain identifiers).
                        match self.tokens.get(self.pos + 1) {
                            Some((Token::Ident(_), _)) => {
                                self.pos += 1;
                            }
                            _ => break,
                        }
                    }
                    return Ok(Expr::Path(scope, segments));
                }
                if self.eat_symbol("(") {
                    let mut args = Vec::new();
                    if !self.eat_symbol(")") {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat_symbol(")") {
                                break;
                            }
                            self.expect_symbol(",")?;
                        }
                    }
                    return Ok(Expr::Call(name, args));
                }
                Err(ExprError::new(
                    format!("unknown identifier '{}'", name),
                    offset,
                ))
            }
            _ => Err(ExprError::new("expected expression", offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapReader(ScopeState);

    impl MapReader {
        fn new() -> Self {
            let mut scopes = ScopeState::new();
            scopes.set_system("user_message", json!("hello there"));
            Self(scopes)
        }

        fn with_topic(mut self, key: &str, value: Value) -> Self {
            self.0.commit(vec![(
                "test".to_string(),
                crate::scopes::ScopeWrite::set(ScopeKind::Topic, key, value),
            )]);
            self
        }
    }

    impl ScopeReader for MapReader {
        fn read(&self, scope: ScopeKind, key: &str) -> Option<Value> {
            self.0.read(scope, key).cloned()
        }
    }

    fn eval(source: &str, reader: &MapReader) -> Value {
        evaluate(&parse(source).unwrap(), reader).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let reader = MapReader::new();
        assert_eq!(eval("1 + 2 * 3", &reader), json!(7));
        assert_eq!(eval("(1 + 2) * 3", &reader), json!(9));
        assert_eq!(eval("7 % 4", &reader), json!(3));
        assert_eq!(eval("10 / 4", &reader), json!(2.5));
        assert_eq!(eval("-3 + 5", &reader), json!(2));
    }

    #[test]
    fn test_paths_and_indexing() {
        let reader = MapReader::new()
            .with_topic("items", json!([1, 2, 3]))
            .with_topic("user", json!({"name": "ada"}));
        assert_eq!(eval("topic.items[1]", &reader), json!(2));
        assert_eq!(eval("topic.user.name", &reader), json!("ada"));
        assert_eq!(eval("topic.missing", &reader), Value::Null);
    }

    #[test]
    fn test_comparison_and_boolean() {
        let reader = MapReader::new().with_topic("acc", json!(6));
        assert_eq!(eval("topic.acc > 3", &reader), json!(true));
        assert_eq!(eval("topic.acc == 6 && topic.acc < 10", &reader), json!(true));
        assert_eq!(eval("!(topic.acc >= 7)", &reader), json!(true));
        assert_eq!(eval("1 == 1.0", &reader), json!(true));
    }

    #[test]
    fn test_string_operations() {
        let reader = MapReader::new().with_topic("lang", json!("fr"));
        assert_eq!(eval("topic.lang == 'fr'", &reader), json!(true));
        assert_eq!(eval("'x:' & topic.lang", &reader), json!("x:fr"));
        assert_eq!(eval("'n=' + 12", &reader), json!("n=12"));
    }

    #[test]
    fn test_builtins() {
        let reader = MapReader::new().with_topic("items", json!(["a", "b"]));
        assert_eq!(eval("UserMessage()", &reader), json!("hello there"));
        assert_eq!(eval("Len(topic.items)", &reader), json!(2));
        assert_eq!(eval("First(topic.items)", &reader), json!("a"));
        assert_eq!(eval("Last(topic.items)", &reader), json!("b"));
        assert_eq!(eval("IsBlank(topic.nothing)", &reader), json!(true));
        assert_eq!(eval("Upper('abc')", &reader), json!("ABC"));
        assert_eq!(eval("ParseNumber('42')", &reader), json!(42));
        assert_eq!(eval("ParseBool('true')", &reader), json!(true));
        assert_eq!(eval("Concat('a', 1, 'b')", &reader), json!("a1b"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("topic.").is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("frob(1)").is_ok()); // parses; evaluation rejects
        assert!(parse("nonsense").is_err());
        assert!(parse("'open").is_err());
    }

    #[test]
    fn test_unknown_function_fails_at_eval() {
        let reader = MapReader::new();
        let expr = parse("Frobnicate(1)").unwrap();
        assert!(evaluate(&expr, &reader).is_err());
    }

    #[test]
    fn test_compiled_value_sigil() {
        let literal = CompiledValue::compile(&json!("plain text")).unwrap();
        assert!(matches!(literal, CompiledValue::Literal(_)));

        let expr = CompiledValue::compile(&json!("=1 + 1")).unwrap();
        let reader = MapReader::new();
        assert_eq!(expr.evaluate(&reader).unwrap(), json!(2));
    }

    #[test]
    fn test_division_by_zero() {
        let reader = MapReader::new();
        assert!(evaluate(&parse("1 / 0").unwrap(), &reader).is_err());
    }
}
