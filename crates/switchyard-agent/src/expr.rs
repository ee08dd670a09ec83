//! Default expression evaluator for route conditions and transforms.
//!
//! Conditions:
//! - `true`, `false`, `<path>` (truthiness), `not <expr>`
//! - `<operand> <op> <operand>` with `=`, `==`, `!=`, `>`, `>=`, `<`, `<=`
//! - `<operand> contains <operand>`, `<path> exists`
//! - clauses joined by `and` / `or`, grouped with parentheses
//!
//! Transforms are object literals whose values are operands:
//! `{ response: validation_result.reason, source: "validator" }`.
//! `$` is the whole state and `$.a.b` a path from the root.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::state::lookup_path;
use switchyard_core::traits::{is_truthy, ExpressionEvaluator};

/// Evaluates the path/comparison language described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

impl ExpressionEvaluator for PathEvaluator {
    fn evaluate(&self, expr: &str, state: &Value) -> Result<Value> {
        let ast = parse(expr)?;
        Ok(eval(&ast, state))
    }

    fn validate(&self, expr: &str) -> Result<()> {
        parse(expr).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(Value),
    Op(CmpOp),
    Word(String),
    Punct(char),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Exists(Box<Expr>),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r#"^\s*(?:"#,
            r#"(?P<dq>"(?:[^"\\]|\\.)*")"#,
            r#"|(?P<sq>'(?:[^'\\]|\\.)*')"#,
            r#"|(?P<num>-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)"#,
            r#"|(?P<op>==|!=|>=|<=|=|>|<)"#,
            r#"|(?P<punct>[{}\[\]:,()])"#,
            r#"|(?P<word>\$(?:\.[A-Za-z0-9_\-]+|\[\d+\])*|[A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+|\[\d+\])*)"#,
            r#")"#
        ))
        .expect("token regex is valid")
    })
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let re = token_regex();
    let mut tokens = Vec::new();
    let mut rest = expr;

    while !rest.trim().is_empty() {
        let caps = re
            .captures(rest)
            .ok_or_else(|| SwitchyardError::expression(expr, format!("unexpected input near `{}`", rest.trim())))?;
        let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);

        let token = if let Some(m) = caps.name("dq") {
            Token::Str(serde_json::from_str(m.as_str()).map_err(|e| {
                SwitchyardError::expression(expr, format!("bad string literal: {}", e))
            })?)
        } else if let Some(m) = caps.name("sq") {
            let inner = &m.as_str()[1..m.as_str().len() - 1];
            Token::Str(inner.replace("\\'", "'"))
        } else if let Some(m) = caps.name("num") {
            Token::Num(serde_json::from_str(m.as_str()).map_err(|e| {
                SwitchyardError::expression(expr, format!("bad number: {}", e))
            })?)
        } else if let Some(m) = caps.name("op") {
            Token::Op(match m.as_str() {
                "=" | "==" => CmpOp::Eq,
                "!=" => CmpOp::Ne,
                ">" => CmpOp::Gt,
                ">=" => CmpOp::Ge,
                "<" => CmpOp::Lt,
                _ => CmpOp::Le,
            })
        } else if let Some(m) = caps.name("punct") {
            Token::Punct(m.as_str().chars().next().unwrap_or(','))
        } else if let Some(m) = caps.name("word") {
            Token::Word(m.as_str().to_string())
        } else {
            return Err(SwitchyardError::expression(expr, "unrecognised token"));
        };

        tokens.push(token);
        rest = &rest[whole..];
    }
    Ok(tokens)
}

fn parse(expr: &str) -> Result<Expr> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(SwitchyardError::expression(expr, "empty expression"));
    }
    let mut parser = Parser {
        source: expr,
        tokens,
        pos: 0,
    };
    let ast = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing input"));
    }
    Ok(ast)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> SwitchyardError {
        SwitchyardError::expression(self.source, format!("{} at token {}", reason, self.pos))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn peek_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        match self.next() {
            Some(Token::Punct(p)) if p == c => Ok(()),
            _ => Err(self.error(&format!("expected `{}`", c))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek_word("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek_word("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek_word("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_operand()?;
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                let rhs = self.parse_operand()?;
                Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)))
            }
            Some(Token::Word(w)) if w == "contains" => {
                self.pos += 1;
                let rhs = self.parse_operand()?;
                Ok(Expr::Compare(Box::new(lhs), CmpOp::Contains, Box::new(rhs)))
            }
            Some(Token::Word(w)) if w == "exists" => {
                self.pos += 1;
                Ok(Expr::Exists(Box::new(lhs)))
            }
            _ => Ok(lhs),
        }
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(n)),
            Some(Token::Word(w)) => match w.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "contains" | "exists" => {
                    self.pos -= 1;
                    Err(self.error(&format!("unexpected keyword `{}`", w)))
                }
                _ => Ok(Expr::Path(w)),
            },
            Some(Token::Punct('(')) => {
                let inner = self.parse_or()?;
                self.expect_punct(')')?;
                Ok(inner)
            }
            Some(Token::Punct('{')) => self.parse_object(),
            Some(Token::Punct('[')) => self.parse_array(),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a value"))
            }
        }
    }

    fn parse_object(&mut self) -> Result<Expr> {
        let mut fields = Vec::new();
        if matches!(self.peek(), Some(Token::Punct('}'))) {
            self.pos += 1;
            return Ok(Expr::Object(fields));
        }
        loop {
            let key = match self.next() {
                Some(Token::Str(s)) | Some(Token::Word(s)) => s,
                _ => return Err(self.error("expected an object key")),
            };
            self.expect_punct(':')?;
            let value = self.parse_or()?;
            fields.push((key, value));
            match self.next() {
                Some(Token::Punct(',')) => continue,
                Some(Token::Punct('}')) => break,
                _ => return Err(self.error("expected `,` or `}`")),
            }
        }
        Ok(Expr::Object(fields))
    }

    fn parse_array(&mut self) -> Result<Expr> {
        let mut items = Vec::new();
        if matches!(self.peek(), Some(Token::Punct(']'))) {
            self.pos += 1;
            return Ok(Expr::Array(items));
        }
        loop {
            items.push(self.parse_or()?);
            match self.next() {
                Some(Token::Punct(',')) => continue,
                Some(Token::Punct(']')) => break,
                _ => return Err(self.error("expected `,` or `]`")),
            }
        }
        Ok(Expr::Array(items))
    }
}

fn resolve<'a>(path: &str, state: &'a Value) -> Option<&'a Value> {
    match path.strip_prefix('$') {
        Some(rest) => lookup_path(state, rest.trim_start_matches('.')),
        None => lookup_path(state, path),
    }
}

fn eval(expr: &Expr, state: &Value) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(p) => resolve(p, state).cloned().unwrap_or(Value::Null),
        Expr::Not(inner) => Value::Bool(!is_truthy(&eval(inner, state))),
        Expr::And(a, b) => Value::Bool(is_truthy(&eval(a, state)) && is_truthy(&eval(b, state))),
        Expr::Or(a, b) => Value::Bool(is_truthy(&eval(a, state)) || is_truthy(&eval(b, state))),
        Expr::Exists(inner) => Value::Bool(match inner.as_ref() {
            Expr::Path(p) => resolve(p, state).is_some(),
            other => !eval(other, state).is_null(),
        }),
        Expr::Compare(a, op, b) => Value::Bool(compare(&eval(a, state), *op, &eval(b, state))),
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), eval(v, state));
            }
            Value::Object(map)
        }
        Expr::Array(items) => Value::Array(items.iter().map(|i| eval(i, state)).collect()),
    }
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(a, b),
        CmpOp::Ne => !values_equal(a, b),
        CmpOp::Contains => match (a, b) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        CmpOp::Gt => order(a, b) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(order(a, b), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => order(a, b) == Some(Ordering::Less),
        CmpOp::Le => matches!(order(a, b), Some(Ordering::Less | Ordering::Equal)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
