//! A small, side-effect free expression language for `where` filters.
//!
//! ```text
//! {age} >= 18 && ({city} == 'Paris' || not {vip})
//! ```
//!
//! `{field}` reads a (dotted) field of the record, `{id}` the record's `id`
//! field or else its node id. `==`/`!=` compare loosely (numeric strings
//! equal numbers); `===`/`!==` compare strictly. Ordering operators compare
//! numbers numerically and strings lexically; any other pairing is false.

use crate::document::{self, Document};
use crate::error::{Result, StoreError};
use serde_json::Value;
use std::cmp::Ordering;

/// Deepest accepted nesting of parentheses and `not`.
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(String),
    Literal(Value),
    Op(Op),
    And,
    Or,
    Not,
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Field(String),
    Literal(Value),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(Op, Box<Expr>, Box<Expr>),
}

/// A parsed `where` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    expr: Expr,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0, depth: 0 };
        let expr = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(StoreError::Query(format!(
                "unexpected {:?} in '{source}'",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Predicate { expr })
    }

    /// True only when the expression evaluates to boolean `true`.
    pub fn matches(&self, record: &Document, id: &str) -> bool {
        let fields = Value::Object(document::fields(record));
        eval(&self.expr, &fields, id) == Value::Bool(true)
    }
}

fn eval(expr: &Expr, fields: &Value, id: &str) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Field(path) => match document::lookup(fields, path) {
            Some(value) => value.clone(),
            None if path == "id" => Value::String(id.to_string()),
            None => Value::Null,
        },
        Expr::Not(inner) => Value::Bool(!document::truthy(&eval(inner, fields, id))),
        Expr::And(terms) => Value::Bool(terms.iter().all(|term| document::truthy(&eval(term, fields, id)))),
        Expr::Or(terms) => Value::Bool(terms.iter().any(|term| document::truthy(&eval(term, fields, id)))),
        Expr::Compare(op, left, right) => {
            let (left, right) = (eval(left, fields, id), eval(right, fields, id));
            let ordering = || document::loose_cmp(&left, &right);
            Value::Bool(match op {
                Op::Eq => document::loose_eq(&left, &right),
                Op::Ne => !document::loose_eq(&left, &right),
                Op::StrictEq => left == right,
                Op::StrictNe => left != right,
                Op::Lt => ordering() == Some(Ordering::Less),
                Op::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
                Op::Gt => ordering() == Some(Ordering::Greater),
                Op::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
            })
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let error = |msg: String| StoreError::Query(format!("{msg} in '{source}'"));

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '{' => {
                let end = chars[i..]
                    .iter()
                    .position(|&c| c == '}')
                    .ok_or_else(|| error("unterminated field reference".into()))?;
                let name: String = chars[i + 1..i + end].iter().collect();
                let name = name.trim();
                if name.is_empty() {
                    return Err(error("empty field reference".into()));
                }
                tokens.push(Token::Field(name.to_string()));
                i += end + 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(error("unterminated string".into())),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                Some(&other) => text.push(other),
                                None => return Err(error("unterminated string".into())),
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
                let (token, len) = if rest.starts_with("===") {
                    (Token::Op(Op::StrictEq), 3)
                } else if rest.starts_with("!==") {
                    (Token::Op(Op::StrictNe), 3)
                } else if rest.starts_with("==") {
                    (Token::Op(Op::Eq), 2)
                } else if rest.starts_with("!=") {
                    (Token::Op(Op::Ne), 2)
                } else if rest.starts_with("<=") {
                    (Token::Op(Op::Le), 2)
                } else if rest.starts_with(">=") {
                    (Token::Op(Op::Ge), 2)
                } else if rest.starts_with("&&") {
                    (Token::And, 2)
                } else if rest.starts_with("||") {
                    (Token::Or, 2)
                } else if c == '<' {
                    (Token::Op(Op::Lt), 1)
                } else if c == '>' {
                    (Token::Op(Op::Gt), 1)
                } else if c == '!' {
                    (Token::Not, 1)
                } else {
                    return Err(error(format!("unexpected '{c}'")));
                };
                tokens.push(token);
                i += len;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = match text.parse::<i64>() {
                    Ok(n) => Value::from(n),
                    Err(_) => text
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(|| error(format!("bad number '{text}'")))?,
                };
                tokens.push(Token::Literal(number));
            }
            c if c.is_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_lowercase().as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => return Err(error(format!("unknown word '{word}'"))),
                });
            }
            other => return Err(error(format!("unexpected '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr> {
        let mut terms = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.and()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::Or(terms) })
    }

    fn and(&mut self) -> Result<Expr> {
        let mut terms = vec![self.not()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.not()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::And(terms) })
    }

    fn not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn nested(&mut self, rule: fn(&mut Self) -> Result<Expr>) -> Result<Expr> {
        if self.depth >= MAX_NESTING {
            return Err(StoreError::Query(format!("expression nested deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let expr = rule(self);
        self.depth -= 1;
        expr
    }

    fn compare(&mut self) -> Result<Expr> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Field(name)) => Ok(Expr::Field(name)),
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Open) => {
                let inner = self.nested(Self::or)?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(StoreError::Query("missing ')'".into())),
                }
            }
            Some(token) => Err(StoreError::Query(format!("unexpected {token:?}"))),
            None => Err(StoreError::Query("unexpected end of expression".into())),
        }
    }
}
