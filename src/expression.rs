//! Tokenizer, parser and evaluator for the restricted code grammar of
//! teardown assertions and `skip_if` conditions:
//!
//! ```text
//! assertion  := "assert" comparison [ "," string ]
//! comparison := operand op operand
//! operand    := literal | accessor | predicate
//! accessor   := "pm" "." "response" ( "." "get" "(" literal ")" )+
//! op         := "==" | "!=" | ">" | "<" | ">=" | "<=" | "in" | "not" "in"
//! ```
//!
//! Nothing here ever hands text to an interpreter.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::error::{ApiTestError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(serde_json::Number),
    Op(&'static str),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{name}"),
            Token::Str(text) => write!(f, "'{text}'"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Op(op) => write!(f, "{op}"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    NotIn,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
        };
        write!(f, "{text}")
    }
}

/// Type checks usable as `== IsInt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypePredicate {
    IsInt,
    IsFloat,
    IsNumber,
    IsStr,
    IsBool,
    IsList,
    IsDict,
    IsNone,
}

impl TypePredicate {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "IsInt" => Some(TypePredicate::IsInt),
            "IsFloat" => Some(TypePredicate::IsFloat),
            "IsNumber" => Some(TypePredicate::IsNumber),
            "IsStr" => Some(TypePredicate::IsStr),
            "IsBool" => Some(TypePredicate::IsBool),
            "IsList" => Some(TypePredicate::IsList),
            "IsDict" => Some(TypePredicate::IsDict),
            "IsNone" => Some(TypePredicate::IsNone),
            _ => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            TypePredicate::IsInt => value.is_i64() || value.is_u64(),
            TypePredicate::IsFloat => value.is_f64(),
            TypePredicate::IsNumber => value.is_number(),
            TypePredicate::IsStr => value.is_string(),
            TypePredicate::IsBool => value.is_boolean(),
            TypePredicate::IsList => value.is_array(),
            TypePredicate::IsDict => value.is_object(),
            TypePredicate::IsNone => value.is_null(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    // keys of the chained .get(...) calls
    Accessor(Vec<Value>),
    Predicate(TypePredicate),
}

impl Operand {
    fn is_accessor(&self) -> bool {
        matches!(self, Operand::Accessor(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub left: Operand,
    pub op: CompareOp,
    pub right: Operand,
}

/// A parsed `assert ...` line
#[derive(Debug, Clone, PartialEq)]
pub struct CodeAssertion {
    pub source: String,
    pub comparison: Comparison,
    pub message: Option<String>,
}

/// A parsed `skip_if` condition: a bare literal or a comparison between literals
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(Value),
    Compare(Comparison),
}

fn syntax_error(source: &str, reason: impl fmt::Display) -> ApiTestError {
    ApiTestError::AssertSyntax(format!(
        "'{source}': {reason}; expected `assert <expected> <op> pm.response.get(...)[, <message>]`"
    ))
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let op = match (ch, next) {
                    ('=', Some('=')) => "==",
                    ('!', Some('=')) => "!=",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    _ => return Err(syntax_error(source, format!("unsupported operator at '{ch}'"))),
                };
                tokens.push(Token::Op(op));
                i += op.len();
            }
            '\'' | '"' => {
                let quote = ch;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax_error(source, "unterminated string literal")),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(c) if *c == quote => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            text.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = if raw.contains('.') {
                    raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64)
                } else {
                    raw.parse::<i64>().ok().map(serde_json::Number::from)
                };
                let number = number.ok_or_else(|| syntax_error(source, format!("invalid number '{raw}'")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(syntax_error(source, format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self> {
        Ok(Parser {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax_error(self.source, format!("expected '{expected}', found '{token}'"))),
            None => Err(syntax_error(self.source, format!("expected '{expected}', found end of input"))),
        }
    }

    fn expect_ident(&mut self, name: &str) -> Result<()> {
        self.expect(Token::Ident(name.to_string()))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(syntax_error(self.source, format!("unexpected trailing '{token}'"))),
        }
    }

    fn parse_comparison(&mut self) -> Result<Comparison> {
        let left = self.parse_operand()?;
        let op = self.parse_op()?;
        let right = self.parse_operand()?;
        Ok(Comparison { left, op, right })
    }

    fn parse_op(&mut self) -> Result<CompareOp> {
        match self.next() {
            Some(Token::Op("==")) => Ok(CompareOp::Eq),
            Some(Token::Op("!=")) => Ok(CompareOp::Ne),
            Some(Token::Op(">")) => Ok(CompareOp::Gt),
            Some(Token::Op("<")) => Ok(CompareOp::Lt),
            Some(Token::Op(">=")) => Ok(CompareOp::Ge),
            Some(Token::Op("<=")) => Ok(CompareOp::Le),
            Some(Token::Ident(name)) if name == "in" => Ok(CompareOp::In),
            Some(Token::Ident(name)) if name == "not" => {
                self.expect_ident("in")?;
                Ok(CompareOp::NotIn)
            }
            Some(token) => Err(syntax_error(self.source, format!("unsupported operator '{token}'"))),
            None => Err(syntax_error(self.source, "missing operator")),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.peek() {
            Some(Token::Ident(name)) if name == "pm" => self.parse_accessor(),
            Some(Token::Ident(name)) => {
                if let Some(predicate) = TypePredicate::from_name(name) {
                    self.pos += 1;
                    Ok(Operand::Predicate(predicate))
                } else {
                    Ok(Operand::Literal(self.parse_literal()?))
                }
            }
            _ => Ok(Operand::Literal(self.parse_literal()?)),
        }
    }

    fn parse_accessor(&mut self) -> Result<Operand> {
        self.expect_ident("pm")?;
        self.expect(Token::Dot)?;
        self.expect_ident("response")?;

        let mut keys = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            self.expect_ident("get")?;
            self.expect(Token::LParen)?;
            keys.push(self.parse_literal()?);
            self.expect(Token::RParen)?;
        }

        if keys.is_empty() {
            return Err(syntax_error(self.source, "accessor must call pm.response.get(...)"));
        }
        Ok(Operand::Accessor(keys))
    }

    fn parse_literal(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Str(text)) => Ok(Value::String(text)),
            Some(Token::Number(number)) => Ok(Value::Number(number)),
            Some(Token::Ident(name)) => match name.as_str() {
                "True" | "true" => Ok(Value::Bool(true)),
                "False" | "false" => Ok(Value::Bool(false)),
                "None" | "null" => Ok(Value::Null),
                other => Err(syntax_error(self.source, format!("unsupported name '{other}'"))),
            },
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                loop {
                    items.push(self.parse_literal()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        _ => return Err(syntax_error(self.source, "unterminated list literal")),
                    }
                }
                Ok(Value::Array(items))
            }
            Some(token) => Err(syntax_error(self.source, format!("expected a literal, found '{token}'"))),
            None => Err(syntax_error(self.source, "expected a literal, found end of input")),
        }
    }
}

/// Parse and validate a code assertion. Grammar errors are `AssertSyntaxError`.
pub fn parse_assertion(source: &str) -> Result<CodeAssertion> {
    let mut parser = Parser::new(source)?;
    parser.expect_ident("assert")?;
    let comparison = parser.parse_comparison()?;

    let message = if parser.peek() == Some(&Token::Comma) {
        parser.pos += 1;
        match parser.next() {
            Some(Token::Str(message)) => Some(message),
            _ => return Err(syntax_error(source, "the assertion message must be a string literal")),
        }
    } else {
        None
    };
    parser.expect_end()?;

    if comparison.left.is_accessor() == comparison.right.is_accessor() {
        return Err(syntax_error(source, "exactly one side must be a pm.response.get(...) accessor"));
    }
    validate_predicates(source, &comparison)?;

    Ok(CodeAssertion {
        source: source.to_string(),
        comparison,
        message,
    })
}

/// Parse a `skip_if` condition. Response accessors are not available before the request is sent.
pub fn parse_condition(source: &str) -> Result<Condition> {
    let mut parser = Parser::new(source)?;
    if parser.at_end() {
        return Err(syntax_error(source, "empty condition"));
    }

    let left = parser.parse_operand()?;
    if parser.at_end() {
        return match left {
            Operand::Literal(value) => Ok(Condition::Literal(value)),
            _ => Err(syntax_error(source, "a condition needs a literal or a comparison")),
        };
    }

    let op = parser.parse_op()?;
    let right = parser.parse_operand()?;
    parser.expect_end()?;

    let comparison = Comparison { left, op, right };
    if comparison.left.is_accessor() || comparison.right.is_accessor() {
        return Err(syntax_error(source, "pm.response is not available in skip_if conditions"));
    }
    validate_predicates(source, &comparison)?;
    Ok(Condition::Compare(comparison))
}

fn validate_predicates(source: &str, comparison: &Comparison) -> Result<()> {
    let has_predicate = matches!(comparison.left, Operand::Predicate(_))
        || matches!(comparison.right, Operand::Predicate(_));
    if !has_predicate {
        return Ok(());
    }
    if matches!((&comparison.left, &comparison.right), (Operand::Predicate(_), Operand::Predicate(_))) {
        return Err(syntax_error(source, "type predicates cannot be compared with each other"));
    }
    if !matches!(comparison.op, CompareOp::Eq | CompareOp::Ne) {
        return Err(syntax_error(source, "type predicates only support == and !="));
    }
    Ok(())
}

enum Resolved {
    Value(Value),
    Predicate(TypePredicate),
}

fn resolve(operand: &Operand, response: Option<&Value>) -> Resolved {
    match operand {
        Operand::Literal(value) => Resolved::Value(value.clone()),
        Operand::Predicate(predicate) => Resolved::Predicate(*predicate),
        Operand::Accessor(keys) => {
            let mut current = response.cloned().unwrap_or(Value::Null);
            for key in keys {
                current = get(&current, key);
            }
            Resolved::Value(current)
        }
    }
}

/// `.get(key)` semantics: object key (exact, then case-insensitive), array index, otherwise None
fn get(value: &Value, key: &Value) -> Value {
    match (value, key) {
        (Value::Object(fields), Value::String(name)) => fields
            .get(name)
            .or_else(|| {
                fields
                    .iter()
                    .find(|(field, _)| field.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(fields), Value::Number(n)) => fields.get(&n.to_string()).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => {
            let index = n.as_i64().unwrap_or(i64::MAX);
            let index = if index < 0 { items.len() as i64 + index } else { index };
            usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

/// Equality with numbers compared by value, so 200 == 200.0
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

/// Ordering between two numbers or two strings
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// `needle in haystack`: substring, list member or mapping key
pub fn contains(haystack: &Value, needle: &Value) -> Option<bool> {
    match (haystack, needle) {
        (Value::String(text), Value::String(part)) => Some(text.contains(part.as_str())),
        (Value::Array(items), needle) => Some(items.iter().any(|item| values_equal(item, needle))),
        (Value::Object(fields), Value::String(key)) => Some(fields.contains_key(key)),
        _ => None,
    }
}

/// Evaluate a comparison. A type mismatch between operands is an `AssertError`.
pub fn evaluate(comparison: &Comparison, response: Option<&Value>, source: &str) -> Result<bool> {
    let left = resolve(&comparison.left, response);
    let right = resolve(&comparison.right, response);

    let (left, right) = match (left, right) {
        (Resolved::Predicate(predicate), Resolved::Value(value))
        | (Resolved::Value(value), Resolved::Predicate(predicate)) => {
            let matched = predicate.matches(&value);
            return Ok(if comparison.op == CompareOp::Ne { !matched } else { matched });
        }
        (Resolved::Value(left), Resolved::Value(right)) => (left, right),
        (Resolved::Predicate(_), Resolved::Predicate(_)) => {
            return Err(syntax_error(source, "type predicates cannot be compared with each other"));
        }
    };

    let mismatch = || {
        ApiTestError::Assert(format!(
            "'{source}': cannot apply '{}' to {left} and {right}",
            comparison.op
        ))
    };

    let result = match comparison.op {
        CompareOp::Eq => values_equal(&left, &right),
        CompareOp::Ne => !values_equal(&left, &right),
        CompareOp::Gt => compare_values(&left, &right).ok_or_else(mismatch)? == Ordering::Greater,
        CompareOp::Lt => compare_values(&left, &right).ok_or_else(mismatch)? == Ordering::Less,
        CompareOp::Ge => compare_values(&left, &right).ok_or_else(mismatch)? != Ordering::Less,
        CompareOp::Le => compare_values(&left, &right).ok_or_else(mismatch)? != Ordering::Greater,
        CompareOp::In => contains(&right, &left).ok_or_else(mismatch)?,
        CompareOp::NotIn => !contains(&right, &left).ok_or_else(mismatch)?,
    };

    log::debug!("'{source}': {left} {} {right} -> {result}", comparison.op);
    Ok(result)
}

/// Truthiness of a `skip_if` condition
pub fn evaluate_condition(source: &str) -> Result<bool> {
    match parse_condition(source)? {
        Condition::Literal(value) => Ok(match value {
            Value::Bool(b) => b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
        }),
        Condition::Compare(comparison) => evaluate(&comparison, None, source),
    }
}
