//! # Restricted Expressions
//!
//! Evaluator for the `eval`, `search` and `active` attributes of
//! declaration documents.
//!
//! The grammar is closed: integer and string literals, `True`/`False`/`None`,
//! lists and tuples, integer arithmetic (`+ - * // %`), comparisons,
//! `and`/`or`/`not`, and names or calls that the caller's `Environment`
//! chooses to bind. Nothing else can be expressed, so declarative content
//! never reaches a general-purpose interpreter.
//!
//! Tuples and lists both evaluate to `FieldValue::List`.

use crate::primitives::MAX_EXPRESSION_DEPTH;
use crate::{FieldValue, SeedlingError};
use std::iter::Peekable;
use std::str::Chars;

// =============================================================================
// AST
// =============================================================================

/// Parsed expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(FieldValue),
    List(Vec<Expr>),
    Name(String),
    Call { name: String, args: Vec<Expr> },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// Bindings available to an expression.
///
/// Returning `Ok(None)` means the name is not bound.
pub trait Environment {
    fn lookup(&mut self, name: &str) -> Result<Option<FieldValue>, SeedlingError>;

    fn call(
        &mut self,
        name: &str,
        args: Vec<FieldValue>,
    ) -> Result<Option<FieldValue>, SeedlingError>;
}

/// Environment without any binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyEnvironment;

impl Environment for EmptyEnvironment {
    fn lookup(&mut self, _name: &str) -> Result<Option<FieldValue>, SeedlingError> {
        Ok(None)
    }

    fn call(
        &mut self,
        _name: &str,
        _args: Vec<FieldValue>,
    ) -> Result<Option<FieldValue>, SeedlingError> {
        Ok(None)
    }
}

fn invalid(message: impl Into<String>) -> SeedlingError {
    SeedlingError::InvalidExpression(message.into())
}

// =============================================================================
// TOKENIZER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Str(String),
    Name(String),
    Plus,
    Minus,
    Star,
    DoubleSlash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

fn tokenize(input: &str) -> Result<Vec<Token>, SeedlingError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                tokens.push(Token::Plus);
                chars.next();
            }
            '-' => {
                tokens.push(Token::Minus);
                chars.next();
            }
            '*' => {
                tokens.push(Token::Star);
                chars.next();
            }
            '%' => {
                tokens.push(Token::Percent);
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            '[' => {
                tokens.push(Token::LBracket);
                chars.next();
            }
            ']' => {
                tokens.push(Token::RBracket);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            '/' => {
                chars.next();
                if chars.next_if_eq(&'/').is_none() {
                    return Err(invalid("only integer division (//) is supported"));
                }
                tokens.push(Token::DoubleSlash);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(invalid("assignment is not supported"));
                }
                tokens.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(invalid("unexpected character '!'"));
                }
                tokens.push(Token::NotEq);
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::LtEq);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::GtEq);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' | '"' => {
                chars.next();
                tokens.push(Token::Str(read_string(&mut chars, c)?));
            }
            '0'..='9' => {
                let mut digits = String::new();
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    digits.push(d);
                }
                let value = digits
                    .parse()
                    .map_err(|_| invalid(format!("integer literal {} out of range", digits)))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(ch) =
                    chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '.')
                {
                    name.push(ch);
                }
                tokens.push(Token::Name(name));
            }
            other => return Err(invalid(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

fn read_string(chars: &mut Peekable<Chars<'_>>, quote: char) -> Result<String, SeedlingError> {
    let mut value = String::new();
    loop {
        match chars.next() {
            None => return Err(invalid("unterminated string literal")),
            Some(c) if c == quote => return Ok(value),
            Some('\\') => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(c @ ('\\' | '\'' | '"')) => value.push(c),
                Some(c) => {
                    value.push('\\');
                    value.push(c);
                }
                None => return Err(invalid("unterminated string literal")),
            },
            Some(c) => value.push(c),
        }
    }
}

// =============================================================================
// PARSER
// =============================================================================

/// Parse an expression.
pub fn parse(source: &str) -> Result<Expr, SeedlingError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(invalid("empty expression"));
    }
    let (expr, pos) = parse_or(&tokens, 0, 0)?;
    if pos != tokens.len() {
        return Err(invalid(format!(
            "unexpected token {:?} in \"{}\"",
            tokens[pos], source
        )));
    }
    Ok(expr)
}

fn is_keyword(tokens: &[Token], pos: usize, keyword: &str) -> bool {
    matches!(tokens.get(pos), Some(Token::Name(name)) if name == keyword)
}

fn enter(depth: usize) -> Result<usize, SeedlingError> {
    if depth >= MAX_EXPRESSION_DEPTH {
        return Err(invalid("expression nested too deeply"));
    }
    Ok(depth + 1)
}

// Lowest precedence: or
fn parse_or(tokens: &[Token], pos: usize, depth: usize) -> Result<(Expr, usize), SeedlingError> {
    let depth = enter(depth)?;
    let (mut left, mut pos) = parse_and(tokens, pos, depth)?;
    while is_keyword(tokens, pos, "or") {
        let (right, next) = parse_and(tokens, pos + 1, depth)?;
        left = Expr::Or(Box::new(left), Box::new(right));
        pos = next;
    }
    Ok((left, pos))
}

fn parse_and(tokens: &[Token], pos: usize, depth: usize) -> Result<(Expr, usize), SeedlingError> {
    let (mut left, mut pos) = parse_not(tokens, pos, depth)?;
    while is_keyword(tokens, pos, "and") {
        let (right, next) = parse_not(tokens, pos + 1, depth)?;
        left = Expr::And(Box::new(left), Box::new(right));
        pos = next;
    }
    Ok((left, pos))
}

fn parse_not(tokens: &[Token], pos: usize, depth: usize) -> Result<(Expr, usize), SeedlingError> {
    if is_keyword(tokens, pos, "not") {
        let depth = enter(depth)?;
        let (operand, next) = parse_not(tokens, pos + 1, depth)?;
        return Ok((Expr::Not(Box::new(operand)), next));
    }
    parse_comparison(tokens, pos, depth)
}

fn parse_comparison(
    tokens: &[Token],
    pos: usize,
    depth: usize,
) -> Result<(Expr, usize), SeedlingError> {
    let (left, pos) = parse_additive(tokens, pos, depth)?;
    let op = match tokens.get(pos) {
        Some(Token::EqEq) => BinOp::Eq,
        Some(Token::NotEq) => BinOp::NotEq,
        Some(Token::Lt) => BinOp::Lt,
        Some(Token::LtEq) => BinOp::LtEq,
        Some(Token::Gt) => BinOp::Gt,
        Some(Token::GtEq) => BinOp::GtEq,
        _ => return Ok((left, pos)),
    };
    let (right, pos) = parse_additive(tokens, pos + 1, depth)?;
    Ok((
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        pos,
    ))
}

fn parse_additive(
    tokens: &[Token],
    pos: usize,
    depth: usize,
) -> Result<(Expr, usize), SeedlingError> {
    let (mut left, mut pos) = parse_term(tokens, pos, depth)?;
    loop {
        let op = match tokens.get(pos) {
            Some(Token::Plus) => BinOp::Add,
            Some(Token::Minus) => BinOp::Sub,
            _ => break,
        };
        let (right, next) = parse_term(tokens, pos + 1, depth)?;
        left = Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        pos = next;
    }
    Ok((left, pos))
}

fn parse_term(tokens: &[Token], pos: usize, depth: usize) -> Result<(Expr, usize), SeedlingError> {
    let (mut left, mut pos) = parse_unary(tokens, pos, depth)?;
    loop {
        let op = match tokens.get(pos) {
            Some(Token::Star) => BinOp::Mul,
            Some(Token::DoubleSlash) => BinOp::FloorDiv,
            Some(Token::Percent) => BinOp::Mod,
            _ => break,
        };
        let (right, next) = parse_unary(tokens, pos + 1, depth)?;
        left = Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        pos = next;
    }
    Ok((left, pos))
}

fn parse_unary(tokens: &[Token], pos: usize, depth: usize) -> Result<(Expr, usize), SeedlingError> {
    match tokens.get(pos) {
        Some(Token::Minus) => {
            let depth = enter(depth)?;
            let (operand, next) = parse_unary(tokens, pos + 1, depth)?;
            Ok((Expr::Neg(Box::new(operand)), next))
        }
        Some(Token::Plus) => parse_unary(tokens, pos + 1, enter(depth)?),
        _ => parse_primary(tokens, pos, depth),
    }
}

/// Parse comma-separated expressions up to `close`.
///
/// Returns the items, whether a trailing comma was seen, and the position
/// after `close`.
fn parse_sequence(
    tokens: &[Token],
    mut pos: usize,
    depth: usize,
    close: &Token,
) -> Result<(Vec<Expr>, bool, usize), SeedlingError> {
    let mut items = Vec::new();
    let mut trailing_comma = false;
    loop {
        match tokens.get(pos) {
            Some(token) if token == close => return Ok((items, trailing_comma, pos + 1)),
            None => return Err(invalid("unexpected end of expression")),
            _ => {}
        }
        let (item, next) = parse_or(tokens, pos, depth)?;
        items.push(item);
        pos = next;
        match tokens.get(pos) {
            Some(Token::Comma) => {
                trailing_comma = true;
                pos += 1;
            }
            Some(token) if token == close => {
                trailing_comma = false;
            }
            Some(token) => return Err(invalid(format!("unexpected token {:?}", token))),
            None => return Err(invalid("unexpected end of expression")),
        }
    }
}

fn parse_primary(
    tokens: &[Token],
    pos: usize,
    depth: usize,
) -> Result<(Expr, usize), SeedlingError> {
    let Some(token) = tokens.get(pos) else {
        return Err(invalid("unexpected end of expression"));
    };

    match token {
        Token::Int(i) => Ok((Expr::Literal(FieldValue::Int(*i)), pos + 1)),
        Token::Str(s) => Ok((Expr::Literal(FieldValue::Text(s.clone())), pos + 1)),
        Token::Name(name) => match name.as_str() {
            "True" => Ok((Expr::Literal(FieldValue::Bool(true)), pos + 1)),
            "False" => Ok((Expr::Literal(FieldValue::Bool(false)), pos + 1)),
            "None" => Ok((Expr::Literal(FieldValue::None), pos + 1)),
            "and" | "or" | "not" => Err(invalid(format!("unexpected keyword {}", name))),
            _ if tokens.get(pos + 1) == Some(&Token::LParen) => {
                let depth = enter(depth)?;
                let (args, _, next) = parse_sequence(tokens, pos + 2, depth, &Token::RParen)?;
                Ok((
                    Expr::Call {
                        name: name.clone(),
                        args,
                    },
                    next,
                ))
            }
            _ => Ok((Expr::Name(name.clone()), pos + 1)),
        },
        Token::LBracket => {
            let depth = enter(depth)?;
            let (items, _, next) = parse_sequence(tokens, pos + 1, depth, &Token::RBracket)?;
            Ok((Expr::List(items), next))
        }
        Token::LParen => {
            let depth = enter(depth)?;
            let (mut items, trailing_comma, next) =
                parse_sequence(tokens, pos + 1, depth, &Token::RParen)?;
            // `(x)` is grouping, `(x,)` and `(x, y)` are tuples
            if items.len() == 1 && !trailing_comma {
                if let Some(item) = items.pop() {
                    return Ok((item, next));
                }
            }
            Ok((Expr::List(items), next))
        }
        other => Err(invalid(format!("unexpected token {:?}", other))),
    }
}

// =============================================================================
// EVALUATION
// =============================================================================

/// Parse and evaluate `source` against `env`.
pub fn evaluate(source: &str, env: &mut dyn Environment) -> Result<FieldValue, SeedlingError> {
    parse(source)?.evaluate(env)
}

impl Expr {
    /// Evaluate the expression against `env`.
    pub fn evaluate(&self, env: &mut dyn Environment) -> Result<FieldValue, SeedlingError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::List(items) => Ok(FieldValue::List(
                items
                    .iter()
                    .map(|item| item.evaluate(env))
                    .collect::<Result<_, _>>()?,
            )),
            Self::Name(name) => env
                .lookup(name)?
                .ok_or_else(|| invalid(format!("name '{}' is not defined", name))),
            Self::Call { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.evaluate(env))
                    .collect::<Result<Vec<_>, _>>()?;
                env.call(name, args)?
                    .ok_or_else(|| invalid(format!("function '{}' is not defined", name)))
            }
            Self::Neg(operand) => match operand.evaluate(env)? {
                FieldValue::Int(i) => i
                    .checked_neg()
                    .map(FieldValue::Int)
                    .ok_or_else(|| invalid("integer overflow")),
                other => Err(invalid(format!("cannot negate {}", other))),
            },
            Self::Not(operand) => Ok(FieldValue::Bool(!operand.evaluate(env)?.is_truthy())),
            Self::And(left, right) => {
                let left = left.evaluate(env)?;
                if left.is_truthy() {
                    right.evaluate(env)
                } else {
                    Ok(left)
                }
            }
            Self::Or(left, right) => {
                let left = left.evaluate(env)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    right.evaluate(env)
                }
            }
            Self::Binary { op, left, right } => {
                let left = left.evaluate(env)?;
                let right = right.evaluate(env)?;
                apply(*op, left, right)
            }
        }
    }
}

fn apply(op: BinOp, left: FieldValue, right: FieldValue) -> Result<FieldValue, SeedlingError> {
    let overflow = || invalid("integer overflow");
    match (op, left, right) {
        (BinOp::Eq, l, r) => Ok(FieldValue::Bool(loosely_equal(&l, &r))),
        (BinOp::NotEq, l, r) => Ok(FieldValue::Bool(!loosely_equal(&l, &r))),
        (BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq, l, r) => {
            let ordering = match (&l, &r) {
                (FieldValue::Int(a), FieldValue::Int(b)) => a.cmp(b),
                (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
                _ => return Err(invalid(format!("cannot compare {} and {}", l, r))),
            };
            Ok(FieldValue::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::LtEq => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        (BinOp::Add, FieldValue::Text(a), FieldValue::Text(b)) => Ok(FieldValue::Text(a + &b)),
        (BinOp::Add, FieldValue::List(mut a), FieldValue::List(b)) => {
            a.extend(b);
            Ok(FieldValue::List(a))
        }
        (_, FieldValue::Int(a), FieldValue::Int(b)) => {
            let result = match op {
                BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
                BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
                BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
                BinOp::FloorDiv | BinOp::Mod if b == 0 => {
                    return Err(invalid("integer division by zero"));
                }
                BinOp::FloorDiv => {
                    let quotient = a.checked_div(b).ok_or_else(overflow)?;
                    if a % b != 0 && ((a < 0) != (b < 0)) {
                        quotient - 1
                    } else {
                        quotient
                    }
                }
                BinOp::Mod => {
                    let remainder = a.checked_rem(b).ok_or_else(overflow)?;
                    if remainder != 0 && ((remainder < 0) != (b < 0)) {
                        remainder + b
                    } else {
                        remainder
                    }
                }
                _ => return Err(invalid("unsupported operator")),
            };
            Ok(FieldValue::Int(result))
        }
        (op, l, r) => Err(invalid(format!(
            "unsupported operand types for {:?}: {} and {}",
            op, l, r
        ))),
    }
}

/// Equality where identities compare equal to their integer value.
fn loosely_equal(left: &FieldValue, right: &FieldValue) -> bool {
    match (left.as_int(), right.as_int()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

// =============================================================================
// TESTS
// =============================================================================
