// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tokenizer and recursive-descent parser for predicate expressions.
//!
//! Precedence, loosest first:
//!
//! | Level | Operators |
//! |-------|-----------|
//! | conditional | `c ? a : b` |
//! | or | `\|\|` |
//! | and | `&&` |
//! | relation | `==` `!=` `<` `<=` `>` `>=` `in` |
//! | additive | `+` `-` |
//! | multiplicative | `*` `/` `%` |
//! | unary | `!` `-` |
//! | postfix | `.field` `[index]` `.method(args)` |

use serde_json::{Number, Value};

use super::ExpressionError;

/// Maximum nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 64;

/// Root variables an expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The event that started the run (or owns the pause).
    Event,
    /// The event being evaluated against a pause.
    Async,
    /// Step outputs keyed by step hash.
    Steps,
    /// Run context.
    Ctx,
}

impl Scope {
    fn from_ident(name: &str) -> Option<Self> {
        match name {
            "event" => Some(Self::Event),
            "async" => Some(Self::Async),
            "steps" => Some(Self::Steps),
            "ctx" => Some(Self::Ctx),
            _ => None,
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Built-in functions and methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `size(x)` or `x.size()`
    Size,
    /// `has(a.b)`
    Has,
    /// `s.startsWith(p)`
    StartsWith,
    /// `s.endsWith(p)`
    EndsWith,
    /// `s.contains(p)`
    Contains,
}

impl Builtin {
    fn function(name: &str) -> Option<Self> {
        match name {
            "size" => Some(Self::Size),
            "has" => Some(Self::Has),
            _ => None,
        }
    }

    fn method(name: &str) -> Option<Self> {
        match name {
            "size" => Some(Self::Size),
            "startsWith" => Some(Self::StartsWith),
            "endsWith" => Some(Self::EndsWith),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Root(Scope),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Receiver (for methods) is the first argument.
    Call(Builtin, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Question,
    Colon,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, ExpressionError> {
        let mut tokens = Vec::new();
        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            let token = match c {
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                '[' => self.single(Token::LBracket),
                ']' => self.single(Token::RBracket),
                '.' => self.single(Token::Dot),
                ',' => self.single(Token::Comma),
                '?' => self.single(Token::Question),
                ':' => self.single(Token::Colon),
                '+' => self.single(Token::Plus),
                '-' => self.single(Token::Minus),
                '*' => self.single(Token::Star),
                '/' => self.single(Token::Slash),
                '%' => self.single(Token::Percent),
                '!' => self.pair('=', Token::NotEq, Token::Bang),
                '<' => self.pair('=', Token::Le, Token::Lt),
                '>' => self.pair('=', Token::Ge, Token::Gt),
                '=' => {
                    self.chars.next();
                    self.expect_char('=', pos)?;
                    Token::EqEq
                }
                '&' => {
                    self.chars.next();
                    self.expect_char('&', pos)?;
                    Token::AndAnd
                }
                '|' => {
                    self.chars.next();
                    self.expect_char('|', pos)?;
                    Token::OrOr
                }
                '"' | '\'' => self.string(pos)?,
                c if c.is_ascii_digit() => self.number(pos)?,
                c if c.is_alphabetic() || c == '_' => self.ident(),
                other => {
                    return Err(ExpressionError::syntax(
                        self.src,
                        pos,
                        format!("unexpected character '{}'", other),
                    ));
                }
            };
            tokens.push((pos, token));
        }
        Ok(tokens)
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn pair(&mut self, next: char, double: Token, single: Token) -> Token {
        self.chars.next();
        if matches!(self.chars.peek(), Some(&(_, c)) if c == next) {
            self.chars.next();
            double
        } else {
            single
        }
    }

    fn expect_char(&mut self, expected: char, pos: usize) -> Result<(), ExpressionError> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            _ => Err(ExpressionError::syntax(
                self.src,
                pos,
                format!("expected '{}{}'", expected, expected),
            )),
        }
    }

    fn string(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let Some((_, quote)) = self.chars.next() else {
            return Err(ExpressionError::syntax(self.src, start, "unterminated string"));
        };
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => {
                    return Err(ExpressionError::syntax(self.src, start, "unterminated string"));
                }
                Some((_, c)) if c == quote => return Ok(Token::Str(out)),
                Some((pos, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, '"')) => out.push('"'),
                    Some((_, '\'')) => out.push('\''),
                    Some((_, 'u')) => {
                        let hex: String = (0..4).filter_map(|_| self.chars.next()).map(|(_, c)| c).collect();
                        let ch = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| {
                                ExpressionError::syntax(self.src, pos, "invalid unicode escape")
                            })?;
                        out.push(ch);
                    }
                    _ => return Err(ExpressionError::syntax(self.src, pos, "invalid escape")),
                },
                Some((_, c)) => out.push(c),
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let mut end = start;
        let mut is_float = false;
        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                end = pos + 1;
                self.chars.next();
            } else if c == '.' && !is_float {
                // Only a fraction if a digit follows, so `1.size()` style stays a member access.
                let rest = &self.src[pos + 1..];
                if !rest.starts_with(|d: char| d.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                end = pos + 1;
                self.chars.next();
            } else if (c == 'e' || c == 'E') && end > start {
                is_float = true;
                end = pos + 1;
                self.chars.next();
                if let Some(&(sign_pos, sign)) = self.chars.peek()
                    && (sign == '+' || sign == '-')
                {
                    end = sign_pos + 1;
                    self.chars.next();
                }
            } else {
                break;
            }
        }
        let text = &self.src[start..end];
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| ExpressionError::syntax(self.src, start, "invalid number"))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| ExpressionError::syntax(self.src, start, "invalid number"))
        }
    }

    fn ident(&mut self) -> Token {
        let mut out = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                out.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        Token::Ident(out)
    }
}

/// Parse `src` into an expression tree.
pub fn parse(src: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(src).tokenize()?;
    if tokens.is_empty() {
        return Err(ExpressionError::syntax(src, 0, "empty expression"));
    }
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.conditional()?;
    if let Some((pos, token)) = parser.tokens.get(parser.pos) {
        return Err(ExpressionError::syntax(
            src,
            *pos,
            format!("unexpected token {:?}", token),
        ));
    }
    Ok(expr)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or(self.src.len())
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ExpressionError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::syntax(self.src, self.offset(), message)
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn conditional(&mut self) -> Result<Expr, ExpressionError> {
        self.descend()?;
        let cond = self.or()?;
        let expr = if self.eat(&Token::Question) {
            let then = self.conditional()?;
            self.expect(Token::Colon, "':'")?;
            let otherwise = self.conditional()?;
            Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.relation()?;
        while self.eat(&Token::AndAnd) {
            let right = self.relation()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn relation(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::Ident(kw)) if kw == "in" => BinaryOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.peek() {
                    Some(Token::Ident(name)) => name.clone(),
                    _ => return Err(self.error("expected field name after '.'")),
                };
                self.pos += 1;
                if self.eat(&Token::LParen) {
                    let method = Builtin::method(&name)
                        .ok_or_else(|| self.error(format!("unknown method '{}'", name)))?;
                    let mut args = vec![expr];
                    args.extend(self.arguments()?);
                    expr = Expr::Call(method, args);
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.conditional()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    /// Arguments after an opening parenthesis, through the closing one.
    fn arguments(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.conditional()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma, "',' or ')'")?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of expression"));
        };
        self.pos += 1;
        match token {
            Token::Int(i) => Ok(Expr::Literal(Value::Number(i.into()))),
            Token::Float(f) => Number::from_f64(f)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| self.error("invalid number")),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.conditional()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.conditional()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma, "',' or ']'")?;
                    }
                }
                Ok(Expr::List(items))
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let builtin = Builtin::function(&name)
                        .ok_or_else(|| self.error(format!("unknown function '{}'", name)))?;
                    let args = self.arguments()?;
                    if args.len() != 1 {
                        return Err(self.error(format!("{}() takes exactly one argument", name)));
                    }
                    if builtin == Builtin::Has && !matches!(args[0], Expr::Member(..)) {
                        return Err(self.error("has() requires a field selection"));
                    }
                    Ok(Expr::Call(builtin, args))
                }
                _ => Scope::from_ident(&name)
                    .map(Expr::Root)
                    .ok_or_else(|| self.error(format!("unknown identifier '{}'", name))),
            },
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected token {:?}", other)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(base: Expr, name: &str) -> Expr {
        Expr::Member(Box::new(base), name.to_string())
    }

    #[test]
    fn test_parse_member_equality() {
        let expr = parse("async.data.id == event.data.id").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Eq,
                Box::new(member(member(Expr::Root(Scope::Async), "data"), "id")),
                Box::new(member(member(Expr::Root(Scope::Event), "data"), "id")),
            )
        );
    }

    #[test]
    fn test_precedence() {
        // && binds tighter than ||
        let expr = parse("true || false && false").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::Or, _, _)));

        // * binds tighter than +
        let expr = parse("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary(BinaryOp::Add, left, right) => {
                assert_eq!(*left, Expr::Literal(Value::from(1)));
                assert!(matches!(*right, Expr::Binary(BinaryOp::Mul, _, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_literals_and_lists() {
        assert_eq!(parse("'a\\'b'").unwrap(), Expr::Literal(Value::from("a'b")));
        assert_eq!(parse("\"\\u0041\"").unwrap(), Expr::Literal(Value::from("A")));
        assert_eq!(parse("1.5").unwrap(), Expr::Literal(Value::from(1.5)));
        assert_eq!(parse("null").unwrap(), Expr::Literal(Value::Null));
        assert!(matches!(parse("[1, 'two', null]").unwrap(), Expr::List(items) if items.len() == 3));
        assert!(matches!(parse("[]").unwrap(), Expr::List(items) if items.is_empty()));
    }

    #[test]
    fn test_index_methods_and_functions() {
        assert!(matches!(
            parse("event.data['my-key'][0]").unwrap(),
            Expr::Index(..)
        ));
        assert!(matches!(
            parse("event.name.startsWith('app/')").unwrap(),
            Expr::Call(Builtin::StartsWith, args) if args.len() == 2
        ));
        assert!(matches!(
            parse("size(event.data.items) > 2").unwrap(),
            Expr::Binary(BinaryOp::Gt, _, _)
        ));
        assert!(matches!(
            parse("has(event.data.id)").unwrap(),
            Expr::Call(Builtin::Has, _)
        ));
        assert!(matches!(
            parse("event.data.tier in ['gold', 'silver']").unwrap(),
            Expr::Binary(BinaryOp::In, _, _)
        ));
    }

    #[test]
    fn test_conditional() {
        assert!(matches!(
            parse("event.data.vip ? 1 : 2").unwrap(),
            Expr::Conditional(..)
        ));
    }

    #[test]
    fn test_rejections() {
        for bad in [
            "",
            "   ",
            "event.data.id =",
            "event.data.id = 1",
            "a == 1",
            "event.data.id == 'x",
            "event.data.(id)",
            "launch(event)",
            "event.data.id.explode()",
            "has(event)",
            "size(event, event)",
            "(event.data",
            "event & event",
            "event.data.id == 1 2",
            "#",
        ] {
            assert!(parse(bad).is_err(), "expected `{}` to be rejected", bad);
        }
    }

    #[test]
    fn test_error_reports_position() {
        let err = parse("event.data.id == @").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("position 17"), "{}", msg);
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}true{}", "(".repeat(100), ")".repeat(100));
        assert!(parse(&deep).is_err());
        let bangs = format!("{}true", "!".repeat(100));
        assert!(parse(&bangs).is_err());

        let fine = format!("{}true{}", "(".repeat(10), ")".repeat(10));
        assert!(parse(&fine).is_ok());
    }
}
