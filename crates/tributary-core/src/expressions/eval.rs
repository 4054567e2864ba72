// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tree-walking evaluator.
//!
//! Evaluation visits every node at most once, so cost is linear in the size
//! of the expression (plus the size of values compared with `==` or `in`).

use serde_json::{Number, Value};

use super::parser::{BinaryOp, Builtin, Expr, Scope, UnaryOp};

/// Why an evaluation produced no value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// A field or index does not exist.
    #[error("no such key: {0}")]
    Missing(String),
    /// Operand types do not fit the operator.
    #[error("type mismatch: {0}")]
    Type(String),
    /// Division or remainder by zero, or integer overflow.
    #[error("arithmetic error: {0}")]
    Arithmetic(&'static str),
}

/// Variables visible to an expression.
#[derive(Debug, Clone, Copy, Default)]
pub struct Env<'a> {
    pub event: Option<&'a Value>,
    pub async_event: Option<&'a Value>,
    pub steps: Option<&'a Value>,
    pub ctx: Option<&'a Value>,
}

impl<'a> Env<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(mut self, value: &'a Value) -> Self {
        self.event = Some(value);
        self
    }

    pub fn async_event(mut self, value: &'a Value) -> Self {
        self.async_event = Some(value);
        self
    }

    pub fn steps(mut self, value: &'a Value) -> Self {
        self.steps = Some(value);
        self
    }

    pub fn ctx(mut self, value: &'a Value) -> Self {
        self.ctx = Some(value);
        self
    }

    fn root(&self, scope: Scope) -> Option<&'a Value> {
        match scope {
            Scope::Event => self.event,
            Scope::Async => self.async_event,
            Scope::Steps => self.steps,
            Scope::Ctx => self.ctx,
        }
    }
}

/// Evaluate `expr` to a value.
pub fn evaluate(expr: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    match resolve(expr, env)? {
        Some(value) => Ok(value),
        None => Err(EvalError::Missing(describe(expr))),
    }
}

/// Evaluate allowing a missing result, reported as `Ok(None)`.
fn resolve(expr: &Expr, env: &Env<'_>) -> Result<Option<Value>, EvalError> {
    match expr {
        Expr::Root(scope) => Ok(env.root(*scope).cloned()),
        Expr::Member(base, field) => {
            let Some(base) = resolve(base, env)? else {
                return Ok(None);
            };
            Ok(match base {
                Value::Object(mut map) => map.remove(field),
                _ => None,
            })
        }
        Expr::Index(base, index) => {
            let Some(base) = resolve(base, env)? else {
                return Ok(None);
            };
            let index = evaluate(index, env)?;
            index_value(base, &index)
        }
        _ => compute(expr, env).map(Some),
    }
}

fn index_value(base: Value, index: &Value) -> Result<Option<Value>, EvalError> {
    match (base, index) {
        (Value::Object(mut map), Value::String(key)) => Ok(map.remove(key)),
        (Value::Array(mut items), Value::Number(n)) => {
            let Some(i) = n.as_i64() else {
                return Err(EvalError::Type("list index must be an integer".into()));
            };
            if i < 0 || i as usize >= items.len() {
                return Ok(None);
            }
            Ok(Some(items.swap_remove(i as usize)))
        }
        (base, index) => Err(EvalError::Type(format!(
            "cannot index {} with {}",
            type_name(&base),
            type_name(index)
        ))),
    }
}

fn compute(expr: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Root(_) | Expr::Member(..) | Expr::Index(..) => evaluate(expr, env),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Unary(op, operand) => {
            let value = evaluate(operand, env)?;
            match (op, value) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Number(n)) => negate(&n),
                (op, value) => Err(EvalError::Type(format!(
                    "cannot apply {:?} to {}",
                    op,
                    type_name(&value)
                ))),
            }
        }
        Expr::Conditional(cond, then, otherwise) => match evaluate(cond, env)? {
            Value::Bool(true) => evaluate(then, env),
            Value::Bool(false) => evaluate(otherwise, env),
            other => Err(EvalError::Type(format!(
                "condition must be bool, got {}",
                type_name(&other)
            ))),
        },
        Expr::Binary(BinaryOp::And, left, right) => logical(left, right, env, false),
        Expr::Binary(BinaryOp::Or, left, right) => logical(left, right, env, true),
        Expr::Binary(op @ (BinaryOp::Eq | BinaryOp::Ne), left, right) => {
            let equal = equality(left, right, env)?;
            Ok(Value::Bool(if *op == BinaryOp::Eq { equal } else { !equal }))
        }
        Expr::Binary(op, left, right) => {
            let left = evaluate(left, env)?;
            let right = evaluate(right, env)?;
            binary(*op, left, right)
        }
        Expr::Call(builtin, args) => call(*builtin, args, env),
    }
}

/// Commutative `&&` / `||`: a decisive operand wins even if the other errs.
fn logical(left: &Expr, right: &Expr, env: &Env<'_>, decisive: bool) -> Result<Value, EvalError> {
    let as_bool = |r: Result<Value, EvalError>| -> Result<bool, EvalError> {
        match r? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::Type(format!(
                "logical operand must be bool, got {}",
                type_name(&other)
            ))),
        }
    };
    let l = as_bool(evaluate(left, env));
    if matches!(l, Ok(b) if b == decisive) {
        return Ok(Value::Bool(decisive));
    }
    let r = as_bool(evaluate(right, env));
    if matches!(r, Ok(b) if b == decisive) {
        return Ok(Value::Bool(decisive));
    }
    l?;
    r?;
    Ok(Value::Bool(!decisive))
}

/// Equality where a missing path equals `null` and nothing else.
fn equality(left: &Expr, right: &Expr, env: &Env<'_>) -> Result<bool, EvalError> {
    let l = resolve(left, env)?;
    let r = resolve(right, env)?;
    match (l, r) {
        (Some(l), Some(r)) => Ok(values_equal(&l, &r)),
        (None, None) => Err(EvalError::Missing(describe(left))),
        (None, Some(Value::Null)) | (Some(Value::Null), None) => Ok(true),
        (None, Some(_)) => Err(EvalError::Missing(describe(left))),
        (Some(_), None) => Err(EvalError::Missing(describe(right))),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(&left, &right)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinaryOp::In => match right {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(i, &left)))),
            Value::Object(map) => match left {
                Value::String(key) => Ok(Value::Bool(map.contains_key(&key))),
                other => Err(EvalError::Type(format!(
                    "map keys are strings, got {}",
                    type_name(&other)
                ))),
            },
            Value::String(haystack) => match left {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(&needle))),
                other => Err(EvalError::Type(format!(
                    "cannot search string for {}",
                    type_name(&other)
                ))),
            },
            other => Err(EvalError::Type(format!(
                "'in' needs a list, map or string, got {}",
                type_name(&other)
            ))),
        },
        BinaryOp::Add => match (left, right) {
            (Value::String(mut a), Value::String(b)) => {
                a.push_str(&b);
                Ok(Value::String(a))
            }
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (Value::Number(a), Value::Number(b)) => arithmetic(op, &a, &b),
            (a, b) => Err(mismatch("+", &a, &b)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => match (left, right) {
            (Value::Number(a), Value::Number(b)) => arithmetic(op, &a, &b),
            (a, b) => Err(mismatch("arithmetic", &a, &b)),
        },
        BinaryOp::And | BinaryOp::Or | BinaryOp::Eq | BinaryOp::Ne => {
            unreachable!("handled before operand evaluation")
        }
    }
}

fn arithmetic(op: BinaryOp, a: &Number, b: &Number) -> Result<Value, EvalError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div if y == 0 => return Err(EvalError::Arithmetic("division by zero")),
            BinaryOp::Div => x.checked_div(y),
            BinaryOp::Rem if y == 0 => return Err(EvalError::Arithmetic("modulus by zero")),
            BinaryOp::Rem => x.checked_rem(y),
            _ => None,
        };
        return result
            .map(|n| Value::Number(n.into()))
            .ok_or(EvalError::Arithmetic("integer overflow"));
    }
    let (x, y) = (to_f64(a)?, to_f64(b)?);
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div if y == 0.0 => return Err(EvalError::Arithmetic("division by zero")),
        BinaryOp::Div => x / y,
        BinaryOp::Rem if y == 0.0 => return Err(EvalError::Arithmetic("modulus by zero")),
        BinaryOp::Rem => x % y,
        _ => return Err(EvalError::Type("not an arithmetic operator".into())),
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or(EvalError::Arithmetic("non-finite result"))
}

fn negate(n: &Number) -> Result<Value, EvalError> {
    if let Some(i) = n.as_i64() {
        return i
            .checked_neg()
            .map(|v| Value::Number(v.into()))
            .ok_or(EvalError::Arithmetic("integer overflow"));
    }
    Number::from_f64(-to_f64(n)?)
        .map(Value::Number)
        .ok_or(EvalError::Arithmetic("non-finite result"))
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => to_f64(a)?
            .partial_cmp(&to_f64(b)?)
            .ok_or(EvalError::Arithmetic("incomparable numbers")),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        (a, b) => Err(mismatch("comparison", a, b)),
    }
}

fn call(builtin: Builtin, args: &[Expr], env: &Env<'_>) -> Result<Value, EvalError> {
    match builtin {
        Builtin::Has => {
            let [target] = args else {
                return Err(EvalError::Type("has() takes one argument".into()));
            };
            Ok(Value::Bool(resolve(target, env)?.is_some()))
        }
        Builtin::Size => {
            let [target] = args else {
                return Err(EvalError::Type("size() takes one argument".into()));
            };
            let len = match evaluate(target, env)? {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(m) => m.len(),
                other => {
                    return Err(EvalError::Type(format!(
                        "size() of {}",
                        type_name(&other)
                    )));
                }
            };
            Ok(Value::Number((len as u64).into()))
        }
        Builtin::StartsWith | Builtin::EndsWith | Builtin::Contains => {
            let [receiver, arg] = args else {
                return Err(EvalError::Type("string methods take one argument".into()));
            };
            match (evaluate(receiver, env)?, evaluate(arg, env)?) {
                (Value::String(s), Value::String(p)) => Ok(Value::Bool(match builtin {
                    Builtin::StartsWith => s.starts_with(&p),
                    Builtin::EndsWith => s.ends_with(&p),
                    _ => s.contains(&p),
                })),
                (a, b) => Err(mismatch("string method", &a, &b)),
            }
        }
    }
}

/// Structural JSON equality with numbers compared by value.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(l), Value::Bool(r)) => l == r,
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            },
        },
        (Value::String(l), Value::String(r)) => l == r,
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l.iter()
                    .all(|(k, v)| r.get(k).is_some_and(|rv| values_equal(v, rv)))
        }
        _ => false,
    }
}

/// JSON truthiness: `null`, `false`, `0`, and empty strings, lists and maps are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn to_f64(n: &Number) -> Result<f64, EvalError> {
    n.as_f64().ok_or(EvalError::Arithmetic("number out of range"))
}

fn mismatch(what: &str, a: &Value, b: &Value) -> EvalError {
    EvalError::Type(format!(
        "{} between {} and {}",
        what,
        type_name(a),
        type_name(b)
    ))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Dotted rendering of a path expression for error messages.
fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Root(Scope::Event) => "event".into(),
        Expr::Root(Scope::Async) => "async".into(),
        Expr::Root(Scope::Steps) => "steps".into(),
        Expr::Root(Scope::Ctx) => "ctx".into(),
        Expr::Member(base, field) => format!("{}.{}", describe(base), field),
        Expr::Index(base, _) => format!("{}[..]", describe(base)),
        _ => "<expr>".into(),
    }
}
