// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Predicate expressions.
//!
//! A small, side-effect free sub-language for trigger guards, `waitForEvent`
//! match conditions and cancellation rules:
//!
//! ```text
//! async.data.request_id == event.data.request_id && async.data.amount > 100
//! ```
//!
//! Four roots are visible: `event`, `async`, `steps` and `ctx`. Expressions
//! are compiled once (at function registration) and cached by source string.
//!
//! # Evaluation rules
//!
//! - A missing field equals `null` and nothing else; any other use of it is an
//!   error.
//! - `&&` and `||` are commutative over errors: `false && <error>` is `false`.
//! - [`Expression::matches`] maps every evaluation error to `false`, and any
//!   other result through JSON truthiness.

mod eval;
mod parser;

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

pub use eval::{Env, EvalError, is_truthy, values_equal};
pub use parser::MAX_DEPTH;

/// Longest accepted expression source, in bytes.
pub const MAX_EXPRESSION_LEN: usize = 4096;

/// Compiled expressions kept before the cache is flushed.
const MAX_CACHED: usize = 10_000;

/// Compile-time expression failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ExpressionError {
    /// The source does not parse.
    #[error("invalid expression `{expression}` at position {position}: {message}")]
    Syntax {
        expression: String,
        position: usize,
        message: String,
    },
    /// The source exceeds [`MAX_EXPRESSION_LEN`].
    #[error("expression is {len} bytes, limit is {limit}")]
    TooLarge { len: usize, limit: usize },
}

impl ExpressionError {
    pub(crate) fn syntax(src: &str, position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            expression: src.to_string(),
            position,
            message: message.into(),
        }
    }
}

/// A parsed predicate.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: parser::Expr,
}

impl Expression {
    /// Parse and validate `source`.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        if source.len() > MAX_EXPRESSION_LEN {
            return Err(ExpressionError::TooLarge {
                len: source.len(),
                limit: MAX_EXPRESSION_LEN,
            });
        }
        Ok(Self {
            source: source.to_string(),
            ast: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a value.
    pub fn evaluate(&self, env: &Env<'_>) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, env)
    }

    /// Evaluate as a predicate. Errors are `false`.
    pub fn matches(&self, env: &Env<'_>) -> bool {
        match self.evaluate(env) {
            Ok(value) => is_truthy(&value),
            Err(e) => {
                debug!(expression = %self.source, error = %e, "expression evaluated to error");
                false
            }
        }
    }
}

/// Process-wide compiled-expression cache keyed by source string.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    compiled: DashMap<String, Arc<Expression>>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared cache.
    pub fn global() -> &'static ExpressionCache {
        static GLOBAL: OnceLock<ExpressionCache> = OnceLock::new();
        GLOBAL.get_or_init(ExpressionCache::new)
    }

    /// Compile `source`, reusing an earlier compilation of the same string.
    pub fn compile(&self, source: &str) -> Result<Arc<Expression>, ExpressionError> {
        if let Some(hit) = self.compiled.get(source) {
            return Ok(Arc::clone(hit.value()));
        }
        let expr = Arc::new(Expression::compile(source)?);
        if self.compiled.len() >= MAX_CACHED {
            self.compiled.clear();
        }
        self.compiled
            .insert(source.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// Compile and evaluate as a predicate. Compile errors are `false`.
    pub fn matches(&self, source: &str, env: &Env<'_>) -> bool {
        match self.compile(source) {
            Ok(expr) => expr.matches(env),
            Err(e) => {
                debug!(error = %e, "expression failed to compile at evaluation time");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Drop every cached compilation.
    pub fn clear(&self) {
        self.compiled.clear();
    }
}
