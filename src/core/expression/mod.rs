//! Rule expressions: tokenizer -> parser -> evaluator
//!
//! Everything outside this module only needs [`CompiledExpr::compile`] and
//! [`CompiledExpr::evaluate`].

pub mod evaluator;
pub mod parser;
pub mod tokenizer;

pub use evaluator::{EvalContext, EvalError};

use crate::types::Value;
use parser::Expr;
use thiserror::Error;
use tokenizer::TokenizeError;

/// Why an expression could not be compiled
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("{0}")]
    Tokenize(#[from] TokenizeError),

    #[error("{0}")]
    Parse(#[from] parser::ParseError),
}

/// An expression parsed once and evaluated many times
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    ast: Expr,
}

impl CompiledExpr {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenizer::tokenize(source)?;
        let ast = parser::parse(tokens)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field names referenced by the expression, first occurrence order, no duplicates
    pub fn references(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        self.ast.walk_references(&mut |name| {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        });
        names
    }

    /// Evaluate to a finite number
    pub fn evaluate(&self, ctx: &EvalContext) -> Result<f64, EvalError> {
        let value = self.evaluate_value(ctx)?;
        let n = match value {
            Value::Null => 0.0,
            ref other => other.as_number().ok_or_else(|| {
                EvalError::new(format!("Expression produced a non-numeric value: '{}'", other))
            })?,
        };
        if n.is_finite() {
            Ok(n)
        } else {
            Err(EvalError::new("Expression produced a non-finite number"))
        }
    }

    /// Evaluate to any value (used for conditions)
    pub fn evaluate_value(&self, ctx: &EvalContext) -> Result<Value, EvalError> {
        evaluator::evaluate(&self.ast, ctx)
    }
}
