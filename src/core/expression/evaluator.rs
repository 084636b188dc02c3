//! Expression evaluator
//!
//! Evaluates an AST against a scope of field values.

use super::parser::Expr;
use crate::types::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Evaluation scope: field name -> value
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub variables: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value.into());
        self
    }
}

/// Error during evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Eval error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

/// Evaluate an expression in the given context
pub fn evaluate(expr: &Expr, ctx: &EvalContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),

        Expr::Text(s) => Ok(Value::Text(s.clone())),

        Expr::Reference(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("Unknown variable: {}", name))),

        Expr::FunctionCall { name, args } => evaluate_function(name, args, ctx),

        // Logical operators short-circuit
        Expr::BinaryOp { op, left, right } if op == "&&" || op == "||" => {
            let left_truthy = evaluate(left, ctx)?.is_truthy();
            let result = match (op.as_str(), left_truthy) {
                ("&&", false) => false,
                ("||", true) => true,
                _ => evaluate(right, ctx)?.is_truthy(),
            };
            Ok(Value::Bool(result))
        }

        Expr::BinaryOp { op, left, right } => {
            let left_val = evaluate(left, ctx)?;
            let right_val = evaluate(right, ctx)?;
            evaluate_binary_op(op, &left_val, &right_val)
        }

        Expr::UnaryOp { op, operand } => {
            let val = evaluate(operand, ctx)?;
            evaluate_unary_op(op, &val)
        }

        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => {
            if evaluate(condition, ctx)?.is_truthy() {
                evaluate(then, ctx)
            } else {
                evaluate(otherwise, ctx)
            }
        }
    }
}

fn operand(value: &Value, side: &str) -> Result<f64, EvalError> {
    match value {
        Value::Null => Ok(0.0),
        other => other
            .as_number()
            .ok_or_else(|| EvalError::new(format!("{} operand must be a number", side))),
    }
}

fn numeric_operands(left: &Value, right: &Value) -> Result<(f64, f64), EvalError> {
    Ok((operand(left, "Left")?, operand(right, "Right")?))
}

/// Evaluate a binary operation
fn evaluate_binary_op(op: &str, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        "+" => {
            // Text concatenation
            if matches!(left, Value::Text(_)) && left.as_number().is_none()
                || matches!(right, Value::Text(_)) && right.as_number().is_none()
            {
                return Ok(Value::Text(format!("{}{}", left.as_text(), right.as_text())));
            }
            let (l, r) = numeric_operands(left, right)?;
            Ok(Value::Number(l + r))
        }
        "-" => {
            let (l, r) = numeric_operands(left, right)?;
            Ok(Value::Number(l - r))
        }
        "*" => {
            let (l, r) = numeric_operands(left, right)?;
            Ok(Value::Number(l * r))
        }
        "/" => {
            let (l, r) = numeric_operands(left, right)?;
            if r == 0.0 {
                Err(EvalError::new("Division by zero"))
            } else {
                Ok(Value::Number(l / r))
            }
        }
        "%" => {
            let (l, r) = numeric_operands(left, right)?;
            if r == 0.0 {
                Err(EvalError::new("Modulo by zero"))
            } else {
                Ok(Value::Number(l % r))
            }
        }
        "^" => {
            let (l, r) = numeric_operands(left, right)?;
            Ok(Value::Number(l.powf(r)))
        }

        "=" => Ok(Value::Bool(values_equal(left, right))),
        "<>" => Ok(Value::Bool(!values_equal(left, right))),
        "<" | ">" | "<=" | ">=" => {
            let ordering = compare_values(left, right)?;
            let result = match op {
                "<" => ordering == Ordering::Less,
                ">" => ordering == Ordering::Greater,
                "<=" => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }

        _ => Err(EvalError::new(format!("Unknown operator: {}", op))),
    }
}

/// Equality with loose numeric coercion ("5" equals 5)
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Text(l), Value::Text(r)) => l == r,
        (Value::Date(l), Value::Date(r)) => l == r,
        (Value::Date(d), Value::Text(s)) | (Value::Text(s), Value::Date(d)) => {
            d.format("%Y-%m-%d").to_string() == *s
        }
        (Value::Null, Value::Null) => true,
        _ => match (left.as_number(), right.as_number()) {
            (Some(l), Some(r)) => (l - r).abs() < 1e-10,
            _ => false,
        },
    }
}

fn compare_values(left: &Value, right: &Value) -> Result<Ordering, EvalError> {
    match (left, right) {
        (Value::Date(l), Value::Date(r)) => Ok(l.cmp(r)),
        (Value::Text(l), Value::Text(r)) if left.as_number().is_none() || right.as_number().is_none() => {
            Ok(l.cmp(r))
        }
        _ => {
            let (l, r) = numeric_operands(left, right)?;
            l.partial_cmp(&r)
                .ok_or_else(|| EvalError::new("Cannot compare NaN"))
        }
    }
}

/// Evaluate a unary operation
fn evaluate_unary_op(op: &str, operand_val: &Value) -> Result<Value, EvalError> {
    match op {
        "-" => Ok(Value::Number(-operand(operand_val, "Unary")?)),
        "+" => Ok(Value::Number(operand(operand_val, "Unary")?)),
        "!" => Ok(Value::Bool(!operand_val.is_truthy())),
        _ => Err(EvalError::new(format!("Unknown unary operator: {}", op))),
    }
}

fn number_arg(func: &str, arg: &Expr, ctx: &EvalContext) -> Result<f64, EvalError> {
    let value = evaluate(arg, ctx)?;
    match value {
        Value::Null => Ok(0.0),
        other => other
            .as_number()
            .ok_or_else(|| EvalError::new(format!("{} requires a number", func))),
    }
}

fn optional_number_arg(
    func: &str,
    args: &[Expr],
    index: usize,
    default: f64,
    ctx: &EvalContext,
) -> Result<f64, EvalError> {
    match args.get(index) {
        Some(arg) => number_arg(func, arg, ctx),
        None => Ok(default),
    }
}

/// Evaluate a function call
fn evaluate_function(name: &str, args: &[Expr], ctx: &EvalContext) -> Result<Value, EvalError> {
    let upper_name = name.to_uppercase();
    let func = upper_name.as_str();

    match func {
        // ═══════════════════════════════════════════════════════════════════════
        // MATH FUNCTIONS
        // ═══════════════════════════════════════════════════════════════════════
        "ABS" => {
            require_args(func, args, 1)?;
            Ok(Value::Number(number_arg(func, &args[0], ctx)?.abs()))
        }

        "SQRT" => {
            require_args(func, args, 1)?;
            let val = number_arg(func, &args[0], ctx)?;
            if val < 0.0 {
                Err(EvalError::new("SQRT of negative number"))
            } else {
                Ok(Value::Number(val.sqrt()))
            }
        }

        "ROUND" | "ROUNDUP" | "ROUNDDOWN" => {
            require_args_range(func, args, 1, 2)?;
            let val = number_arg(func, &args[0], ctx)?;
            let decimals = optional_number_arg(func, args, 1, 0.0, ctx)? as i32;
            let multiplier = 10_f64.powi(decimals);
            let sign = if val >= 0.0 { 1.0 } else { -1.0 };
            let scaled = val.abs() * multiplier;
            let rounded = match func {
                "ROUNDUP" => scaled.ceil(),
                "ROUNDDOWN" => scaled.floor(),
                _ => scaled.round(),
            };
            Ok(Value::Number(sign * rounded / multiplier))
        }

        "FLOOR" | "CEILING" => {
            require_args_range(func, args, 1, 2)?;
            let val = number_arg(func, &args[0], ctx)?;
            let significance = optional_number_arg(func, args, 1, 1.0, ctx)?;
            if significance == 0.0 {
                return Ok(Value::Number(0.0));
            }
            let steps = val / significance;
            let steps = if func == "FLOOR" {
                steps.floor()
            } else {
                steps.ceil()
            };
            Ok(Value::Number(steps * significance))
        }

        "INT" => {
            require_args(func, args, 1)?;
            Ok(Value::Number(number_arg(func, &args[0], ctx)?.floor()))
        }

        "MOD" => {
            require_args(func, args, 2)?;
            let num = number_arg(func, &args[0], ctx)?;
            let divisor = number_arg(func, &args[1], ctx)?;
            if divisor == 0.0 {
                Err(EvalError::new("MOD division by zero"))
            } else {
                // Result takes the sign of the divisor
                Ok(Value::Number(num - divisor * (num / divisor).floor()))
            }
        }

        "POWER" => {
            require_args(func, args, 2)?;
            let base = number_arg(func, &args[0], ctx)?;
            let exp = number_arg(func, &args[1], ctx)?;
            Ok(Value::Number(base.powf(exp)))
        }

        "EXP" => {
            require_args(func, args, 1)?;
            Ok(Value::Number(number_arg(func, &args[0], ctx)?.exp()))
        }

        "LN" | "LOG" => {
            require_args_range(func, args, 1, if func == "LN" { 1 } else { 2 })?;
            let val = number_arg(func, &args[0], ctx)?;
            if val <= 0.0 {
                return Err(EvalError::new(format!("{} of non-positive number", func)));
            }
            if func == "LN" {
                Ok(Value::Number(val.ln()))
            } else {
                let base = optional_number_arg(func, args, 1, 10.0, ctx)?;
                if base == 10.0 {
                    Ok(Value::Number(val.log10()))
                } else {
                    Ok(Value::Number(val.log(base)))
                }
            }
        }

        // ═══════════════════════════════════════════════════════════════════════
        // AGGREGATION OVER ARGUMENTS
        // ═══════════════════════════════════════════════════════════════════════
        "SUM" => Ok(Value::Number(collect_numeric_values(args, ctx)?.iter().sum())),

        "AVERAGE" | "AVG" => {
            let values = collect_numeric_values(args, ctx)?;
            if values.is_empty() {
                return Err(EvalError::new(format!("{} of no values", func)));
            }
            Ok(Value::Number(values.iter().sum::<f64>() / values.len() as f64))
        }

        "MIN" | "MAX" => {
            let values = collect_numeric_values(args, ctx)?;
            let folded = if func == "MIN" {
                values.into_iter().reduce(f64::min)
            } else {
                values.into_iter().reduce(f64::max)
            };
            folded
                .map(Value::Number)
                .ok_or_else(|| EvalError::new(format!("{} of no values", func)))
        }

        "COUNT" => Ok(Value::Number(collect_numeric_values(args, ctx)?.len() as f64)),

        // ═══════════════════════════════════════════════════════════════════════
        // LOGICAL FUNCTIONS
        // ═══════════════════════════════════════════════════════════════════════
        "IF" => {
            require_args_range(func, args, 2, 3)?;
            if evaluate(&args[0], ctx)?.is_truthy() {
                evaluate(&args[1], ctx)
            } else if let Some(otherwise) = args.get(2) {
                evaluate(otherwise, ctx)
            } else {
                Ok(Value::Bool(false))
            }
        }

        "AND" => {
            for arg in args {
                if !evaluate(arg, ctx)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }

        "OR" => {
            for arg in args {
                if evaluate(arg, ctx)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }

        "NOT" => {
            require_args(func, args, 1)?;
            Ok(Value::Bool(!evaluate(&args[0], ctx)?.is_truthy()))
        }

        "IFERROR" => {
            require_args(func, args, 2)?;
            match evaluate(&args[0], ctx) {
                Ok(Value::Number(n)) if !n.is_finite() => evaluate(&args[1], ctx),
                Ok(value) => Ok(value),
                Err(_) => evaluate(&args[1], ctx),
            }
        }

        _ => Err(EvalError::new(format!("Unknown function: {}", name))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Require exact number of arguments
fn require_args(func: &str, args: &[Expr], count: usize) -> Result<(), EvalError> {
    if args.len() != count {
        Err(EvalError::new(format!(
            "{} requires {} argument(s), got {}",
            func,
            count,
            args.len()
        )))
    } else {
        Ok(())
    }
}

/// Require arguments in range
fn require_args_range(func: &str, args: &[Expr], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        Err(EvalError::new(format!(
            "{} requires {}-{} arguments, got {}",
            func,
            min,
            max,
            args.len()
        )))
    } else {
        Ok(())
    }
}

/// Numeric arguments only; text and nulls are skipped like spreadsheet aggregates
fn collect_numeric_values(args: &[Expr], ctx: &EvalContext) -> Result<Vec<f64>, EvalError> {
    let mut values = Vec::new();

    for arg in args {
        match evaluate(arg, ctx)? {
            Value::Number(n) => values.push(n),
            Value::Bool(b) => values.push(if b { 1.0 } else { 0.0 }),
            _ => {}
        }
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expression::parser::parse;
    use crate::core::expression::tokenizer::tokenize;

    fn eval(source: &str, ctx: &EvalContext) -> Result<Value, EvalError> {
        let tokens = tokenize(source).map_err(|e| EvalError::new(e.message))?;
        let ast = parse(tokens).map_err(|e| EvalError::new(e.message))?;
        evaluate(&ast, ctx)
    }

    fn number(source: &str, ctx: &EvalContext) -> f64 {
        eval(source, ctx).unwrap().as_number().unwrap()
    }

    #[test]
    fn test_eval_arithmetic() {
        let ctx = EvalContext::new();
        assert_eq!(number("2 + 3 * 4", &ctx), 14.0);
        assert_eq!(number("(2 + 3) * 4", &ctx), 20.0);
        assert_eq!(number("10 / 4", &ctx), 2.5);
        assert_eq!(number("7 % 3", &ctx), 1.0);
        assert_eq!(number("2 ^ 3 ^ 2", &ctx), 512.0);
        assert_eq!(number("-2 ^ 2", &ctx), 4.0);
    }

    #[test]
    fn test_eval_field_references() {
        let ctx = EvalContext::new()
            .with("apexPl", 100.0)
            .with("yield", 50.0)
            .with("note", "x");
        assert_eq!(number("apexPl / yield", &ctx), 2.0);
        assert!(eval("missing + 1", &ctx).is_err());
        assert!(eval("note * 2", &ctx).is_err());
    }

    #[test]
    fn test_eval_null_reads_as_zero_in_arithmetic() {
        let mut ctx = EvalContext::new().with("a", 3.0);
        ctx.set("b", Value::Null);
        assert_eq!(number("a + b", &ctx), 3.0);
    }

    #[test]
    fn test_eval_division_by_zero_is_error() {
        let ctx = EvalContext::new().with("q", 0.0);
        let err = eval("10 / q", &ctx).unwrap_err();
        assert!(err.message.contains("Division by zero"));
    }

    #[test]
    fn test_eval_comparisons() {
        let ctx = EvalContext::new().with("mode", "B").with("qty", "5");
        assert_eq!(eval("mode == 'B'", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval("mode != 'B'", &ctx).unwrap(), Value::Bool(false));
        assert_eq!(eval("qty = 5", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval("qty >= 5", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval("'abc' < 'abd'", &ctx).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_eval_conditional_and_logic() {
        let ctx = EvalContext::new().with("mode", "B").with("x", 5.0);
        assert_eq!(number("mode == 'B' ? x + 2 : x", &ctx), 7.0);
        assert_eq!(number("mode == 'A' ? x + 2 : x", &ctx), 5.0);
        assert_eq!(eval("x > 1 && !(x > 10)", &ctx).unwrap(), Value::Bool(true));
        // Right side never evaluated
        assert_eq!(eval("x > 1 || missing", &ctx).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_eval_math_functions() {
        let ctx = EvalContext::new();
        assert_eq!(number("ABS(-3)", &ctx), 3.0);
        assert_eq!(number("ROUND(2.346, 2)", &ctx), 2.35);
        assert_eq!(number("ROUNDUP(2.301, 1)", &ctx), 2.4);
        assert_eq!(number("ROUNDDOWN(-2.39, 1)", &ctx), -2.3);
        assert_eq!(number("CEILING(7, 5)", &ctx), 10.0);
        assert_eq!(number("FLOOR(7, 5)", &ctx), 5.0);
        assert_eq!(number("MOD(-1, 3)", &ctx), 2.0);
        assert_eq!(number("POWER(2, 10)", &ctx), 1024.0);
        assert_eq!(number("INT(3.9)", &ctx), 3.0);
        assert_eq!(number("LOG(100)", &ctx), 2.0);
        assert!(eval("SQRT(-1)", &ctx).is_err());
    }

    #[test]
    fn test_eval_argument_aggregates() {
        let ctx = EvalContext::new().with("a", 10.0).with("b", 20.0);
        assert_eq!(number("SUM(a, b, 5)", &ctx), 35.0);
        assert_eq!(number("AVG(a, b)", &ctx), 15.0);
        assert_eq!(number("max(a, b)", &ctx), 20.0);
        assert_eq!(number("MIN(a, b)", &ctx), 10.0);
        assert_eq!(number("COUNT(a, 'x', b)", &ctx), 2.0);
    }

    #[test]
    fn test_eval_logical_functions() {
        let ctx = EvalContext::new().with("x", 0.0);
        assert_eq!(number("IF(x > 0, 1, 2)", &ctx), 2.0);
        assert_eq!(number("IFERROR(10 / x, -1)", &ctx), -1.0);
        assert_eq!(eval("AND(1, x)", &ctx).unwrap(), Value::Bool(false));
        assert_eq!(eval("OR(1, x)", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval("NOT(x)", &ctx).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_eval_unknown_function() {
        let ctx = EvalContext::new();
        let err = eval("NOPE(1)", &ctx).unwrap_err();
        assert!(err.message.contains("Unknown function"));
    }

    #[test]
    fn test_eval_text_concatenation() {
        let ctx = EvalContext::new().with("code", "A");
        assert_eq!(eval("code + '-' + 1", &ctx).unwrap(), Value::from("A-1"));
    }
}
