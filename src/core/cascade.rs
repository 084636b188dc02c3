//! Dependency-driven cascade over the calc rules of one row
//!
//! A changed field triggers every rule that depends on it, then every rule
//! that depends on those rules' fields, and so on. The affected rules are
//! evaluated in compiled order against a scope of context ∪ row fields.

use super::compiler::CompiledRule;
use super::dirty::DirtyTracker;
use super::expression::EvalContext;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::types::{ChangeType, Context, Row, Value};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// Decides whether a rule must re-run when `field` changes
pub trait DependencyTest {
    fn depends_on(&self, rule: &CompiledRule, field: &str) -> bool;
}

/// Exact match against the declared (or inferred) dependencies; used for row-local edits
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredDependencies;

impl DependencyTest for DeclaredDependencies {
    fn depends_on(&self, rule: &CompiledRule, field: &str) -> bool {
        rule.depends_on(field)
    }
}

/// Substring match of the field name in the rule's expression text
///
/// Looser than [`DeclaredDependencies`]: a broadcast field that a detail
/// rule reads without declaring it still triggers the rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionMentions;

impl DependencyTest for ExpressionMentions {
    fn depends_on(&self, rule: &CompiledRule, field: &str) -> bool {
        rule.expression_texts()
            .iter()
            .any(|text| text.contains(field))
    }
}

/// Rules transitively affected by a change to `changed`, in compiled order
pub fn affected_rules<'r>(
    changed: &str,
    rules: &'r [CompiledRule],
    test: &dyn DependencyTest,
) -> Vec<&'r CompiledRule> {
    affected_by_any(&[changed], rules, test)
}

/// Rules transitively affected by a change to any of `seeds`, in compiled order
pub fn affected_by_any<'r>(
    seeds: &[&str],
    rules: &'r [CompiledRule],
    test: &dyn DependencyTest,
) -> Vec<&'r CompiledRule> {
    let mut affected = vec![false; rules.len()];
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();

    for &seed in seeds {
        if visited.insert(seed) {
            queue.push_back(seed);
        }
    }

    while let Some(current) = queue.pop_front() {
        for (index, rule) in rules.iter().enumerate() {
            if affected[index] || !test.depends_on(rule, current) {
                continue;
            }
            affected[index] = true;
            // A field already marked affected is never traversed again
            if visited.insert(rule.field.as_str()) {
                queue.push_back(rule.field.as_str());
            }
        }
    }

    rules
        .iter()
        .zip(affected)
        .filter_map(|(rule, hit)| hit.then_some(rule))
        .collect()
}

/// Round half away from zero; non-finite input becomes 0
pub fn round_to(value: f64, precision: u32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10_f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

/// How a stored value reads inside an evaluation scope
pub fn scope_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::Number(0.0),
        other => other.clone(),
    }
}

/// Evaluates compiled rules against one row
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    precision: u32,
}

impl RuleEvaluator {
    pub fn new(precision: u32) -> Self {
        Self { precision }
    }

    /// Context first, row fields on top; dependencies missing from both read as 0
    pub fn build_scope(&self, row: &Row, context: &Context, rules: &[&CompiledRule]) -> EvalContext {
        let mut scope = EvalContext::new();
        for (field, value) in context.iter().chain(row.fields()) {
            scope.set(field.clone(), scope_value(value));
        }
        for rule in rules {
            for dependency in &rule.dependencies {
                if scope.get(dependency).is_none() {
                    scope.set(dependency.clone(), Value::Number(0.0));
                }
            }
        }
        scope
    }

    /// Evaluate `rules` in the given order and return the computed `(field, value)` pairs
    ///
    /// Each unrounded result is written back into the scope before the next
    /// rule runs; only the returned values are rounded. A rule that fails
    /// leaves its field alone and records a diagnostic.
    pub fn evaluate(
        &self,
        row: &Row,
        context: &Context,
        rules: &[&CompiledRule],
        diags: &mut Diagnostics,
    ) -> Vec<(String, f64)> {
        let mut scope = self.build_scope(row, context, rules);
        let mut results: Vec<(String, f64)> = Vec::new();

        for rule in rules {
            if let Some(condition) = &rule.condition {
                match condition.evaluate_value(&scope) {
                    Ok(value) if !value.is_truthy() => continue,
                    Ok(_) => {}
                    Err(e) => diags.record(
                        DiagnosticKind::Evaluation,
                        &rule.field,
                        format!("condition failed, treated as true: {}", e),
                    ),
                }
            }

            let Some(expr) = rule.resolve(row) else {
                debug!(field = %rule.field, "no formula matches the discriminant");
                continue;
            };

            match expr.evaluate(&scope) {
                Ok(raw) => {
                    let value = round_to(raw, self.precision);
                    let raw = if raw.is_finite() { raw } else { value };
                    scope.set(rule.field.clone(), Value::Number(raw));
                    match results.iter_mut().find(|(field, _)| *field == rule.field) {
                        Some(existing) => existing.1 = value,
                        None => results.push((rule.field.clone(), value)),
                    }
                }
                Err(e) => diags.record(
                    DiagnosticKind::Evaluation,
                    &rule.field,
                    format!("{} ({})", e, expr.source()),
                ),
            }
        }

        results
    }
}

/// Write computed values through the tracker as `calc`; returns the fields that changed
pub fn apply_results(row: &mut Row, results: &[(String, f64)], tracker: &DirtyTracker) -> Vec<String> {
    results
        .iter()
        .filter(|(field, value)| {
            tracker.mark_change(row, field, Value::Number(*value), ChangeType::Calc)
        })
        .map(|(field, _)| field.clone())
        .collect()
}
