//! Detail -> master aggregation
//!
//! Reductions run first (SUM/AVG/COUNT/MAX/MIN over the non-deleted rows of
//! the source tab that pass the filter). Expression aggregates then run over
//! the master fields overlaid with the reduction results, and the page's
//! post-processing assignments may correct the lot before it is rounded.

use super::cascade::{round_to, scope_value};
use super::expression::{CompiledExpr, EvalContext};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::page::AggregateRuleConfig;
use crate::types::{Row, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Algorithm {
    #[serde(alias = "sum")]
    Sum,
    #[serde(alias = "AVERAGE", alias = "avg", alias = "average")]
    Avg,
    #[serde(alias = "count")]
    Count,
    #[serde(alias = "max")]
    Max,
    #[serde(alias = "min")]
    Min,
}

impl Algorithm {
    /// Reduce the values; every algorithm yields 0 for an empty input
    pub fn reduce(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Algorithm::Sum => values.iter().sum(),
            Algorithm::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Algorithm::Count => values.len() as f64,
            Algorithm::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Algorithm::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }
}

/// `field == 'value'` style row predicate
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub field: String,
    pub negate: bool,
    pub expected: Value,
}

impl RowFilter {
    /// Accepts `==`, `===`, `!=`, `!==` against a quoted string, a number,
    /// `true` or `false`
    pub fn parse(source: &str) -> Result<Self, String> {
        let pattern = Regex::new(
            r#"^\s*([A-Za-z_$][\w$]*)\s*(===|==|!==|!=)\s*('([^']*)'|"([^"]*)"|(-?\d+(?:\.\d+)?)|(true|false))\s*$"#,
        )
        .map_err(|e| format!("Regex error: {}", e))?;

        let caps = pattern
            .captures(source)
            .ok_or_else(|| format!("unsupported filter '{}'", source))?;

        let expected = if let Some(text) = caps.get(4).or_else(|| caps.get(5)) {
            Value::Text(text.as_str().to_string())
        } else if let Some(number) = caps.get(6) {
            number
                .as_str()
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|e| format!("bad number in filter '{}': {}", source, e))?
        } else if let Some(flag) = caps.get(7) {
            Value::Bool(flag.as_str() == "true")
        } else {
            return Err(format!("unsupported filter '{}'", source));
        };

        Ok(Self {
            field: caps[1].to_string(),
            negate: caps[2].starts_with('!'),
            expected,
        })
    }

    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.value(&self.field);
        let equal = match (&actual, &self.expected) {
            (Value::Number(a), Value::Number(b)) => (a - b).abs() < 1e-9,
            (Value::Date(d), Value::Text(s)) => d.format("%Y-%m-%d").to_string() == *s,
            (a, b) => a == b,
        };
        equal != self.negate
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateKind {
    Reduce {
        /// Ignored by COUNT
        source_field: Option<String>,
        algorithm: Algorithm,
        filter: Option<RowFilter>,
    },
    Expression(CompiledExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledAggregate {
    pub target_field: String,
    /// Tab key to read rows from; every tab when `None`
    pub source_tab: Option<String>,
    pub kind: AggregateKind,
}

impl CompiledAggregate {
    fn reads_tab(&self, tab: &str) -> bool {
        self.source_tab.as_deref().map_or(true, |t| t == tab)
    }
}

pub fn compile_aggregates(
    configs: &[AggregateRuleConfig],
    diags: &mut Diagnostics,
) -> Vec<CompiledAggregate> {
    let mut compiled = Vec::new();

    for config in configs {
        let target = &config.target_field;

        let kind = match (config.algorithm, &config.expression) {
            (Some(algorithm), _) => {
                if algorithm != Algorithm::Count && config.source_field.is_none() {
                    diags.record(
                        DiagnosticKind::RuleConfig,
                        target,
                        format!("{:?} aggregate needs a sourceField", algorithm),
                    );
                    continue;
                }

                let filter = match config.filter.as_deref().map(str::trim) {
                    None | Some("") => None,
                    Some(source) => match RowFilter::parse(source) {
                        Ok(filter) => Some(filter),
                        Err(message) => {
                            diags.record(
                                DiagnosticKind::Filter,
                                target,
                                format!("{}; aggregating over all rows", message),
                            );
                            None
                        }
                    },
                };

                AggregateKind::Reduce {
                    source_field: config.source_field.clone(),
                    algorithm,
                    filter,
                }
            }
            (None, Some(expression)) => match CompiledExpr::compile(expression) {
                Ok(expr) => AggregateKind::Expression(expr),
                Err(e) => {
                    diags.record(DiagnosticKind::Compile, target, e.to_string());
                    continue;
                }
            },
            (None, None) => {
                diags.record(
                    DiagnosticKind::RuleConfig,
                    target,
                    "aggregate needs an algorithm or an expression",
                );
                continue;
            }
        };

        compiled.push(CompiledAggregate {
            target_field: target.clone(),
            source_tab: config.source.clone(),
            kind,
        });
    }

    compiled
}

/// One `field = expression` step of the page's post-processing round
#[derive(Debug, Clone, PartialEq)]
pub struct PostAssignment {
    pub field: String,
    pub expr: CompiledExpr,
}

impl PostAssignment {
    pub fn parse(source: &str) -> Result<Self, String> {
        let pattern = Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=(.*)$")
            .map_err(|e| format!("Regex error: {}", e))?;

        let caps = pattern
            .captures(source)
            .filter(|caps| !caps[2].starts_with('='))
            .ok_or_else(|| format!("'{}' is not a 'field = expression' assignment", source.trim()))?;

        let expr = CompiledExpr::compile(&caps[2]).map_err(|e| e.to_string())?;
        Ok(Self {
            field: caps[1].to_string(),
            expr,
        })
    }
}

/// Compile `postProcess`: a string of `;`/newline separated assignments or an
/// array of assignment strings
///
/// A broken assignment disables the whole round.
pub fn compile_post_process(raw: &Json, diags: &mut Diagnostics) -> Vec<PostAssignment> {
    let sources: Vec<String> = match raw {
        Json::Null => return Vec::new(),
        Json::String(text) => text
            .split([';', '\n'])
            .map(str::to_string)
            .collect(),
        Json::Array(items) => items
            .iter()
            .map(|item| match item {
                Json::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect(),
        other => {
            diags.record(
                DiagnosticKind::RuleConfig,
                "postProcess",
                format!("expected a string or an array of assignments, got {}", other),
            );
            return Vec::new();
        }
    };

    let mut compiled = Vec::new();
    for source in sources.iter().filter(|s| !s.trim().is_empty()) {
        match PostAssignment::parse(source) {
            Ok(step) => compiled.push(step),
            Err(message) => {
                diags.record(
                    DiagnosticKind::Compile,
                    "postProcess",
                    format!("{}; post-processing disabled", message),
                );
                return Vec::new();
            }
        }
    }
    compiled
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Computes aggregate values for one master
#[derive(Debug, Clone)]
pub struct Aggregator {
    precision: u32,
}

impl Aggregator {
    pub fn new(precision: u32) -> Self {
        Self { precision }
    }

    /// Returns `(targetField, value)` pairs: reductions first, then expression
    /// aggregates, each in configuration order
    ///
    /// Every round works on unrounded values. `post_process` may then correct
    /// the aggregate fields; rounding happens once, at the end.
    pub fn aggregate(
        &self,
        details: &BTreeMap<String, Vec<Row>>,
        rules: &[CompiledAggregate],
        post_process: &[PostAssignment],
        master: &Row,
        diags: &mut Diagnostics,
    ) -> Vec<(String, f64)> {
        let mut results: Vec<(String, f64)> = Vec::new();

        for rule in rules {
            let AggregateKind::Reduce {
                source_field,
                algorithm,
                filter,
            } = &rule.kind
            else {
                continue;
            };

            let rows = details
                .iter()
                .filter(|(tab, _)| rule.reads_tab(tab))
                .flat_map(|(_, rows)| rows.iter())
                .filter(|row| !row.is_deleted())
                .filter(|row| filter.as_ref().map_or(true, |f| f.matches(row)));

            let values: Vec<f64> = match (algorithm, source_field) {
                (Algorithm::Count, _) | (_, None) => rows.map(|_| 1.0).collect(),
                (_, Some(field)) => rows.map(|row| row.value(field).coerce_number()).collect(),
            };

            let value = finite_or_zero(algorithm.reduce(&values));
            debug!(target_field = %rule.target_field, rows = values.len(), value, "aggregated");
            set_result(&mut results, &rule.target_field, value);
        }

        let has_expressions = rules
            .iter()
            .any(|r| matches!(r.kind, AggregateKind::Expression(_)));

        if has_expressions || !post_process.is_empty() {
            let mut scope = EvalContext::new();
            for (field, value) in master.fields() {
                scope.set(field.clone(), scope_value(value));
            }
            for (field, value) in &results {
                scope.set(field.clone(), Value::Number(*value));
            }

            for rule in rules {
                let AggregateKind::Expression(expr) = &rule.kind else {
                    continue;
                };
                let value = match expr.evaluate(&scope) {
                    Ok(v) => finite_or_zero(v),
                    Err(e) => {
                        diags.record(
                            DiagnosticKind::Evaluation,
                            &rule.target_field,
                            format!("{}; using 0", e),
                        );
                        0.0
                    }
                };
                scope.set(rule.target_field.clone(), Value::Number(value));
                set_result(&mut results, &rule.target_field, value);
            }

            if !post_process.is_empty() {
                self.post_process(&mut results, scope, post_process, diags);
            }
        }

        results
            .into_iter()
            .map(|(field, value)| (field, round_to(value, self.precision)))
            .collect()
    }

    /// Run the assignments in order; only aggregate fields are written back,
    /// and nothing is written back if any step fails
    fn post_process(
        &self,
        results: &mut [(String, f64)],
        mut scope: EvalContext,
        steps: &[PostAssignment],
        diags: &mut Diagnostics,
    ) {
        for step in steps {
            match step.expr.evaluate(&scope) {
                Ok(value) => scope.set(step.field.clone(), Value::Number(value)),
                Err(e) => {
                    diags.record(
                        DiagnosticKind::Evaluation,
                        "postProcess",
                        format!("{} = {}: {}; aggregates left as computed", step.field, step.expr.source(), e),
                    );
                    return;
                }
            }
        }

        for (field, value) in results.iter_mut() {
            if let Some(Value::Number(processed)) = scope.get(field) {
                *value = finite_or_zero(*processed);
            }
        }
    }
}

fn set_result(results: &mut Vec<(String, f64)>, field: &str, value: f64) {
    match results.iter_mut().find(|(existing, _)| *existing == field) {
        Some(slot) => slot.1 = value,
        None => results.push((field.to_string(), value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Record, RowKey};
    use serde_json::json;

    fn row(key: u64, fields: serde_json::Value) -> Row {
        let record: Record = serde_json::from_value(fields).unwrap();
        Row::loaded(RowKey(key), record)
    }

    fn rule(config: serde_json::Value) -> AggregateRuleConfig {
        serde_json::from_value(config).unwrap()
    }

    #[test]
    fn test_reduce_empty_is_zero() {
        for algorithm in [
            Algorithm::Sum,
            Algorithm::Avg,
            Algorithm::Count,
            Algorithm::Max,
            Algorithm::Min,
        ] {
            assert_eq!(algorithm.reduce(&[]), 0.0, "{:?}", algorithm);
        }
        assert_eq!(Algorithm::Avg.reduce(&[10.0, 20.0]), 15.0);
        assert_eq!(Algorithm::Max.reduce(&[-3.0, -1.0]), -1.0);
    }

    #[test]
    fn test_algorithm_aliases() {
        let parsed: Vec<Algorithm> =
            serde_json::from_value(json!(["SUM", "AVERAGE", "avg", "COUNT", "min"])).unwrap();
        assert_eq!(
            parsed,
            vec![
                Algorithm::Sum,
                Algorithm::Avg,
                Algorithm::Avg,
                Algorithm::Count,
                Algorithm::Min
            ]
        );
    }

    #[test]
    fn test_filter_parse() {
        let filter = RowFilter::parse("kind=='A'").unwrap();
        assert_eq!(filter.field, "kind");
        assert!(!filter.negate);
        assert_eq!(filter.expected, Value::from("A"));

        let filter = RowFilter::parse(r#" kind !== "B" "#).unwrap();
        assert!(filter.negate);
        assert_eq!(filter.expected, Value::from("B"));

        let filter = RowFilter::parse("grade == 2").unwrap();
        assert_eq!(filter.expected, Value::Number(2.0));

        let filter = RowFilter::parse("active === true").unwrap();
        assert_eq!(filter.expected, Value::Bool(true));

        assert!(RowFilter::parse("kind > 'A'").is_err());
        assert!(RowFilter::parse("kind == A").is_err());
    }

    #[test]
    fn test_filter_matches_strictly() {
        let filter = RowFilter::parse("grade == 2").unwrap();
        assert!(filter.matches(&row(1, json!({"grade": 2}))));
        assert!(!filter.matches(&row(2, json!({"grade": "2"}))));
        assert!(!filter.matches(&row(3, json!({}))));

        let negated = RowFilter::parse("kind != 'A'").unwrap();
        assert!(negated.matches(&row(4, json!({"kind": "B"}))));
        assert!(!negated.matches(&row(5, json!({"kind": "A"}))));
    }

    #[test]
    fn test_compile_drops_and_reports() {
        let mut diags = Diagnostics::new();
        let compiled = compile_aggregates(
            &[
                rule(json!({"targetField": "t1", "algorithm": "SUM"})),
                rule(json!({"targetField": "t2", "algorithm": "COUNT"})),
                rule(json!({"targetField": "t3", "sourceField": "x", "algorithm": "SUM", "filter": "x >> 1"})),
                rule(json!({"targetField": "t4"})),
                rule(json!({"targetField": "t5", "expression": "t2 +"})),
            ],
            &mut diags,
        );

        let targets: Vec<_> = compiled.iter().map(|c| c.target_field.as_str()).collect();
        assert_eq!(targets, vec!["t2", "t3"]);
        assert_eq!(diags.of_kind(DiagnosticKind::Filter).count(), 1);
        assert_eq!(diags.of_kind(DiagnosticKind::RuleConfig).count(), 2);
        assert_eq!(diags.of_kind(DiagnosticKind::Compile).count(), 1);
    }

    #[test]
    fn test_aggregate_by_tab_and_filter() {
        let mut details = BTreeMap::new();
        details.insert(
            "yl".to_string(),
            vec![
                row(1, json!({"cost": 10, "kind": "A"})),
                row(2, json!({"cost": "5.5", "kind": "B"})),
                row(3, json!({"cost": null, "kind": "A"})),
            ],
        );
        details.insert("fl".to_string(), vec![row(4, json!({"cost": 7, "kind": "A"}))]);

        let mut diags = Diagnostics::new();
        let rules = compile_aggregates(
            &[
                rule(json!({"targetField": "totalYl", "sourceField": "cost", "algorithm": "SUM", "source": "yl"})),
                rule(json!({"targetField": "totalAll", "sourceField": "cost", "algorithm": "SUM"})),
                rule(json!({"targetField": "countA", "algorithm": "COUNT", "filter": "kind=='A'"})),
                rule(json!({"targetField": "maxYl", "sourceField": "cost", "algorithm": "MAX", "tab": "yl"})),
                rule(json!({"targetField": "none", "sourceField": "cost", "algorithm": "AVG", "source": "missing"})),
            ],
            &mut diags,
        );

        let master = row(100, json!({}));
        let results = Aggregator::new(2).aggregate(&details, &rules, &[], &master, &mut diags);
        assert_eq!(
            results,
            vec![
                ("totalYl".to_string(), 15.5),
                ("totalAll".to_string(), 22.5),
                ("countA".to_string(), 3.0),
                ("maxYl".to_string(), 10.0),
                ("none".to_string(), 0.0),
            ]
        );
        assert!(diags.is_empty());
    }

    #[test]
    fn test_expression_aggregates_see_reductions_and_master() {
        let mut details = BTreeMap::new();
        details.insert("yl".to_string(), vec![row(1, json!({"cost": 10}))]);
        details.insert("fl".to_string(), vec![row(2, json!({"cost": 4}))]);

        let mut diags = Diagnostics::new();
        let rules = compile_aggregates(
            &[
                rule(json!({"targetField": "grandTotal", "expression": "totalYl + totalFl + fee"})),
                rule(json!({"targetField": "broken", "expression": "totalYl / 0"})),
                rule(json!({"targetField": "totalYl", "sourceField": "cost", "algorithm": "SUM", "source": "yl"})),
                rule(json!({"targetField": "totalFl", "sourceField": "cost", "algorithm": "SUM", "source": "fl"})),
            ],
            &mut diags,
        );

        let master = row(100, json!({"fee": null}));
        let results = Aggregator::new(2).aggregate(&details, &rules, &[], &master, &mut diags);
        assert_eq!(
            results,
            vec![
                ("totalYl".to_string(), 10.0),
                ("totalFl".to_string(), 4.0),
                ("grandTotal".to_string(), 14.0),
                ("broken".to_string(), 0.0),
            ]
        );
        assert_eq!(diags.of_kind(DiagnosticKind::Evaluation).count(), 1);
    }

    #[test]
    fn test_expression_aggregates_read_unrounded_reductions() {
        let mut details = BTreeMap::new();
        details.insert(
            "yl".to_string(),
            vec![row(1, json!({"cost": 1})), row(2, json!({"cost": 0})), row(3, json!({"cost": 0}))],
        );

        let mut diags = Diagnostics::new();
        let rules = compile_aggregates(
            &[
                rule(json!({"targetField": "avgCost", "sourceField": "cost", "algorithm": "AVG"})),
                rule(json!({"targetField": "scaled", "expression": "avgCost * 300"})),
            ],
            &mut diags,
        );

        let results = Aggregator::new(2).aggregate(&details, &rules, &[], &row(100, json!({})), &mut diags);
        assert_eq!(
            results,
            vec![("avgCost".to_string(), 0.33), ("scaled".to_string(), 100.0)]
        );
    }

    #[test]
    fn test_post_process_corrects_aggregates_before_rounding() {
        let mut details = BTreeMap::new();
        details.insert("yl".to_string(), vec![row(1, json!({"cost": 113})), row(2, json!({"cost": 113}))]);

        let mut diags = Diagnostics::new();
        let rules = compile_aggregates(
            &[
                rule(json!({"targetField": "totalYl", "sourceField": "cost", "algorithm": "SUM"})),
                rule(json!({"targetField": "lines", "algorithm": "COUNT"})),
            ],
            &mut diags,
        );
        let post = compile_post_process(
            &json!("net = IF(totalYl > 0, totalYl / 1.13, 0)\ntotalYl = net / 3; lines = lines + taxRate"),
            &mut diags,
        );
        assert_eq!(post.len(), 3);
        assert!(diags.is_empty());

        let master = row(100, json!({"taxRate": 10}));
        let results = Aggregator::new(2).aggregate(&details, &rules, &post, &master, &mut diags);
        // Temporaries like `net` stay out of the results
        assert_eq!(
            results,
            vec![("totalYl".to_string(), 66.67), ("lines".to_string(), 12.0)]
        );
    }

    #[test]
    fn test_failed_post_process_keeps_computed_values() {
        let mut details = BTreeMap::new();
        details.insert("yl".to_string(), vec![row(1, json!({"cost": 4}))]);

        let mut diags = Diagnostics::new();
        let rules = compile_aggregates(
            &[rule(json!({"targetField": "total", "sourceField": "cost", "algorithm": "SUM"}))],
            &mut diags,
        );
        let post = compile_post_process(&json!(["total = total * 2", "total = total / 0"]), &mut diags);

        let results = Aggregator::new(2).aggregate(&details, &rules, &post, &row(100, json!({})), &mut diags);
        assert_eq!(results, vec![("total".to_string(), 4.0)]);
        assert_eq!(diags.entries()[0].subject, "postProcess");
    }

    #[test]
    fn test_post_process_rejects_non_assignments() {
        let mut diags = Diagnostics::new();
        assert!(compile_post_process(&json!("total == 3"), &mut diags).is_empty());
        assert!(compile_post_process(&json!(["a = 1", "(b"]), &mut diags).is_empty());
        assert!(compile_post_process(&json!(7), &mut diags).is_empty());
        assert_eq!(diags.len(), 3);
        assert!(compile_post_process(&json!(null), &mut diags).is_empty());
        assert_eq!(diags.len(), 3);
    }
}
