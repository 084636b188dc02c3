//! Rule compiler: raw rule configuration -> executable, ordered rules

use super::aggregate::{compile_aggregates, compile_post_process, CompiledAggregate, PostAssignment};
use super::expression::CompiledExpr;
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::page::{parse_broadcast_fields, parse_rule_array, CalcRuleConfig, PageConfig};
use crate::types::Row;
use crate::validation::{compile_validation, CompiledValidation};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RuleBody {
    Single(CompiledExpr),
    /// Expression chosen by the current value of `formula_field`
    ByDiscriminant {
        formula_field: String,
        formulas: BTreeMap<String, CompiledExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub field: String,
    pub body: RuleBody,
    /// Fields whose change re-triggers this rule
    pub dependencies: Vec<String>,
    pub order: f64,
    /// Index in the configured rule array
    pub position: usize,
    pub condition: Option<CompiledExpr>,
}

impl CompiledRule {
    pub fn depends_on(&self, field: &str) -> bool {
        self.dependencies.iter().any(|d| d == field)
    }

    /// Source text of every expression the rule may evaluate
    pub fn expression_texts(&self) -> Vec<&str> {
        match &self.body {
            RuleBody::Single(expr) => vec![expr.source()],
            RuleBody::ByDiscriminant { formulas, .. } => {
                formulas.values().map(CompiledExpr::source).collect()
            }
        }
    }

    /// The expression to evaluate for this row; `None` when no candidate matches
    ///
    /// The discriminant is the row's stored value, so a null or missing
    /// `formula_field` reads as `""` rather than the scope's 0.
    pub fn resolve(&self, row: &Row) -> Option<&CompiledExpr> {
        match &self.body {
            RuleBody::Single(expr) => Some(expr),
            RuleBody::ByDiscriminant {
                formula_field,
                formulas,
            } => formulas.get(&row.value(formula_field).as_text()),
        }
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}

fn compile_rule(
    position: usize,
    config: &CalcRuleConfig,
    diags: &mut Diagnostics,
) -> Option<CompiledRule> {
    let field = &config.field;

    let body = match (&config.formula_field, &config.expression) {
        (Some(formula_field), _) if !config.formulas.is_empty() => {
            let mut formulas = BTreeMap::new();
            for (key, candidate) in &config.formulas {
                match CompiledExpr::compile(candidate.expression()) {
                    Ok(expr) => {
                        formulas.insert(key.clone(), expr);
                    }
                    Err(e) => diags.record(
                        DiagnosticKind::Compile,
                        format!("{}[{}]", field, key),
                        e.to_string(),
                    ),
                }
            }
            if formulas.is_empty() {
                diags.record(
                    DiagnosticKind::Compile,
                    field,
                    "no candidate formula compiled; rule dropped",
                );
                return None;
            }
            RuleBody::ByDiscriminant {
                formula_field: formula_field.clone(),
                formulas,
            }
        }
        (_, Some(expression)) => match CompiledExpr::compile(expression) {
            Ok(expr) => RuleBody::Single(expr),
            Err(e) => {
                diags.record(DiagnosticKind::Compile, field, e.to_string());
                return None;
            }
        },
        _ => {
            diags.record(
                DiagnosticKind::RuleConfig,
                field,
                "rule needs an expression or a formulaField with formulas",
            );
            return None;
        }
    };

    let condition = match &config.condition {
        Some(source) if !source.trim().is_empty() => match CompiledExpr::compile(source) {
            Ok(expr) => Some(expr),
            Err(e) => {
                diags.record(
                    DiagnosticKind::Compile,
                    field,
                    format!("condition ignored: {}", e),
                );
                None
            }
        },
        _ => None,
    };

    let mut dependencies = Vec::new();
    match &config.trigger_fields {
        Some(declared) => {
            for name in declared {
                push_unique(&mut dependencies, name);
            }
        }
        None => {
            let mut inferred = match &body {
                RuleBody::Single(expr) => expr.references(),
                RuleBody::ByDiscriminant { formulas, .. } => {
                    formulas.values().flat_map(|e| e.references()).collect()
                }
            };
            if let Some(condition) = &condition {
                inferred.extend(condition.references());
            }
            for name in &inferred {
                push_unique(&mut dependencies, name);
            }
        }
    }
    if let RuleBody::ByDiscriminant { formula_field, .. } = &body {
        push_unique(&mut dependencies, formula_field);
        for candidate in config.formulas.values() {
            for name in candidate.trigger_fields() {
                push_unique(&mut dependencies, name);
            }
        }
    }

    Some(CompiledRule {
        field: field.clone(),
        body,
        dependencies,
        order: config.order.unwrap_or(position as f64),
        position,
        condition,
    })
}

/// Indices of rules that sit on a dependency cycle (self-dependency included)
fn cyclic_rules(rules: &[CompiledRule]) -> HashSet<usize> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..rules.len()).map(|i| graph.add_node(i)).collect();

    for (i, producer) in rules.iter().enumerate() {
        for (j, consumer) in rules.iter().enumerate() {
            if consumer.depends_on(&producer.field) {
                graph.add_edge(nodes[i], nodes[j], ());
            }
        }
    }

    let mut cyclic = HashSet::new();
    for component in tarjan_scc(&graph) {
        let on_cycle = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.contains_edge(n, n));
        if on_cycle {
            cyclic.extend(component.iter().map(|&n| graph[n]));
        }
    }
    cyclic
}

/// Compile a rule array into rules sorted by `order`, ties by position
///
/// Rules that fail to compile are dropped with a diagnostic. Compiling the
/// same configuration twice yields the same rules.
pub fn compile_calc_rules(
    configs: &[CalcRuleConfig],
    engine: &EngineConfig,
    diags: &mut Diagnostics,
) -> Vec<CompiledRule> {
    let mut rules: Vec<CompiledRule> = configs
        .iter()
        .enumerate()
        .filter_map(|(position, config)| compile_rule(position, config, diags))
        .collect();

    let cyclic = cyclic_rules(&rules);
    if !cyclic.is_empty() {
        let mut fields: Vec<&str> = cyclic.iter().map(|&i| rules[i].field.as_str()).collect();
        fields.sort_unstable();
        fields.dedup();
        if engine.reject_cycles {
            for &field in &fields {
                diags.record(
                    DiagnosticKind::CircularDependency,
                    field,
                    "rule is part of a dependency cycle; rule dropped",
                );
            }
            let mut index = 0;
            rules.retain(|_| {
                let keep = !cyclic.contains(&index);
                index += 1;
                keep
            });
        } else {
            warn!(fields = ?fields, "calc rules form a dependency cycle; keeping them");
        }
    }

    rules.sort_by(|a, b| a.order.total_cmp(&b.order).then(a.position.cmp(&b.position)));
    debug!(count = rules.len(), "compiled calc rules");
    rules
}

/// Every compiled rule of one page, owned by the session
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub master_calc: Vec<CompiledRule>,
    pub detail_calc: BTreeMap<String, Vec<CompiledRule>>,
    pub aggregates: Vec<CompiledAggregate>,
    pub post_process: Vec<PostAssignment>,
    pub broadcast_fields: Vec<String>,
    pub master_validation: Vec<CompiledValidation>,
    pub detail_validation: BTreeMap<String, Vec<CompiledValidation>>,
}

impl RuleSet {
    pub fn compile(page: &PageConfig, engine: &EngineConfig, diags: &mut Diagnostics) -> Self {
        let master_configs: Vec<CalcRuleConfig> =
            parse_rule_array(&page.master_calc_rules, "masterCalcRules", diags);
        let master_calc = compile_calc_rules(&master_configs, engine, diags);

        let mut detail_calc = BTreeMap::new();
        let mut detail_validation = BTreeMap::new();
        for tab in &page.tabs {
            let label = format!("tabs.{}.calcRules", tab.key);
            let configs: Vec<CalcRuleConfig> = parse_rule_array(&tab.calc_rules, &label, diags);
            detail_calc.insert(tab.key.clone(), compile_calc_rules(&configs, engine, diags));

            let label = format!("tabs.{}.validation", tab.key);
            detail_validation.insert(
                tab.key.clone(),
                compile_validation(&parse_rule_array(&tab.validation, &label, diags), diags),
            );
        }

        let aggregate_configs = parse_rule_array(&page.aggregates, "aggregates", diags);
        let aggregates = compile_aggregates(&aggregate_configs, diags);
        let post_process = compile_post_process(&page.post_process, diags);

        let master_validation = compile_validation(
            &parse_rule_array(&page.master_validation, "masterValidation", diags),
            diags,
        );

        Self {
            master_calc,
            detail_calc,
            aggregates,
            post_process,
            broadcast_fields: parse_broadcast_fields(&page.broadcast),
            master_validation,
            detail_validation,
        }
    }

    pub fn detail_rules(&self, tab: &str) -> &[CompiledRule] {
        self.detail_calc.get(tab).map_or(&[], Vec::as_slice)
    }

    pub fn is_broadcast_field(&self, field: &str) -> bool {
        self.broadcast_fields.iter().any(|f| f == field)
    }

    pub fn aggregated_fields(&self) -> Vec<String> {
        self.aggregates.iter().map(|a| a.target_field.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expression::EvalContext;
    use crate::page::FormulaConfig;
    use crate::types::{Record, RowKey, Value};

    fn compile(configs: &[CalcRuleConfig]) -> (Vec<CompiledRule>, Diagnostics) {
        let mut diags = Diagnostics::new();
        let rules = compile_calc_rules(configs, &EngineConfig::default(), &mut diags);
        (rules, diags)
    }

    fn fields(rules: &[CompiledRule]) -> Vec<&str> {
        rules.iter().map(|r| r.field.as_str()).collect()
    }

    #[test]
    fn test_sorted_by_order_then_position() {
        let (rules, diags) = compile(&[
            CalcRuleConfig::expression("c", "1").with_order(2.0),
            CalcRuleConfig::expression("a", "1").with_order(1.0),
            CalcRuleConfig::expression("b", "1").with_order(1.0),
            CalcRuleConfig::expression("d", "1"),
        ]);
        assert!(diags.is_empty());
        // "d" defaults to its position (3)
        assert_eq!(fields(&rules), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_malformed_expression_drops_only_that_rule() {
        let (rules, diags) = compile(&[
            CalcRuleConfig::expression("a", "x +"),
            CalcRuleConfig::expression("b", "x * 2"),
        ]);
        assert_eq!(fields(&rules), vec!["b"]);
        assert_eq!(diags.of_kind(DiagnosticKind::Compile).count(), 1);
        assert_eq!(diags.entries()[0].subject, "a");
    }

    #[test]
    fn test_dependencies_inferred_when_omitted() {
        let (rules, _) = compile(&[
            CalcRuleConfig::expression("total", "ROUND(price * qty, 2)"),
            CalcRuleConfig::expression("tax", "total * rate").with_triggers(&["total"]),
        ]);
        assert_eq!(rules[0].dependencies, vec!["price", "qty"]);
        assert_eq!(rules[1].dependencies, vec!["total"]);
    }

    #[test]
    fn test_discriminant_rule_dependencies() {
        let mut formulas = BTreeMap::new();
        formulas.insert("A".to_string(), FormulaConfig::Expression("x".to_string()));
        formulas.insert(
            "B".to_string(),
            FormulaConfig::Detailed {
                expression: "x + 2".to_string(),
                trigger_fields: vec!["z".to_string()],
            },
        );
        formulas.insert("C".to_string(), FormulaConfig::Expression("x +".to_string()));
        let config = CalcRuleConfig {
            field: "y".to_string(),
            expression: None,
            trigger_fields: Some(vec!["x".to_string()]),
            formula_field: Some("mode".to_string()),
            formulas,
            order: None,
            condition: None,
        };

        let (rules, diags) = compile(&[config]);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].dependencies, vec!["x", "mode", "z"]);
        assert_eq!(rules[0].expression_texts(), vec!["x", "x + 2"]);
        assert_eq!(diags.entries()[0].subject, "y[C]");

        let row = discriminated_row("B");
        let expr = rules[0].resolve(&row).unwrap();
        assert_eq!(expr.evaluate(&EvalContext::new().with("x", 5.0)).unwrap(), 7.0);

        assert!(rules[0].resolve(&discriminated_row("Q")).is_none());
    }

    fn discriminated_row(mode: impl Into<Value>) -> Row {
        let mut record = Record::new();
        record.insert("mode".to_string(), mode.into());
        Row::loaded(RowKey(1), record)
    }

    #[test]
    fn test_null_discriminant_matches_no_formula() {
        let mut formulas = BTreeMap::new();
        formulas.insert("0".to_string(), FormulaConfig::Expression("x + 100".to_string()));
        formulas.insert("A".to_string(), FormulaConfig::Expression("x + 1".to_string()));
        let config = CalcRuleConfig {
            field: "y".to_string(),
            expression: None,
            trigger_fields: None,
            formula_field: Some("mode".to_string()),
            formulas,
            order: None,
            condition: None,
        };

        let (rules, _) = compile(&[config]);
        assert!(rules[0].resolve(&discriminated_row(Value::Null)).is_none());
        assert!(rules[0].resolve(&Row::loaded(RowKey(2), Record::new())).is_none());
        assert!(rules[0].resolve(&discriminated_row(0.0)).is_some());
    }

    #[test]
    fn test_cycles_rejected() {
        let (rules, diags) = compile(&[
            CalcRuleConfig::expression("a", "b + 1"),
            CalcRuleConfig::expression("b", "a + 1"),
            CalcRuleConfig::expression("c", "c * 2"),
            CalcRuleConfig::expression("d", "a + 1"),
        ]);
        assert_eq!(fields(&rules), vec!["d"]);
        assert_eq!(diags.of_kind(DiagnosticKind::CircularDependency).count(), 3);
    }

    #[test]
    fn test_cycles_kept_when_allowed() {
        let engine = EngineConfig {
            reject_cycles: false,
            ..EngineConfig::default()
        };
        let mut diags = Diagnostics::new();
        let rules = compile_calc_rules(
            &[
                CalcRuleConfig::expression("a", "b + 1"),
                CalcRuleConfig::expression("b", "a + 1"),
            ],
            &engine,
            &mut diags,
        );
        assert_eq!(rules.len(), 2);
        assert!(diags.is_empty());
    }

    #[test]
    fn test_recompile_is_idempotent() {
        let configs = [
            CalcRuleConfig::expression("b", "a * 2").with_order(5.0),
            CalcRuleConfig::expression("a", "x + 1"),
        ];
        let (first, _) = compile(&configs);
        let (second, _) = compile(&configs);
        assert_eq!(first, second);
    }
}
