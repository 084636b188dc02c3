//! Page configuration: the metadata that describes one master/detail surface
//!
//! Rule arrays are kept as raw JSON values here and read element by element
//! when the rule set is compiled, so one malformed entry never takes the
//! whole array down with it.

use crate::core::aggregate::Algorithm;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{CalcError, CalcResult};
use crate::types::Schema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::Path;

/// One formula rule for a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcRuleConfig {
    pub field: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Inferred from the expression when omitted
    #[serde(default, alias = "dependencies", skip_serializing_if = "Option::is_none")]
    pub trigger_fields: Option<Vec<String>>,

    /// Field whose current value selects one of `formulas`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula_field: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub formulas: BTreeMap<String, FormulaConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl CalcRuleConfig {
    pub fn expression(field: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            expression: Some(expression.into()),
            trigger_fields: None,
            formula_field: None,
            formulas: BTreeMap::new(),
            order: None,
            condition: None,
        }
    }

    pub fn with_triggers(mut self, fields: &[&str]) -> Self {
        self.trigger_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_order(mut self, order: f64) -> Self {
        self.order = Some(order);
        self
    }
}

/// A candidate formula of a discriminant rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormulaConfig {
    Expression(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        expression: String,
        #[serde(default, alias = "dependencies")]
        trigger_fields: Vec<String>,
    },
}

impl FormulaConfig {
    pub fn expression(&self) -> &str {
        match self {
            FormulaConfig::Expression(e) => e,
            FormulaConfig::Detailed { expression, .. } => expression,
        }
    }

    pub fn trigger_fields(&self) -> &[String] {
        match self {
            FormulaConfig::Expression(_) => &[],
            FormulaConfig::Detailed { trigger_fields, .. } => trigger_fields,
        }
    }
}

/// A master field computed from detail rows
///
/// Either a reduction (`sourceField` + `algorithm`) or, with `expression`
/// and no algorithm, a formula over the master and the other aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRuleConfig {
    pub target_field: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Tab key the rows come from; all tabs when absent
    #[serde(default, alias = "tab", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// One detail collection of the page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabConfig {
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Logical table the rows are saved to; falls back to `key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_field: Option<String>,

    #[serde(default)]
    pub schema: Schema,

    #[serde(default)]
    pub calc_rules: Json,

    #[serde(default)]
    pub validation: Json,
}

impl TabConfig {
    pub fn table_code(&self) -> &str {
        self.table_code.as_deref().unwrap_or(&self.key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageConfig {
    #[serde(default)]
    pub master_table: String,

    #[serde(default)]
    pub master_schema: Schema,

    #[serde(default)]
    pub master_calc_rules: Json,

    #[serde(default)]
    pub master_validation: Json,

    #[serde(default)]
    pub aggregates: Json,

    /// `field = expression` assignments run over the aggregate results
    /// before they are rounded
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub post_process: Json,

    /// Master fields injected into every detail row's scope
    #[serde(default)]
    pub broadcast: Json,

    #[serde(default)]
    pub tabs: Vec<TabConfig>,
}

impl PageConfig {
    pub fn from_json_str(content: &str) -> CalcResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_yaml_str(content: &str) -> CalcResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> CalcResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(CalcError::Parse(format!(
                "Unsupported page format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    pub fn tab(&self, key: &str) -> Option<&TabConfig> {
        self.tabs.iter().find(|t| t.key == key)
    }
}

/// Read a rule array that may arrive as a JSON value or as a JSON string
///
/// Elements that fail to deserialize are dropped one by one with a
/// diagnostic. Anything that is not an array yields no rules.
pub fn parse_rule_array<T: DeserializeOwned>(
    raw: &Json,
    label: &str,
    diags: &mut Diagnostics,
) -> Vec<T> {
    match raw {
        Json::Null => Vec::new(),
        Json::String(text) if text.trim().is_empty() => Vec::new(),
        Json::String(text) => match serde_json::from_str::<Json>(text) {
            Ok(parsed @ Json::Array(_)) => parse_rule_array(&parsed, label, diags),
            Ok(_) => {
                diags.record(DiagnosticKind::RuleConfig, label, "expected a JSON array");
                Vec::new()
            }
            Err(e) => {
                diags.record(
                    DiagnosticKind::RuleConfig,
                    label,
                    format!("invalid JSON: {}", e),
                );
                Vec::new()
            }
        },
        Json::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| match serde_json::from_value(item.clone()) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    diags.record(
                        DiagnosticKind::RuleConfig,
                        format!("{}[{}]", label, index),
                        e.to_string(),
                    );
                    None
                }
            })
            .collect(),
        _ => {
            diags.record(DiagnosticKind::RuleConfig, label, "expected an array");
            Vec::new()
        }
    }
}

/// Broadcast configuration: a string array, or an object carrying one under
/// `fields`, `broadcast` or `broadcastFields` (first match wins)
pub fn parse_broadcast_fields(raw: &Json) -> Vec<String> {
    match raw {
        Json::String(text) => serde_json::from_str::<Json>(text)
            .map(|parsed| parse_broadcast_fields(&parsed))
            .unwrap_or_default(),
        Json::Array(items) => {
            let mut fields: Vec<String> = Vec::new();
            for name in items.iter().filter_map(Json::as_str) {
                if !fields.iter().any(|f| f == name) {
                    fields.push(name.to_string());
                }
            }
            fields
        }
        Json::Object(map) => ["fields", "broadcast", "broadcastFields"]
            .iter()
            .find_map(|key| map.get(*key).filter(|v| v.is_array()))
            .map(parse_broadcast_fields)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rule_array_from_string() {
        let mut diags = Diagnostics::new();
        let raw = json!(r#"[{"field": "total", "expression": "a + b"}]"#);
        let rules: Vec<CalcRuleConfig> = parse_rule_array(&raw, "master", &mut diags);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].expression.as_deref(), Some("a + b"));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_parse_rule_array_drops_bad_elements() {
        let mut diags = Diagnostics::new();
        let raw = json!([
            {"field": "a", "expression": "1"},
            {"expression": "missing field"},
            {"field": "b", "expression": "2", "dependencies": ["a"]}
        ]);
        let rules: Vec<CalcRuleConfig> = parse_rule_array(&raw, "master", &mut diags);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].trigger_fields, Some(vec!["a".to_string()]));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags.entries()[0].subject, "master[1]");
    }

    #[test]
    fn test_parse_rule_array_non_array() {
        let mut diags = Diagnostics::new();
        let rules: Vec<CalcRuleConfig> = parse_rule_array(&json!({"a": 1}), "x", &mut diags);
        assert!(rules.is_empty());
        let rules: Vec<CalcRuleConfig> = parse_rule_array(&Json::Null, "x", &mut diags);
        assert!(rules.is_empty());
        let rules: Vec<CalcRuleConfig> = parse_rule_array(&json!("not json"), "x", &mut diags);
        assert!(rules.is_empty());
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn test_broadcast_shapes() {
        let expected = vec!["apexPl".to_string(), "yield".to_string()];
        assert_eq!(parse_broadcast_fields(&json!(["apexPl", "yield"])), expected);
        assert_eq!(
            parse_broadcast_fields(&json!({"fields": ["apexPl", "yield"]})),
            expected
        );
        assert_eq!(
            parse_broadcast_fields(&json!({"broadcast": ["apexPl", "yield"]})),
            expected
        );
        assert_eq!(
            parse_broadcast_fields(&json!({"broadcastFields": ["apexPl", "yield"]})),
            expected
        );
        assert_eq!(
            parse_broadcast_fields(&json!(r#"["apexPl","yield"]"#)),
            expected
        );
        assert!(parse_broadcast_fields(&json!({"other": ["x"]})).is_empty());
        assert!(parse_broadcast_fields(&json!(42)).is_empty());
    }

    #[test]
    fn test_formula_config_shapes() {
        let raw = json!({
            "field": "y",
            "formulaField": "mode",
            "formulas": {
                "A": "x",
                "B": {"expression": "x + 2", "triggerFields": ["x"]}
            }
        });
        let rule: CalcRuleConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(rule.formulas["A"].expression(), "x");
        assert_eq!(rule.formulas["B"].trigger_fields(), ["x".to_string()]);
    }

    #[test]
    fn test_page_from_yaml() {
        let yaml = r#"
masterTable: brew_batch
masterCalcRules:
  - field: batchQty
    expression: apexPl / yield
broadcast: [apexPl]
tabs:
  - key: materials
    tableCode: brew_material
    schema:
      perHl: number
"#;
        let page = PageConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(page.master_table, "brew_batch");
        assert_eq!(page.tabs[0].table_code(), "brew_material");
        assert!(page.master_calc_rules.is_array());
        assert_eq!(parse_broadcast_fields(&page.broadcast), vec!["apexPl"]);
    }
}
