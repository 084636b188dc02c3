//! Per-field validation run before a save payload is built

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::types::{Row, RowKey, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    #[serde(alias = "fieldName")]
    pub field: String,
    /// Display name used in default messages
    #[serde(default, alias = "headerText", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub not_zero: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Replaces every default message of this rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledValidation {
    rule: ValidationRule,
    pattern: Option<Regex>,
}

impl CompiledValidation {
    pub fn field(&self) -> &str {
        &self.rule.field
    }

    fn label(&self) -> &str {
        self.rule.label.as_deref().unwrap_or(&self.rule.field)
    }

    fn message(&self, default: String) -> String {
        self.rule.message.clone().unwrap_or(default)
    }
}

/// Compile the patterns once; a rule with an invalid pattern keeps its other checks
pub fn compile_validation(rules: &[ValidationRule], diags: &mut Diagnostics) -> Vec<CompiledValidation> {
    rules
        .iter()
        .map(|rule| {
            let pattern = rule.pattern.as_deref().and_then(|source| {
                Regex::new(source)
                    .map_err(|e| {
                        diags.record(
                            DiagnosticKind::RuleConfig,
                            &rule.field,
                            format!("invalid pattern ignored: {}", e),
                        )
                    })
                    .ok()
            });
            CompiledValidation {
                rule: rule.clone(),
                pattern,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    pub table: String,
    pub row: RowKey,
    pub row_id: i64,
    pub field: String,
    pub message: String,
    pub value: Value,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} row {} ({}): {}",
            self.table, self.row_id, self.field, self.message
        )
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Text(s) => s.is_empty(),
        _ => false,
    }
}

/// Check one row; deleted rows always pass
pub fn validate_row(table: &str, row: &Row, rules: &[CompiledValidation]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if row.is_deleted() {
        return errors;
    }

    for rule in rules {
        let value = row.value(rule.field());
        let mut fail = |message: String| {
            errors.push(ValidationError {
                table: table.to_string(),
                row: row.key(),
                row_id: row.identity(),
                field: rule.field().to_string(),
                message,
                value: value.clone(),
            })
        };

        if is_blank(&value) {
            if rule.rule.required {
                fail(rule.message(format!("{} is required", rule.label())));
            }
            continue;
        }

        let number = value.as_number();
        if rule.rule.not_zero && number == Some(0.0) {
            fail(rule.message(format!("{} must not be zero", rule.label())));
        }
        if let (Some(min), Some(n)) = (rule.rule.min, number) {
            if n < min {
                fail(rule.message(format!("{} must not be less than {}", rule.label(), min)));
            }
        }
        if let (Some(max), Some(n)) = (rule.rule.max, number) {
            if n > max {
                fail(rule.message(format!("{} must not be greater than {}", rule.label(), max)));
            }
        }
        if let Some(pattern) = &rule.pattern {
            if !pattern.is_match(&value.as_text()) {
                fail(rule.message(format!("{} has an invalid format", rule.label())));
            }
        }
    }

    errors
}

pub fn validate_rows<'a>(
    table: &str,
    rows: impl IntoIterator<Item = &'a Row>,
    rules: &[CompiledValidation],
) -> Vec<ValidationError> {
    rows.into_iter()
        .flat_map(|row| validate_row(table, row, rules))
        .collect()
}
