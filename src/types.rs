use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Raw field map of a record as it arrives from a data source
pub type Record = BTreeMap<String, Value>;

/// Values injected into a detail row's evaluation scope (broadcast fields)
pub type Context = BTreeMap<String, Value>;

//==============================================================================
// Field values
//==============================================================================

/// A single field value
///
/// Deserialization is shape-based: ISO date strings arrive as `Text` and are
/// only promoted to `Date` by a [`Schema`] that declares the field as a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    /// Try to convert to f64
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Null | Value::Date(_) => None,
        }
    }

    /// Numeric coercion used by aggregation: anything non-numeric counts as 0
    pub fn coerce_number(&self) -> f64 {
        match self.as_number() {
            Some(n) if n.is_finite() => n,
            _ => 0.0,
        }
    }

    /// Convert to display text
    pub fn as_text(&self) -> String {
        match self {
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Text(s) => s.clone(),
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Null => String::new(),
        }
    }

    /// Try to convert to boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0),
            Value::Text(s) => match s.trim().to_uppercase().as_str() {
                "TRUE" | "1" => Some(true),
                "FALSE" | "0" | "" => Some(false),
                _ => None,
            },
            Value::Null => Some(false),
            Value::Date(_) => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        self.as_bool().unwrap_or(true)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The kind this value naturally has, if any
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(FieldKind::Bool),
            Value::Number(_) => Some(FieldKind::Number),
            Value::Text(_) => Some(FieldKind::Text),
            Value::Date(_) => Some(FieldKind::Date),
        }
    }

    /// Equality where numbers compare within an absolute tolerance
    pub fn approx_eq(&self, other: &Value, tolerance: f64) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => (a - b).abs() <= tolerance,
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            other => write!(f, "{}", other.as_text()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

//==============================================================================
// Typed field registry
//==============================================================================

/// Declared kind of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Number,
    #[serde(alias = "string")]
    Text,
    Date,
    #[serde(alias = "boolean")]
    Bool,
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Number => "number",
            FieldKind::Text => "text",
            FieldKind::Date => "date",
            FieldKind::Bool => "bool",
        }
    }
}

/// Field name -> kind for one table
///
/// Rows are coerced against their table's schema when they are constructed.
/// Fields the schema does not declare pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: BTreeMap<String, FieldKind>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    pub fn kind_of(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Coerce one value to the declared kind of `field`
    pub fn coerce(&self, field: &str, value: Value) -> Result<Value, String> {
        let Some(kind) = self.kind_of(field) else {
            return Ok(value);
        };

        let mismatch = |value: &Value| {
            format!(
                "field '{}' expects {} but got '{}'",
                field,
                kind.type_name(),
                value
            )
        };

        match (kind, value) {
            (_, Value::Null) => Ok(Value::Null),

            (FieldKind::Number, Value::Number(n)) => Ok(Value::Number(n)),
            (FieldKind::Number, Value::Text(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(Value::Null);
                }
                trimmed
                    .parse::<f64>()
                    .map(Value::Number)
                    .map_err(|_| mismatch(&Value::Text(s.clone())))
            }
            (FieldKind::Number, other) => Err(mismatch(&other)),

            (FieldKind::Text, Value::Text(s)) => Ok(Value::Text(s)),
            (FieldKind::Text, other) => Ok(Value::Text(other.as_text())),

            (FieldKind::Date, Value::Date(d)) => Ok(Value::Date(d)),
            (FieldKind::Date, Value::Text(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(Value::Null);
                }
                // Accept full timestamps by keeping only the date part
                let date_part = trimmed.get(..10).unwrap_or(trimmed);
                NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                    .map(Value::Date)
                    .map_err(|_| mismatch(&Value::Text(s.clone())))
            }
            (FieldKind::Date, other) => Err(mismatch(&other)),

            (FieldKind::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldKind::Bool, Value::Number(n)) if n == 0.0 || n == 1.0 => {
                Ok(Value::Bool(n == 1.0))
            }
            (FieldKind::Bool, Value::Text(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&Value::Text(s.clone()))),
            },
            (FieldKind::Bool, other) => Err(mismatch(&other)),
        }
    }

    /// Coerce every field of a record, failing on the first mismatch
    pub fn coerce_record(&self, record: Record) -> Result<Record, String> {
        record
            .into_iter()
            .map(|(field, value)| {
                let coerced = self.coerce(&field, value)?;
                Ok((field, coerced))
            })
            .collect()
    }
}

//==============================================================================
// Rows
//==============================================================================

/// Session-local row handle, never reused within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(pub u64);

impl RowKey {
    /// Negative placeholder id used for rows that have not been persisted yet
    pub fn temp_id(self) -> i64 {
        -(self.0 as i64)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who caused a field to move away from its original value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    User,
    Calc,
}

/// Bookkeeping for one field that differs from its original value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyEntry {
    pub original_value: Value,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
}

/// One master or detail record plus its change-tracking state
///
/// Field values can only be changed through [`crate::core::DirtyTracker`],
/// so the dirty map always reflects the difference from the loaded snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Row {
    #[serde(skip)]
    key: RowKey,
    id: Option<i64>,
    #[serde(flatten)]
    fields: Record,
    #[serde(rename = "_isNew")]
    is_new: bool,
    #[serde(rename = "_isDeleted")]
    is_deleted: bool,
    #[serde(rename = "_dirtyFields", skip_serializing_if = "BTreeMap::is_empty")]
    dirty: BTreeMap<String, DirtyEntry>,
}

impl Row {
    /// A row that has not been persisted yet
    pub fn new(key: RowKey, fields: Record) -> Self {
        Self {
            key,
            id: None,
            fields: strip_reserved(fields),
            is_new: true,
            is_deleted: false,
            dirty: BTreeMap::new(),
        }
    }

    /// A row loaded from a data source snapshot; its current values are the originals
    pub fn loaded(key: RowKey, mut fields: Record) -> Self {
        let id = fields.remove("id").and_then(|v| v.as_number()).map(|n| n as i64);
        Self {
            key,
            id,
            fields: strip_reserved(fields),
            is_new: false,
            is_deleted: false,
            dirty: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> RowKey {
        self.key
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// Persisted id, or the temporary id while the row is new
    pub fn identity(&self) -> i64 {
        self.id.unwrap_or_else(|| self.key.temp_id())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Current value of `field`, `Null` when absent
    pub fn value(&self, field: &str) -> Value {
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    pub fn fields(&self) -> &Record {
        &self.fields
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn dirty_fields(&self) -> &BTreeMap<String, DirtyEntry> {
        &self.dirty
    }

    pub fn dirty_entry(&self, field: &str) -> Option<&DirtyEntry> {
        self.dirty.get(field)
    }

    /// New, deleted, or carrying at least one dirty field
    pub fn is_dirty(&self) -> bool {
        self.is_new || self.is_deleted || !self.dirty.is_empty()
    }

    pub(crate) fn set_raw(&mut self, field: &str, value: Value) -> Value {
        self.fields
            .insert(field.to_string(), value)
            .unwrap_or(Value::Null)
    }

    pub(crate) fn dirty_mut(&mut self) -> &mut BTreeMap<String, DirtyEntry> {
        &mut self.dirty
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.is_deleted = true;
    }

    pub(crate) fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    /// Forget all change-tracking state once the row is durably persisted
    pub(crate) fn mark_persisted(&mut self) {
        self.is_new = false;
        self.is_deleted = false;
        self.dirty.clear();
    }
}

/// Drop the reserved `_`-prefixed keys and `id` from an incoming record
fn strip_reserved(mut fields: Record) -> Record {
    fields.retain(|key, _| !key.starts_with('_') && key != "id");
    fields
}

//==============================================================================
// Change notifications
//==============================================================================

/// Where a changed row lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RowRef {
    Master {
        master: RowKey,
    },
    Detail {
        master: RowKey,
        tab: String,
        row: RowKey,
    },
}

/// Fields changed on one row during a trigger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowChange {
    pub row: RowRef,
    pub fields: Vec<String>,
}

/// "Fields changed" notifications produced by one trigger, in the order they happened
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub rows: Vec<RowChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, row: RowRef, fields: Vec<String>) {
        if fields.is_empty() {
            return;
        }
        if let Some(existing) = self.rows.iter_mut().find(|c| c.row == row) {
            for field in fields {
                if !existing.fields.contains(&field) {
                    existing.fields.push(field);
                }
            }
        } else {
            self.rows.push(RowChange { row, fields });
        }
    }

    pub fn merge(&mut self, other: ChangeSet) {
        for change in other.rows {
            self.record(change.row, change.fields);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn fields_for(&self, row: &RowRef) -> &[String] {
        self.rows
            .iter()
            .find(|c| &c.row == row)
            .map_or(&[], |c| c.fields.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_coerces_declared_fields() {
        let schema = Schema::new()
            .with_field("qty", FieldKind::Number)
            .with_field("due", FieldKind::Date)
            .with_field("active", FieldKind::Bool);

        assert_eq!(
            schema.coerce("qty", Value::from(" 12.5 ")),
            Ok(Value::Number(12.5))
        );
        assert_eq!(
            schema.coerce("due", Value::from("2025-03-01T00:00:00")),
            Ok(Value::Date(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()))
        );
        assert_eq!(schema.coerce("active", Value::from(1.0)), Ok(Value::Bool(true)));
        assert_eq!(schema.coerce("qty", Value::Null), Ok(Value::Null));
        assert_eq!(schema.coerce("free", Value::from("x")), Ok(Value::from("x")));
    }

    #[test]
    fn test_schema_rejects_mismatch() {
        let schema = Schema::new().with_field("qty", FieldKind::Number);
        let err = schema.coerce("qty", Value::from("abc")).unwrap_err();
        assert!(err.contains("qty"));
        assert!(err.contains("number"));
    }

    #[test]
    fn test_loaded_row_strips_reserved_fields() {
        let mut record = Record::new();
        record.insert("id".to_string(), Value::from(7.0));
        record.insert("_isNew".to_string(), Value::from(true));
        record.insert("price".to_string(), Value::from(5.0));

        let row = Row::loaded(RowKey(1), record);
        assert_eq!(row.id(), Some(7));
        assert!(!row.is_new());
        assert!(row.get("_isNew").is_none());
        assert!(row.get("id").is_none());
        assert_eq!(row.value("price"), Value::Number(5.0));
        assert_eq!(row.value("missing"), Value::Null);
    }

    #[test]
    fn test_new_row_identity_is_temporary() {
        let row = Row::new(RowKey(42), Record::new());
        assert!(row.is_new());
        assert!(row.is_dirty());
        assert_eq!(row.identity(), -42);
    }

    #[test]
    fn test_value_deserializes_by_shape() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, true, 3, 2.5, "2025-01-01"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Number(3.0),
                Value::Number(2.5),
                Value::Text("2025-01-01".to_string()),
            ]
        );
    }

    #[test]
    fn test_change_set_merges_same_row() {
        let mut changes = ChangeSet::new();
        let master = RowRef::Master { master: RowKey(1) };
        changes.record(master.clone(), vec!["a".to_string()]);
        changes.record(master.clone(), vec!["a".to_string(), "b".to_string()]);
        changes.record(master.clone(), vec![]);

        assert_eq!(changes.rows.len(), 1);
        assert_eq!(changes.fields_for(&master), ["a", "b"]);
    }
}
