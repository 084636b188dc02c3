//! Dirty-field tracking
//!
//! Every field write goes through [`DirtyTracker::mark_change`], which keeps
//! each row's `_dirtyFields` map equal to the set of fields that currently
//! differ from their loaded value, tagged with who moved them.

use crate::types::{ChangeType, DirtyEntry, Row, Value};

#[derive(Debug, Clone, Copy)]
pub struct DirtyTracker {
    tolerance: f64,
}

impl DirtyTracker {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        a.approx_eq(b, self.tolerance)
    }

    /// Write `value` to `field` and update the row's dirty entry
    ///
    /// Returns whether the stored value changed.
    pub fn mark_change(&self, row: &mut Row, field: &str, value: Value, source: ChangeType) -> bool {
        let previous = row.value(field);
        let changed = !self.values_equal(&previous, &value);
        if !changed && row.dirty_entry(field).is_none() {
            return false;
        }

        let reverted = row
            .dirty_entry(field)
            .map(|entry| self.values_equal(&entry.original_value, &value));
        row.set_raw(field, value);

        let dirty = row.dirty_mut();
        match reverted {
            None => {
                dirty.insert(
                    field.to_string(),
                    DirtyEntry {
                        original_value: previous,
                        change_type: source,
                    },
                );
            }
            // Back to the loaded value; checked before any type update
            Some(true) => {
                dirty.remove(field);
            }
            Some(false) => {
                if source == ChangeType::User {
                    if let Some(entry) = dirty.get_mut(field) {
                        entry.change_type = ChangeType::User;
                    }
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Record, RowKey};

    fn loaded_row(fields: &[(&str, f64)]) -> Row {
        let record: Record = fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Number(*v)))
            .collect();
        Row::loaded(RowKey(1), record)
    }

    #[test]
    fn test_first_change_records_original() {
        let tracker = DirtyTracker::new(1e-4);
        let mut row = loaded_row(&[("price", 5.0)]);

        assert!(tracker.mark_change(&mut row, "price", Value::Number(6.0), ChangeType::User));
        let entry = row.dirty_entry("price").unwrap();
        assert_eq!(entry.original_value, Value::Number(5.0));
        assert_eq!(entry.change_type, ChangeType::User);
        assert_eq!(row.value("price"), Value::Number(6.0));
    }

    #[test]
    fn test_revert_removes_entry() {
        let tracker = DirtyTracker::new(1e-4);
        let mut row = loaded_row(&[("price", 5.0)]);

        tracker.mark_change(&mut row, "price", Value::Number(6.0), ChangeType::User);
        tracker.mark_change(&mut row, "price", Value::Number(5.00001), ChangeType::Calc);
        assert!(row.dirty_entry("price").is_none());
        assert!(!row.is_dirty());
    }

    #[test]
    fn test_calc_never_downgrades_user() {
        let tracker = DirtyTracker::new(1e-4);
        let mut row = loaded_row(&[("qty", 1.0)]);

        tracker.mark_change(&mut row, "qty", Value::Number(2.0), ChangeType::User);
        tracker.mark_change(&mut row, "qty", Value::Number(3.0), ChangeType::Calc);
        assert_eq!(row.dirty_entry("qty").unwrap().change_type, ChangeType::User);
    }

    #[test]
    fn test_user_upgrades_calc() {
        let tracker = DirtyTracker::new(1e-4);
        let mut row = loaded_row(&[("qty", 1.0)]);

        tracker.mark_change(&mut row, "qty", Value::Number(2.0), ChangeType::Calc);
        tracker.mark_change(&mut row, "qty", Value::Number(3.0), ChangeType::User);
        let entry = row.dirty_entry("qty").unwrap();
        assert_eq!(entry.change_type, ChangeType::User);
        assert_eq!(entry.original_value, Value::Number(1.0));
    }

    #[test]
    fn test_same_value_without_entry_is_noop() {
        let tracker = DirtyTracker::new(1e-4);
        let mut row = loaded_row(&[("qty", 1.0)]);

        assert!(!tracker.mark_change(&mut row, "qty", Value::Number(1.00001), ChangeType::User));
        assert!(row.dirty_fields().is_empty());
        assert_eq!(row.value("qty"), Value::Number(1.0));
    }

    #[test]
    fn test_absent_field_original_is_null() {
        let tracker = DirtyTracker::new(1e-4);
        let mut row = loaded_row(&[]);

        tracker.mark_change(&mut row, "note", Value::from("x"), ChangeType::User);
        assert_eq!(row.dirty_entry("note").unwrap().original_value, Value::Null);

        tracker.mark_change(&mut row, "note", Value::Null, ChangeType::User);
        assert!(row.dirty_entry("note").is_none());
    }
}
