//! Save projection: dirty in-memory state -> minimal change payload
//!
//! Building a projection never mutates the dataset. Applying the result of a
//! successful save is a separate step ([`SaveReceipt`] consumed by the session).

use crate::dataset::{Dataset, Layout};
use crate::types::{ChangeType, Record, Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

impl RecordStatus {
    /// Deleted beats added beats modified
    pub fn of(row: &Row) -> Self {
        if row.is_deleted() {
            RecordStatus::Deleted
        } else if row.is_new() {
            RecordStatus::Added
        } else if !row.dirty_fields().is_empty() {
            RecordStatus::Modified
        } else {
            RecordStatus::Unchanged
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordItem {
    /// Persisted id; null for added rows, whose temporary id is in `data.id`
    pub id: Option<i64>,
    pub status: RecordStatus,
    pub data: Record,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<ChangeEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SavePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<RecordItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, Vec<RecordItem>>>,
}

impl SavePayload {
    pub fn is_empty(&self) -> bool {
        self.master.is_none() && self.details.is_none()
    }
}

fn is_internal(field: &str, fk_field: Option<&str>) -> bool {
    field.starts_with('_') || Some(field) == fk_field
}

/// Project one row; `fk_field` is excluded from data and changes
pub fn build_record_item(row: &Row, fk_field: Option<&str>) -> RecordItem {
    let status = RecordStatus::of(row);

    let data: Record = match status {
        RecordStatus::Added => {
            let mut data: Record = row
                .fields()
                .iter()
                .filter(|(field, _)| !is_internal(field, fk_field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            data.insert("id".to_string(), Value::from(row.identity()));
            data
        }
        RecordStatus::Modified => row
            .dirty_fields()
            .keys()
            .filter(|field| !is_internal(field, fk_field))
            .map(|field| (field.clone(), row.value(field)))
            .collect(),
        RecordStatus::Deleted | RecordStatus::Unchanged => Record::new(),
    };

    let changes: Vec<ChangeEntry> = match status {
        RecordStatus::Deleted => Vec::new(),
        _ => row
            .dirty_fields()
            .iter()
            .filter(|(field, _)| !is_internal(field, fk_field))
            .map(|(field, entry)| ChangeEntry {
                field: field.clone(),
                old_value: entry.original_value.clone(),
                new_value: row.value(field),
                change_type: entry.change_type,
            })
            .collect(),
    };

    RecordItem {
        id: if row.is_new() { None } else { row.id() },
        status,
        data,
        changes: (!changes.is_empty()).then_some(changes),
    }
}

/// Minimal payload for one dataset
///
/// Only new, deleted or dirty rows appear. A new row that was deleted again
/// never appears. When only detail rows changed the master is still named,
/// with status `unchanged` and identity only.
pub fn build_projection(dataset: &Dataset, layout: &Layout) -> SavePayload {
    let mut details: BTreeMap<String, Vec<RecordItem>> = BTreeMap::new();

    if let Some(by_tab) = dataset.details() {
        for tab in &layout.tabs {
            let Some(rows) = by_tab.get(&tab.key) else {
                continue;
            };
            let items: Vec<RecordItem> = rows
                .iter()
                .filter(|row| row.is_dirty() && !(row.is_new() && row.is_deleted()))
                .map(|row| build_record_item(row, Some(tab.fk_field.as_str())))
                .collect();
            if !items.is_empty() {
                details.entry(tab.table_code.clone()).or_default().extend(items);
            }
        }
    }

    let master_row = dataset.master();
    let master = if master_row.is_new() && master_row.is_deleted() {
        None
    } else if master_row.is_dirty() || !details.is_empty() {
        Some(build_record_item(master_row, None))
    } else {
        None
    };

    SavePayload {
        master,
        details: (!details.is_empty()).then_some(details),
    }
}

/// What the persistence layer reports back after a successful save
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    /// Real id of the master when it was new
    #[serde(default)]
    pub master_id: Option<i64>,
    /// Temporary id -> real id for every added detail row
    #[serde(default)]
    pub id_mapping: HashMap<i64, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::DirtyTracker;
    use crate::page::{PageConfig, TabConfig};
    use crate::types::RowKey;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(fields: serde_json::Value) -> Record {
        serde_json::from_value(fields).unwrap()
    }

    fn layout() -> Layout {
        let page = PageConfig {
            tabs: vec![
                TabConfig {
                    key: "yl".to_string(),
                    table_code: Some("brew_yl".to_string()),
                    ..TabConfig::default()
                },
                TabConfig {
                    key: "fl".to_string(),
                    ..TabConfig::default()
                },
            ],
            ..PageConfig::default()
        };
        Layout::from_page(&page, &EngineConfig::default())
    }

    #[test]
    fn test_added_row_carries_temp_id_and_skips_fk() {
        let row = Row::new(RowKey(3), record(json!({"masterId": 1, "qty": 2, "_uiState": "x"})));
        let item = build_record_item(&row, Some("masterId"));
        assert_eq!(item.status, RecordStatus::Added);
        assert_eq!(item.id, None);
        assert_eq!(item.data, record(json!({"id": -3, "qty": 2})));
        assert_eq!(item.changes, None);
    }

    #[test]
    fn test_modified_row_carries_only_dirty_fields() {
        let tracker = DirtyTracker::new(1e-4);
        let mut row = Row::loaded(RowKey(1), record(json!({"id": 5, "a": 1, "b": 2, "masterId": 9})));
        tracker.mark_change(&mut row, "b", Value::from(3.0), ChangeType::User);
        tracker.mark_change(&mut row, "masterId", Value::from(10.0), ChangeType::Calc);

        let item = build_record_item(&row, Some("masterId"));
        assert_eq!(item.status, RecordStatus::Modified);
        assert_eq!(item.id, Some(5));
        assert_eq!(item.data, record(json!({"b": 3})));
        assert_eq!(
            item.changes,
            Some(vec![ChangeEntry {
                field: "b".to_string(),
                old_value: Value::from(2.0),
                new_value: Value::from(3.0),
                change_type: ChangeType::User,
            }])
        );
    }

    #[test]
    fn test_deleted_row_is_identity_only() {
        let tracker = DirtyTracker::new(1e-4);
        let mut row = Row::loaded(RowKey(1), record(json!({"id": 5, "a": 1})));
        tracker.mark_change(&mut row, "a", Value::from(2.0), ChangeType::User);
        row.mark_deleted();

        let item = build_record_item(&row, None);
        assert_eq!(item.status, RecordStatus::Deleted);
        assert_eq!(item.id, Some(5));
        assert!(item.data.is_empty());
        assert_eq!(item.changes, None);
    }

    #[test]
    fn test_projection_groups_by_table_code() {
        let mut dataset = Dataset::new(Row::loaded(RowKey(1), record(json!({"id": 1}))));
        let mut details = BTreeMap::new();
        details.insert(
            "yl".to_string(),
            vec![
                Row::new(RowKey(2), record(json!({"qty": 1}))),
                Row::loaded(RowKey(3), record(json!({"id": 30, "qty": 1}))),
            ],
        );
        details.insert("fl".to_string(), vec![Row::new(RowKey(4), Record::new())]);
        dataset.set_details(details);

        let payload = build_projection(&dataset, &layout());
        let master = payload.master.unwrap();
        assert_eq!(master.status, RecordStatus::Unchanged);
        assert_eq!(master.id, Some(1));
        assert!(master.data.is_empty());

        let details = payload.details.unwrap();
        assert_eq!(details.keys().collect::<Vec<_>>(), vec!["brew_yl", "fl"]);
        assert_eq!(details["brew_yl"].len(), 1);
        assert_eq!(details["brew_yl"][0].data["id"], Value::from(-2.0));
    }

    #[test]
    fn test_clean_dataset_projects_nothing() {
        let dataset = Dataset::new(Row::loaded(RowKey(1), record(json!({"id": 1, "a": 1}))));
        let payload = build_projection(&dataset, &layout());
        assert!(payload.is_empty());
        assert_eq!(serde_json::to_string(&payload).unwrap(), "{}");
    }

    #[test]
    fn test_new_then_deleted_row_is_absent() {
        let mut dataset = Dataset::new(Row::loaded(RowKey(1), record(json!({"id": 1}))));
        let mut row = Row::new(RowKey(2), Record::new());
        row.mark_deleted();
        let mut details = BTreeMap::new();
        details.insert("yl".to_string(), vec![row]);
        dataset.set_details(details);

        assert!(build_projection(&dataset, &layout()).is_empty());
    }
}
