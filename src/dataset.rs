use crate::config::EngineConfig;
use crate::page::PageConfig;
use crate::types::{Row, RowKey, Schema};
use serde::Serialize;
use std::collections::BTreeMap;

/// Structural facts about one detail tab
#[derive(Debug, Clone, PartialEq)]
pub struct TabLayout {
    pub key: String,
    pub table_code: String,
    pub fk_field: String,
    pub schema: Schema,
}

/// Structural facts about the whole page, resolved once per session
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub master_table: String,
    pub master_schema: Schema,
    pub tabs: Vec<TabLayout>,
}

impl Layout {
    pub fn from_page(page: &PageConfig, engine: &EngineConfig) -> Self {
        let tabs = page
            .tabs
            .iter()
            .map(|tab| TabLayout {
                key: tab.key.clone(),
                table_code: tab.table_code().to_string(),
                fk_field: tab
                    .fk_field
                    .clone()
                    .unwrap_or_else(|| engine.default_fk_field.clone()),
                schema: tab.schema.clone(),
            })
            .collect();

        Self {
            master_table: page.master_table.clone(),
            master_schema: page.master_schema.clone(),
            tabs,
        }
    }

    pub fn tab(&self, key: &str) -> Option<&TabLayout> {
        self.tabs.iter().find(|t| t.key == key)
    }
}

/// One master row and, once materialized, its detail rows per tab
#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    master: Row,
    /// `None` until the details have been loaded or created
    details: Option<BTreeMap<String, Vec<Row>>>,
}

impl Dataset {
    pub fn new(master: Row) -> Self {
        Self {
            master,
            details: None,
        }
    }

    pub fn master(&self) -> &Row {
        &self.master
    }

    pub(crate) fn master_mut(&mut self) -> &mut Row {
        &mut self.master
    }

    pub fn details_loaded(&self) -> bool {
        self.details.is_some()
    }

    pub fn details(&self) -> Option<&BTreeMap<String, Vec<Row>>> {
        self.details.as_ref()
    }

    pub(crate) fn details_mut(&mut self) -> Option<&mut BTreeMap<String, Vec<Row>>> {
        self.details.as_mut()
    }

    pub(crate) fn set_details(&mut self, details: BTreeMap<String, Vec<Row>>) {
        self.details = Some(details);
    }

    /// Rows of one tab; empty while details are not loaded
    pub fn rows(&self, tab: &str) -> &[Row] {
        self.details
            .as_ref()
            .and_then(|d| d.get(tab))
            .map_or(&[], Vec::as_slice)
    }

    pub fn detail(&self, tab: &str, key: RowKey) -> Option<&Row> {
        self.rows(tab).iter().find(|r| r.key() == key)
    }

    pub(crate) fn detail_mut(&mut self, tab: &str, key: RowKey) -> Option<&mut Row> {
        self.details
            .as_mut()?
            .get_mut(tab)?
            .iter_mut()
            .find(|r| r.key() == key)
    }

    pub fn has_dirty_details(&self) -> bool {
        self.details
            .iter()
            .flat_map(|d| d.values())
            .flatten()
            .any(Row::is_dirty)
    }

    /// The master or any materialized detail row is new, deleted or has dirty fields
    pub fn is_dirty(&self) -> bool {
        self.master.is_dirty() || self.has_dirty_details()
    }
}
