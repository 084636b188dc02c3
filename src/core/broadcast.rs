//! Master -> detail broadcast
//!
//! Broadcast fields of the master are injected into the scope of every
//! detail row. Detail rules are selected by [`ExpressionMentions`], since
//! detail rules often read master fields without declaring them.

use super::cascade::{affected_by_any, apply_results, ExpressionMentions, RuleEvaluator};
use super::compiler::CompiledRule;
use super::dirty::DirtyTracker;
use crate::diagnostics::Diagnostics;
use crate::error::CalcResult;
use crate::types::{ChangeSet, Context, Record, Row, RowKey};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// Where detail rows come from when a master's details are first needed
#[async_trait]
pub trait DetailSource: Send + Sync {
    /// Detail records of `master`, keyed by tab key
    async fn load_details(&self, master: &Row) -> CalcResult<BTreeMap<String, Vec<Record>>>;
}

/// Detail rows held in memory, keyed by master id
#[derive(Debug, Clone, Default)]
pub struct MemoryDetailSource {
    by_master: HashMap<i64, BTreeMap<String, Vec<Record>>>,
}

impl MemoryDetailSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, master_id: i64, tab: impl Into<String>, records: Vec<Record>) {
        self.by_master
            .entry(master_id)
            .or_default()
            .insert(tab.into(), records);
    }
}

#[async_trait]
impl DetailSource for MemoryDetailSource {
    async fn load_details(&self, master: &Row) -> CalcResult<BTreeMap<String, Vec<Record>>> {
        Ok(master
            .id()
            .and_then(|id| self.by_master.get(&id))
            .cloned()
            .unwrap_or_default())
    }
}

/// Receives "these rows changed, redraw them" requests
pub trait RefreshSink: Send + Sync {
    fn refresh(&self, changes: &ChangeSet);
}

impl<F> RefreshSink for F
where
    F: Fn(&ChangeSet) + Send + Sync,
{
    fn refresh(&self, changes: &ChangeSet) {
        self(changes)
    }
}

/// Broadcast fields as read from the master row
pub fn broadcast_context(master: &Row, fields: &[String]) -> Context {
    fields
        .iter()
        .map(|field| (field.clone(), master.value(field)))
        .collect()
}

/// Detail rules that a change of any broadcast field reaches
pub fn broadcast_rules<'r>(fields: &[String], rules: &'r [CompiledRule]) -> Vec<&'r CompiledRule> {
    let seeds: Vec<&str> = fields.iter().map(String::as_str).collect();
    affected_by_any(&seeds, rules, &ExpressionMentions)
}

/// Run the broadcast cascade once per non-deleted row of one tab
///
/// Returns the changed fields per row, skipping rows where nothing changed.
pub fn broadcast_tab(
    rows: &mut [Row],
    context: &Context,
    rules: &[&CompiledRule],
    evaluator: &RuleEvaluator,
    tracker: &DirtyTracker,
    diags: &mut Diagnostics,
) -> Vec<(RowKey, Vec<String>)> {
    if rules.is_empty() {
        return Vec::new();
    }

    let mut changed = Vec::new();
    for row in rows.iter_mut().filter(|row| !row.is_deleted()) {
        let results = evaluator.evaluate(row, context, rules, diags);
        let fields = apply_results(row, &results, tracker);
        if !fields.is_empty() {
            changed.push((row.key(), fields));
        }
    }
    changed
}
