//! A calculation session: the datasets of one page plus the compiled rules
//! and collaborators that act on them
//!
//! Every trigger runs to completion before the next one starts; the async
//! triggers hold `&mut Session` across the detail fetch, so two triggers can
//! never interleave. Pass order is fixed: same-row rules, broadcast,
//! aggregation, master re-evaluation.

use crate::config::EngineConfig;
use crate::core::aggregate::Aggregator;
use crate::core::broadcast::{
    broadcast_context, broadcast_rules, broadcast_tab, DetailSource, RefreshSink,
};
use crate::core::cascade::{affected_by_any, affected_rules, apply_results, DeclaredDependencies, RuleEvaluator};
use crate::core::compiler::{CompiledRule, RuleSet};
use crate::core::dirty::DirtyTracker;
use crate::dataset::{Dataset, Layout};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::{CalcError, CalcResult};
use crate::page::PageConfig;
use crate::projection::{build_projection, SavePayload, SaveReceipt};
use crate::types::{ChangeSet, ChangeType, Context, Record, Row, RowKey, RowRef, Schema, Value};
use crate::validation::{validate_row, validate_rows, ValidationError};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct Session {
    layout: Layout,
    rules: RuleSet,
    datasets: BTreeMap<RowKey, Dataset>,
    tracker: DirtyTracker,
    evaluator: RuleEvaluator,
    aggregator: Aggregator,
    detail_source: Option<Box<dyn DetailSource>>,
    refresh_sink: Option<Box<dyn RefreshSink>>,
    diagnostics: Diagnostics,
    next_key: u64,
}

fn allocate_key(next_key: &mut u64) -> RowKey {
    *next_key += 1;
    RowKey(*next_key)
}

/// Coerce a record against its schema; a mismatch rejects the row with a diagnostic
fn coerce_row_record(
    schema: &Schema,
    table: &str,
    record: Record,
    diags: &mut Diagnostics,
) -> CalcResult<Record> {
    schema.coerce_record(record).map_err(|message| {
        diags.record(DiagnosticKind::Schema, table, format!("row rejected: {}", message));
        CalcError::Schema(message)
    })
}

impl Session {
    pub fn new(page: &PageConfig, engine: EngineConfig) -> Self {
        let mut diagnostics = Diagnostics::new();
        let rules = RuleSet::compile(page, &engine, &mut diagnostics);
        let layout = Layout::from_page(page, &engine);

        info!(
            master_table = %layout.master_table,
            tabs = layout.tabs.len(),
            master_rules = rules.master_calc.len(),
            aggregates = rules.aggregates.len(),
            "calculation session ready"
        );

        Self {
            layout,
            rules,
            datasets: BTreeMap::new(),
            tracker: DirtyTracker::new(engine.tolerance),
            evaluator: RuleEvaluator::new(engine.precision),
            aggregator: Aggregator::new(engine.precision),
            detail_source: None,
            refresh_sink: None,
            diagnostics,
            next_key: 0,
        }
    }

    pub fn with_detail_source(mut self, source: impl DetailSource + 'static) -> Self {
        self.detail_source = Some(Box::new(source));
        self
    }

    pub fn with_refresh_sink(mut self, sink: impl RefreshSink + 'static) -> Self {
        self.refresh_sink = Some(Box::new(sink));
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diagnostics.entries()
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.take()
    }

    pub fn dataset(&self, master: RowKey) -> Option<&Dataset> {
        self.datasets.get(&master)
    }

    pub fn datasets(&self) -> impl Iterator<Item = (RowKey, &Dataset)> {
        self.datasets.iter().map(|(key, dataset)| (*key, dataset))
    }

    pub fn find_master_by_id(&self, id: i64) -> Option<RowKey> {
        self.datasets
            .iter()
            .find(|(_, dataset)| dataset.master().identity() == id)
            .map(|(key, _)| *key)
    }

    pub fn find_detail_by_id(&self, master: RowKey, tab: &str, id: i64) -> Option<RowKey> {
        self.datasets
            .get(&master)?
            .rows(tab)
            .iter()
            .find(|row| row.identity() == id)
            .map(Row::key)
    }

    fn dataset_mut(&mut self, master: RowKey) -> CalcResult<&mut Dataset> {
        self.datasets
            .get_mut(&master)
            .ok_or(CalcError::UnknownRow(master))
    }

    //==========================================================================
    // Loading and structural edits
    //==========================================================================

    /// Add a persisted master row; its details load lazily
    pub fn load_master(&mut self, record: Record) -> CalcResult<RowKey> {
        let record = coerce_row_record(
            &self.layout.master_schema,
            &self.layout.master_table,
            record,
            &mut self.diagnostics,
        )?;
        let key = allocate_key(&mut self.next_key);
        self.datasets.insert(key, Dataset::new(Row::loaded(key, record)));
        Ok(key)
    }

    /// Materialize the detail rows of `master` from raw records keyed by tab
    ///
    /// Rows that do not match their tab's schema are dropped with a diagnostic.
    pub fn load_details(
        &mut self,
        master: RowKey,
        records: BTreeMap<String, Vec<Record>>,
    ) -> CalcResult<()> {
        let Self {
            layout,
            datasets,
            diagnostics,
            next_key,
            ..
        } = self;
        let dataset = datasets.get_mut(&master).ok_or(CalcError::UnknownRow(master))?;

        let mut details: BTreeMap<String, Vec<Row>> = layout
            .tabs
            .iter()
            .map(|tab| (tab.key.clone(), Vec::new()))
            .collect();

        for (tab_key, tab_records) in records {
            let Some(tab) = layout.tab(&tab_key) else {
                diagnostics.record(
                    DiagnosticKind::DetailFetch,
                    &tab_key,
                    "rows for an unknown tab ignored",
                );
                continue;
            };
            let rows = details.entry(tab_key.clone()).or_default();
            for record in tab_records {
                if let Ok(record) = coerce_row_record(&tab.schema, &tab.table_code, record, diagnostics) {
                    rows.push(Row::loaded(allocate_key(next_key), record));
                }
            }
        }

        debug!(%master, rows = details.values().map(Vec::len).sum::<usize>(), "details materialized");
        dataset.set_details(details);
        Ok(())
    }

    /// Make sure the details of `master` are materialized
    ///
    /// Returns `false` when the detail source failed; the failure is recorded
    /// and the caller skips this master for the current pass.
    pub async fn ensure_details(&mut self, master: RowKey) -> CalcResult<bool> {
        let dataset = self.datasets.get(&master).ok_or(CalcError::UnknownRow(master))?;
        if dataset.details_loaded() {
            return Ok(true);
        }

        let fetched = match &self.detail_source {
            Some(source) => source.load_details(dataset.master()).await,
            None => Ok(BTreeMap::new()),
        };

        match fetched {
            Ok(records) => {
                self.load_details(master, records)?;
                Ok(true)
            }
            Err(e) => {
                self.diagnostics.record(
                    DiagnosticKind::DetailFetch,
                    master.to_string(),
                    format!("detail fetch failed: {}", e),
                );
                Ok(false)
            }
        }
    }

    /// Create a new master row with an empty detail set and compute its fields
    pub fn add_master(&mut self, record: Record) -> CalcResult<RowKey> {
        let record = coerce_row_record(
            &self.layout.master_schema,
            &self.layout.master_table,
            record,
            &mut self.diagnostics,
        )?;
        let key = allocate_key(&mut self.next_key);
        let mut row = Row::new(key, record);

        let all: Vec<&CompiledRule> = self.rules.master_calc.iter().collect();
        let results = self
            .evaluator
            .evaluate(&row, &Context::new(), &all, &mut self.diagnostics);
        apply_results(&mut row, &results, &self.tracker);

        let mut dataset = Dataset::new(row);
        dataset.set_details(
            self.layout
                .tabs
                .iter()
                .map(|tab| (tab.key.clone(), Vec::new()))
                .collect(),
        );
        self.datasets.insert(key, dataset);
        Ok(key)
    }

    /// Append a new detail row, link it to the master and compute its fields
    pub fn add_detail_row(&mut self, master: RowKey, tab: &str, record: Record) -> CalcResult<RowKey> {
        let Self {
            layout,
            rules,
            datasets,
            tracker,
            evaluator,
            diagnostics,
            next_key,
            ..
        } = self;
        let tab_layout = layout
            .tab(tab)
            .ok_or_else(|| CalcError::UnknownTab(tab.to_string()))?;
        let mut record = coerce_row_record(&tab_layout.schema, &tab_layout.table_code, record, diagnostics)?;

        let dataset = datasets.get_mut(&master).ok_or(CalcError::UnknownRow(master))?;
        if !dataset.details_loaded() {
            return Err(CalcError::DetailsUnavailable(format!(
                "details of master {} are not loaded",
                master
            )));
        }
        record.insert(
            tab_layout.fk_field.clone(),
            Value::from(dataset.master().identity()),
        );

        let key = allocate_key(next_key);
        let mut row = Row::new(key, record);
        let context = broadcast_context(dataset.master(), &rules.broadcast_fields);
        let all: Vec<&CompiledRule> = rules.detail_rules(tab).iter().collect();
        let results = evaluator.evaluate(&row, &context, &all, diagnostics);
        apply_results(&mut row, &results, tracker);

        if let Some(details) = dataset.details_mut() {
            details.entry(tab.to_string()).or_default().push(row);
        }

        self.aggregate(master)?;
        Ok(key)
    }

    /// Mark a detail row deleted (or drop it outright if it was never saved), then re-aggregate
    pub fn delete_detail_row(&mut self, master: RowKey, tab: &str, row: RowKey) -> CalcResult<ChangeSet> {
        let dataset = self.dataset_mut(master)?;
        let rows = dataset
            .details_mut()
            .and_then(|details| details.get_mut(tab))
            .ok_or_else(|| CalcError::UnknownTab(tab.to_string()))?;
        let index = rows
            .iter()
            .position(|r| r.key() == row)
            .ok_or(CalcError::UnknownRow(row))?;

        if rows[index].is_new() {
            rows.remove(index);
        } else {
            rows[index].mark_deleted();
        }

        self.aggregate(master)
    }

    /// Mark a master deleted, or forget it entirely if it was never saved
    pub fn delete_master(&mut self, master: RowKey) -> CalcResult<()> {
        let dataset = self.dataset_mut(master)?;
        if dataset.master().is_new() {
            self.datasets.remove(&master);
        } else {
            dataset.master_mut().mark_deleted();
        }
        Ok(())
    }

    //==========================================================================
    // Triggers
    //==========================================================================

    /// User edit of a detail field: same-row cascade, then aggregation
    pub fn edit_detail_field(
        &mut self,
        master: RowKey,
        tab: &str,
        row: RowKey,
        field: &str,
        value: impl Into<Value>,
    ) -> CalcResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        {
            let Self {
                layout,
                rules,
                datasets,
                tracker,
                evaluator,
                diagnostics,
                ..
            } = self;
            let tab_layout = layout
                .tab(tab)
                .ok_or_else(|| CalcError::UnknownTab(tab.to_string()))?;
            let value = tab_layout
                .schema
                .coerce(field, value.into())
                .map_err(CalcError::Schema)?;

            let dataset = datasets.get_mut(&master).ok_or(CalcError::UnknownRow(master))?;
            let context = broadcast_context(dataset.master(), &rules.broadcast_fields);
            let target = dataset
                .detail_mut(tab, row)
                .ok_or(CalcError::UnknownRow(row))?;
            if target.is_deleted() || !tracker.mark_change(target, field, value, ChangeType::User) {
                return Ok(changes);
            }

            let affected = affected_rules(field, rules.detail_rules(tab), &DeclaredDependencies);
            let results = evaluator.evaluate(target, &context, &affected, diagnostics);
            let mut changed = vec![field.to_string()];
            changed.extend(apply_results(target, &results, tracker));

            debug!(%master, tab, %row, field, rules = affected.len(), "detail edit cascaded");
            changes.record(
                RowRef::Detail {
                    master,
                    tab: tab.to_string(),
                    row,
                },
                changed,
            );
        }

        changes.merge(self.aggregate(master)?);
        Ok(changes)
    }

    /// User edit of a master field: same-row cascade, then a broadcast when a
    /// broadcast field changed
    ///
    /// Details are fetched before any computation when the edit can reach a
    /// broadcast field.
    pub async fn edit_master_field(
        &mut self,
        master: RowKey,
        field: &str,
        value: impl Into<Value>,
    ) -> CalcResult<ChangeSet> {
        let value = self
            .layout
            .master_schema
            .coerce(field, value.into())
            .map_err(CalcError::Schema)?;
        if !self.datasets.contains_key(&master) {
            return Err(CalcError::UnknownRow(master));
        }

        let reaches_broadcast = self.rules.is_broadcast_field(field)
            || affected_rules(field, &self.rules.master_calc, &DeclaredDependencies)
                .iter()
                .any(|rule| self.rules.is_broadcast_field(&rule.field));
        let details_ready = if reaches_broadcast {
            self.ensure_details(master).await?
        } else {
            false
        };

        let mut changes = ChangeSet::new();
        let changed = {
            let Self {
                rules,
                datasets,
                tracker,
                evaluator,
                diagnostics,
                ..
            } = self;
            let row = datasets
                .get_mut(&master)
                .ok_or(CalcError::UnknownRow(master))?
                .master_mut();
            if !tracker.mark_change(row, field, value, ChangeType::User) {
                return Ok(changes);
            }

            let affected = affected_rules(field, &rules.master_calc, &DeclaredDependencies);
            let results = evaluator.evaluate(row, &Context::new(), &affected, diagnostics);
            let mut changed = vec![field.to_string()];
            for computed in apply_results(row, &results, tracker) {
                if !changed.contains(&computed) {
                    changed.push(computed);
                }
            }
            changed
        };

        let broadcast_needed = changed.iter().any(|f| self.rules.is_broadcast_field(f));
        changes.record(RowRef::Master { master }, changed);

        if broadcast_needed && details_ready {
            changes.merge(self.broadcast_materialized(master)?);
        }
        Ok(changes)
    }

    /// Push the master's broadcast fields into every detail row, then aggregate
    /// and ask the refresh sink to redraw what changed
    pub async fn broadcast(&mut self, master: RowKey) -> CalcResult<ChangeSet> {
        if !self.ensure_details(master).await? {
            return Ok(ChangeSet::new());
        }
        self.broadcast_materialized(master)
    }

    fn broadcast_materialized(&mut self, master: RowKey) -> CalcResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        {
            let Self {
                rules,
                datasets,
                tracker,
                evaluator,
                diagnostics,
                ..
            } = self;
            let dataset = datasets.get_mut(&master).ok_or(CalcError::UnknownRow(master))?;
            let context = broadcast_context(dataset.master(), &rules.broadcast_fields);
            let Some(details) = dataset.details_mut() else {
                return Ok(changes);
            };

            for (tab, rows) in details.iter_mut() {
                let selected = broadcast_rules(&rules.broadcast_fields, rules.detail_rules(tab));
                let changed = broadcast_tab(rows, &context, &selected, evaluator, tracker, diagnostics);
                for (row, fields) in changed {
                    changes.record(
                        RowRef::Detail {
                            master,
                            tab: tab.clone(),
                            row,
                        },
                        fields,
                    );
                }
            }
        }

        changes.merge(self.aggregate(master)?);

        if !changes.is_empty() {
            if let Some(sink) = &self.refresh_sink {
                sink.refresh(&changes);
            }
        }
        Ok(changes)
    }

    /// Recompute the master's aggregate fields from its materialized details,
    /// then re-run the master rules that depend on them
    ///
    /// Does nothing while the details are not loaded.
    pub fn aggregate(&mut self, master: RowKey) -> CalcResult<ChangeSet> {
        let Self {
            rules,
            datasets,
            tracker,
            evaluator,
            aggregator,
            diagnostics,
            ..
        } = self;
        let mut changes = ChangeSet::new();
        if rules.aggregates.is_empty() {
            return Ok(changes);
        }

        let dataset = datasets.get_mut(&master).ok_or(CalcError::UnknownRow(master))?;
        let Some(details) = dataset.details() else {
            return Ok(changes);
        };
        let results = aggregator.aggregate(
            details,
            &rules.aggregates,
            &rules.post_process,
            dataset.master(),
            diagnostics,
        );
        let mut changed = apply_results(dataset.master_mut(), &results, tracker);

        // Second pass over the master rules that read aggregated fields
        let targets = rules.aggregated_fields();
        let seeds: Vec<&str> = targets.iter().map(String::as_str).collect();
        let dependents = affected_by_any(&seeds, &rules.master_calc, &DeclaredDependencies);
        if !dependents.is_empty() {
            let results = evaluator.evaluate(dataset.master(), &Context::new(), &dependents, diagnostics);
            for computed in apply_results(dataset.master_mut(), &results, tracker) {
                if !changed.contains(&computed) {
                    changed.push(computed);
                }
            }
        }

        changes.record(RowRef::Master { master }, changed);
        Ok(changes)
    }

    /// Full pass over one master: every master rule, every rule of every
    /// materialized detail row, then aggregation
    pub fn recalculate(&mut self, master: RowKey) -> CalcResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        {
            let Self {
                rules,
                datasets,
                tracker,
                evaluator,
                diagnostics,
                ..
            } = self;
            let dataset = datasets.get_mut(&master).ok_or(CalcError::UnknownRow(master))?;

            if !dataset.master().is_deleted() {
                let all: Vec<&CompiledRule> = rules.master_calc.iter().collect();
                let results = evaluator.evaluate(dataset.master(), &Context::new(), &all, diagnostics);
                changes.record(
                    RowRef::Master { master },
                    apply_results(dataset.master_mut(), &results, tracker),
                );
            }

            let context = broadcast_context(dataset.master(), &rules.broadcast_fields);
            if let Some(details) = dataset.details_mut() {
                for (tab, rows) in details.iter_mut() {
                    let all: Vec<&CompiledRule> = rules.detail_rules(tab).iter().collect();
                    for row in rows.iter_mut().filter(|r| !r.is_deleted()) {
                        let results = evaluator.evaluate(row, &context, &all, diagnostics);
                        changes.record(
                            RowRef::Detail {
                                master,
                                tab: tab.clone(),
                                row: row.key(),
                            },
                            apply_results(row, &results, tracker),
                        );
                    }
                }
            }
        }

        changes.merge(self.aggregate(master)?);
        Ok(changes)
    }

    /// [`Session::recalculate`] for every master
    pub fn calculate_all(&mut self) -> CalcResult<ChangeSet> {
        let masters: Vec<RowKey> = self.datasets.keys().copied().collect();
        let mut changes = ChangeSet::new();
        for master in masters {
            changes.merge(self.recalculate(master)?);
        }
        Ok(changes)
    }

    //==========================================================================
    // Saving
    //==========================================================================

    pub fn is_dirty(&self) -> bool {
        self.datasets.values().any(Dataset::is_dirty)
    }

    /// Check the rows a save would send; deleted rows are skipped
    pub fn validate(&self, master: RowKey) -> CalcResult<Vec<ValidationError>> {
        let dataset = self.datasets.get(&master).ok_or(CalcError::UnknownRow(master))?;

        let mut errors = Vec::new();
        if dataset.master().is_dirty() {
            errors.extend(validate_row(
                &self.layout.master_table,
                dataset.master(),
                &self.rules.master_validation,
            ));
        }
        for tab in &self.layout.tabs {
            let Some(rules) = self.rules.detail_validation.get(&tab.key) else {
                continue;
            };
            let dirty_rows = dataset.rows(&tab.key).iter().filter(|row| row.is_dirty());
            errors.extend(validate_rows(&tab.table_code, dirty_rows, rules));
        }
        Ok(errors)
    }

    pub fn build_projection(&self, master: RowKey) -> CalcResult<SavePayload> {
        let dataset = self.datasets.get(&master).ok_or(CalcError::UnknownRow(master))?;
        Ok(build_projection(dataset, &self.layout))
    }

    /// Payloads of every master with something to save
    pub fn projections(&self) -> Vec<(RowKey, SavePayload)> {
        self.datasets
            .iter()
            .map(|(key, dataset)| (*key, build_projection(dataset, &self.layout)))
            .filter(|(_, payload)| !payload.is_empty())
            .collect()
    }

    /// Apply a successful save: drop deleted rows, swap temporary ids for
    /// real ones and clear all change tracking
    pub fn commit_saved(&mut self, master: RowKey, receipt: &SaveReceipt) -> CalcResult<()> {
        let Self {
            layout,
            datasets,
            diagnostics,
            ..
        } = self;
        let dataset = datasets.get_mut(&master).ok_or(CalcError::UnknownRow(master))?;

        if dataset.master().is_deleted() {
            datasets.remove(&master);
            info!(%master, "deleted master committed");
            return Ok(());
        }

        let temp_master_id = dataset.master().identity();
        let master_row = dataset.master_mut();
        if master_row.is_new() {
            match receipt.master_id {
                Some(id) => {
                    master_row.set_id(id);
                    master_row.mark_persisted();
                }
                None => diagnostics.record(
                    DiagnosticKind::Commit,
                    master.to_string(),
                    "no id returned for the new master; it stays new",
                ),
            }
        } else {
            master_row.mark_persisted();
        }
        let master_id = dataset.master().id();

        let mut committed = 0usize;
        if let Some(details) = dataset.details_mut() {
            for tab in &layout.tabs {
                let Some(rows) = details.get_mut(&tab.key) else {
                    continue;
                };
                rows.retain(|row| !row.is_deleted());

                for row in rows.iter_mut() {
                    if let Some(real_id) = master_id.filter(|id| *id != temp_master_id) {
                        if row.value(&tab.fk_field).as_number() == Some(temp_master_id as f64) {
                            row.set_raw(&tab.fk_field, Value::from(real_id));
                        }
                    }

                    if row.is_new() {
                        match receipt.id_mapping.get(&row.identity()) {
                            Some(&id) => {
                                row.set_id(id);
                                row.mark_persisted();
                                committed += 1;
                            }
                            None => diagnostics.record(
                                DiagnosticKind::Commit,
                                format!("{}{}", tab.key, row.key()),
                                "no id returned for the new row; it stays new",
                            ),
                        }
                    } else if row.is_dirty() {
                        row.mark_persisted();
                        committed += 1;
                    }
                }
            }
        }

        info!(%master, rows = committed, "save committed");
        Ok(())
    }
}
