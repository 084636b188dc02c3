use crate::config::EngineConfig;
use crate::core::MemoryDetailSource;
use crate::error::{CalcError, CalcResult};
use crate::page::PageConfig;
use crate::session::Session;
use crate::types::{ChangeSet, Record, RowKey, RowRef, Value};
use colored::Colorize;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A page plus the rows and edits to replay against it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFile {
    #[serde(default)]
    pub engine: EngineConfig,

    pub page: PageConfig,

    #[serde(default)]
    pub masters: Vec<MasterSeed>,

    /// Detail rows served lazily, keyed by master id then tab key
    #[serde(default)]
    pub detail_store: BTreeMap<i64, BTreeMap<String, Vec<Record>>>,

    #[serde(default)]
    pub edits: Vec<EditStep>,
}

/// A master row; without an `id` it is created as a new row
#[derive(Debug, Clone, Deserialize)]
pub struct MasterSeed {
    pub row: Record,

    /// Details known up front; otherwise they come from `detailStore` on demand
    #[serde(default)]
    pub details: Option<BTreeMap<String, Vec<Record>>>,
}

impl MasterSeed {
    /// Load a persisted master with its snapshot details, or create a new
    /// master whose details are new rows too
    pub fn apply(&self, session: &mut Session) -> CalcResult<RowKey> {
        if self.row.contains_key("id") {
            let key = session.load_master(self.row.clone())?;
            if let Some(details) = &self.details {
                session.load_details(key, details.clone())?;
            }
            return Ok(key);
        }

        let key = session.add_master(self.row.clone())?;
        for (tab, records) in self.details.iter().flatten() {
            for record in records {
                session.add_detail_row(key, tab, record.clone())?;
            }
        }
        Ok(key)
    }
}

/// One user action. `master` and `row` are row ids; new rows go by their
/// temporary (negative) id.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum EditStep {
    Set {
        master: i64,
        #[serde(default)]
        tab: Option<String>,
        #[serde(default)]
        row: Option<i64>,
        field: String,
        value: Value,
    },
    AddRow {
        master: i64,
        tab: String,
        #[serde(default)]
        record: Record,
    },
    DeleteRow {
        master: i64,
        tab: String,
        row: i64,
    },
    Broadcast {
        master: i64,
    },
}

impl SessionFile {
    pub fn load(path: &Path) -> CalcResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
            other => Err(CalcError::Parse(format!(
                "Unsupported session format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    fn detail_source(&self) -> MemoryDetailSource {
        let mut source = MemoryDetailSource::new();
        for (master_id, tabs) in &self.detail_store {
            for (tab, records) in tabs {
                source.insert(*master_id, tab.clone(), records.clone());
            }
        }
        source
    }
}

/// Execute the check command
pub fn check(file: PathBuf) -> CalcResult<()> {
    println!("{}", "🔍 md-forge - Checking rules".bold().green());
    println!("   File: {}\n", file.display());

    let session_file = SessionFile::load(&file)?;
    let session = Session::new(&session_file.page, session_file.engine);

    let rules = session.rules();
    println!("{}", "📋 Compiled rules:".bold().cyan());
    println!(
        "   {} master rules, {} aggregates, {} broadcast fields",
        rules.master_calc.len(),
        rules.aggregates.len(),
        rules.broadcast_fields.len()
    );
    for tab in &session.layout().tabs {
        println!(
            "   📊 Tab {} ({}): {} rules",
            tab.key.bright_blue().bold(),
            tab.table_code,
            rules.detail_rules(&tab.key).len()
        );
    }
    println!();

    let diagnostics = session.diagnostics();
    if diagnostics.is_empty() {
        println!("{}", "✅ All rules compiled".bold().green());
        return Ok(());
    }

    println!("{}", "❌ Rule problems:".bold().red());
    for diagnostic in diagnostics {
        println!("   {}", diagnostic.to_string().red());
    }
    Err(CalcError::Validation(format!(
        "{} rule problem(s) found",
        diagnostics.len()
    )))
}

/// Execute the run command
pub async fn run(file: PathBuf, precision: Option<u32>, verbose: bool) -> CalcResult<()> {
    println!("{}", "🔥 md-forge - Running session".bold().green());
    println!("   File: {}\n", file.display());

    let session_file = SessionFile::load(&file)?;
    let mut engine = session_file.engine.clone();
    if let Some(precision) = precision {
        engine = engine.with_precision(precision);
    }

    let mut session =
        Session::new(&session_file.page, engine).with_detail_source(session_file.detail_source());

    for seed in &session_file.masters {
        seed.apply(&mut session)?;
    }

    let initial = session.calculate_all()?;
    if verbose {
        println!("{}", "🧮 Initial calculation:".cyan());
        print_changes(&initial);
    }

    for (index, step) in session_file.edits.iter().enumerate() {
        let changes = apply_edit(&mut session, step).await?;
        if verbose {
            println!("{}", format!("✏️  Edit #{}:", index + 1).cyan());
            print_changes(&changes);
        }
    }

    let mut failures = Vec::new();
    let masters: Vec<RowKey> = session.datasets().map(|(key, _)| key).collect();
    for master in masters {
        failures.extend(session.validate(master)?);
    }

    let diagnostics = session.take_diagnostics();
    if !diagnostics.is_empty() {
        println!("{}", "⚠️  Diagnostics:".bold().yellow());
        for diagnostic in &diagnostics {
            println!("   {}", diagnostic.to_string().yellow());
        }
        println!();
    }

    if !failures.is_empty() {
        println!("{}", "❌ Validation failed:".bold().red());
        for failure in &failures {
            println!("   {}", failure.to_string().red());
        }
        return Err(CalcError::Validation(format!(
            "{} field(s) failed validation",
            failures.len()
        )));
    }

    let payloads: Vec<_> = session
        .projections()
        .into_iter()
        .map(|(_, payload)| payload)
        .collect();
    println!("{}", "💾 Save payload:".bold().green());
    println!("{}", serde_json::to_string_pretty(&payloads)?);
    Ok(())
}

async fn apply_edit(session: &mut Session, step: &EditStep) -> CalcResult<ChangeSet> {
    match step {
        EditStep::Set {
            master,
            tab: None,
            field,
            value,
            ..
        } => {
            let master = resolve_master(session, *master)?;
            session.edit_master_field(master, field, value.clone()).await
        }
        EditStep::Set {
            master,
            tab: Some(tab),
            row,
            field,
            value,
        } => {
            let master = resolve_master(session, *master)?;
            session.ensure_details(master).await?;
            let row_id = row.ok_or_else(|| {
                CalcError::Parse(format!("edit of {}.{} names no row", tab, field))
            })?;
            let row = resolve_detail(session, master, tab, row_id)?;
            session.edit_detail_field(master, tab, row, field, value.clone())
        }
        EditStep::AddRow {
            master,
            tab,
            record,
        } => {
            let master = resolve_master(session, *master)?;
            session.ensure_details(master).await?;
            session.add_detail_row(master, tab, record.clone())?;
            Ok(ChangeSet::new())
        }
        EditStep::DeleteRow { master, tab, row } => {
            let master = resolve_master(session, *master)?;
            session.ensure_details(master).await?;
            let row = resolve_detail(session, master, tab, *row)?;
            session.delete_detail_row(master, tab, row)
        }
        EditStep::Broadcast { master } => {
            let master = resolve_master(session, *master)?;
            session.broadcast(master).await
        }
    }
}

fn resolve_master(session: &Session, id: i64) -> CalcResult<RowKey> {
    session.find_master_by_id(id).ok_or(CalcError::UnknownId(id))
}

fn resolve_detail(session: &Session, master: RowKey, tab: &str, id: i64) -> CalcResult<RowKey> {
    session
        .find_detail_by_id(master, tab, id)
        .ok_or(CalcError::UnknownId(id))
}

fn print_changes(changes: &ChangeSet) {
    if changes.is_empty() {
        println!("   (no changes)");
        return;
    }
    for change in &changes.rows {
        let label = match &change.row {
            RowRef::Master { master } => format!("master {}", master),
            RowRef::Detail { tab, row, .. } => format!("{} {}", tab, row),
        };
        println!("   {} {}", label.bright_blue(), change.fields.join(", "));
    }
}
