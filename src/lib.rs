//! md-forge - calculation core for master/detail editing pages
//!
//! A page declares a master table, detail tabs and three kinds of rules:
//! same-row calc rules, detail-to-master aggregates and master-to-detail
//! broadcast fields. A [`Session`] holds the rows of one page in memory,
//! runs the rule cascades on every edit, tracks which fields changed and
//! builds the minimal payload a save needs.
//!
//! # Features
//!
//! - Formula expressions with arithmetic, comparison, logic and spreadsheet functions
//! - Rules ordered explicitly, cycles rejected at compile time
//! - Formula-by-discriminant rules (`formulaField` + `formulas`)
//! - SUM/AVG/COUNT/MAX/MIN aggregates with row filters, plus expression aggregates
//! - Lazy, async detail loading behind [`core::DetailSource`]
//! - Field-level dirty tracking with user/calc provenance
//!
//! # Example
//!
//! ```no_run
//! use md_forge::{EngineConfig, PageConfig, Session};
//! use std::path::Path;
//!
//! # async fn demo() -> md_forge::CalcResult<()> {
//! let page = PageConfig::load(Path::new("page.yaml"))?;
//! let mut session = Session::new(&page, EngineConfig::default());
//!
//! let mut row = md_forge::Record::new();
//! row.insert("id".into(), 1i64.into());
//! row.insert("apexPl".into(), 100.0.into());
//! let master = session.load_master(row)?;
//!
//! let changes = session.edit_master_field(master, "apexPl", 200.0).await?;
//! println!("{} rows changed", changes.rows.len());
//! println!("{}", serde_json::to_string(&session.build_projection(master)?)?);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod page;
pub mod projection;
pub mod session;
pub mod types;
pub mod validation;

// Re-export commonly used types
pub use config::EngineConfig;
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use error::{CalcError, CalcResult};
pub use page::PageConfig;
pub use projection::{RecordItem, RecordStatus, SavePayload, SaveReceipt};
pub use session::Session;
pub use types::{ChangeSet, ChangeType, FieldKind, Record, Row, RowKey, RowRef, Schema, Value};
