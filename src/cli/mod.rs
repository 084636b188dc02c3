//! CLI command handlers

pub mod commands;

pub use commands::{check, run, EditStep, MasterSeed, SessionFile};
