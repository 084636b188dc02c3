use crate::types::RowKey;
use thiserror::Error;

pub type CalcResult<T> = Result<T, CalcError>;

#[derive(Error, Debug)]
pub enum CalcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Unknown row: {0}")]
    UnknownRow(RowKey),

    #[error("No row with id {0}")]
    UnknownId(i64),

    #[error("Unknown tab: {0}")]
    UnknownTab(String),

    #[error("Detail rows unavailable: {0}")]
    DetailsUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
