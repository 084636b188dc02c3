use crate::error::{CalcError, CalcResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine-wide settings shared by every session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Decimal places computed values are rounded to
    pub precision: u32,
    /// Absolute tolerance for numeric equality in dirty tracking
    pub tolerance: f64,
    /// Foreign-key field used by tabs that do not name their own
    pub default_fk_field: String,
    /// Drop calc rules that sit on a dependency cycle
    pub reject_cycles: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            precision: 2,
            tolerance: 1e-4,
            default_fk_field: "masterId".to_string(),
            reject_cycles: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> CalcResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> CalcResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> CalcResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(CalcError::Parse(format!(
                "Unsupported config format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.precision, 2);
        assert_eq!(config.tolerance, 1e-4);
        assert_eq!(config.default_fk_field, "masterId");
        assert!(config.reject_cycles);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str("precision: 4\nrejectCycles: false\n").unwrap();
        assert_eq!(config.precision, 4);
        assert!(!config.reject_cycles);
        assert_eq!(config.default_fk_field, "masterId");
    }

    #[test]
    fn test_load_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"defaultFkField": "headerId"}}"#).unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.default_fk_field, "headerId");
        assert_eq!(config.precision, 2);
    }

    #[test]
    fn test_load_unknown_extension() {
        let file = Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(CalcError::Parse(_))
        ));
    }
}
