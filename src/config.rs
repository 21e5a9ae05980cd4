//! Runtime configuration types.

use std::path::Path;

use serde::Deserialize;

/// Output format for run statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Human,
    Json,
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Hard limit on heap size in bytes (None = unlimited)
    pub heap_limit: Option<usize>,
    /// Log every executed instruction at trace level
    pub trace: bool,
    /// Print run statistics after execution
    pub report: Option<ReportFormat>,
}

impl RuntimeConfig {
    /// Read a configuration file in TOML format.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::parse(&text).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }
}
