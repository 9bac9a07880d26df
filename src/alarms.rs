//! Alarm code descriptions.
//!
//! The device reports failures as a 4-character alarm code plus subcode. Mapping a
//! code to operator text is a data lookup behind [`AlarmCatalog`]; the table itself
//! is supplied by the deployment as a TOML file:
//!
//! ```toml
//! [alarms."0005"]
//! message = "Vacuum not detected"
//! cause = "Wafer not present on chuck"
//! potential_causes = ["Vacuum line disconnected", "Wafer warped"]
//! ```

use crate::error::{AppResult, PrealignError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Operator-facing description of one alarm code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmDescription {
    /// Short message.
    pub message: String,
    /// Most likely cause.
    #[serde(default)]
    pub cause: Option<String>,
    /// Other things to check.
    #[serde(default)]
    pub potential_causes: Vec<String>,
}

/// Lookup from alarm code to description.
pub trait AlarmCatalog: Send + Sync {
    /// Describe `code`, if known.
    fn describe(&self, code: &str) -> Option<AlarmDescription>;
}

/// Catalog that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCatalog;

impl AlarmCatalog for EmptyCatalog {
    fn describe(&self, _code: &str) -> Option<AlarmDescription> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    alarms: HashMap<String, AlarmDescription>,
}

/// In-memory catalog, usually loaded from TOML.
#[derive(Debug, Default, Clone)]
pub struct TableCatalog {
    alarms: HashMap<String, AlarmDescription>,
}

impl TableCatalog {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a catalog from TOML text.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let file: CatalogFile = toml::from_str(text)
            .map_err(|e| PrealignError::Configuration(format!("Invalid alarm catalog: {e}")))?;
        Ok(Self { alarms: file.alarms })
    }

    /// Load a catalog file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Add or replace one description.
    pub fn insert(&mut self, code: impl Into<String>, description: AlarmDescription) {
        self.alarms.insert(code.into(), description);
    }

    /// Number of known codes.
    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    /// True when no codes are known.
    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }
}

impl AlarmCatalog for TableCatalog {
    fn describe(&self, code: &str) -> Option<AlarmDescription> {
        self.alarms.get(code).cloned()
    }
}

/// Build the operator alarm text.
pub fn format_alarm_report(
    code: &str,
    subcode: &str,
    description: Option<&AlarmDescription>,
) -> String {
    let message = description
        .map(|d| d.message.as_str())
        .unwrap_or("Unknown message");
    let cause = description
        .and_then(|d| d.cause.as_deref())
        .unwrap_or("Unknown cause");
    let causes = match description {
        Some(d) if !d.potential_causes.is_empty() => d
            .potential_causes
            .iter()
            .map(|c| format!("• {c}"))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => "• Unknown potential causes".to_string(),
    };

    format!(
        "Alarm: {code}\n\n{message}\n\n{cause}\n\nPotential Causes:\n{causes}\n\nSubcode: {subcode}"
    )
}
