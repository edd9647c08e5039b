use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// GateContext
// ---------------------------------------------------------------------------

/// Point-in-time inputs for a gate evaluation. Built fresh per evaluation
/// from the caller's partial context merged with previously-passed gate ids
/// pulled from the registry, never cached across evaluations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateContext {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Files in play for the current command.
    #[serde(default)]
    pub files: Vec<String>,
    /// Section names available in the assembled document.
    #[serde(default)]
    pub sections: Vec<String>,
    /// Gate ids currently in `passed` state.
    #[serde(default)]
    pub passed_gates: Vec<String>,
    /// Free-form metadata: coverage numbers, lint results, git status, etc.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl GateContext {
    pub fn for_phase(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_sections(mut self, sections: Vec<String>) -> Self {
        self.sections = sections;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Case-insensitive substring match against available section names.
    pub fn has_section(&self, name: &str) -> bool {
        let needle = name.to_lowercase();
        self.sections
            .iter()
            .any(|s| s.to_lowercase().contains(&needle))
    }

    pub fn gate_passed(&self, gate_id: &str) -> bool {
        self.passed_gates.iter().any(|g| g == gate_id)
    }

    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(|v| v.as_f64())
    }

    pub fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(|v| v.as_bool())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
