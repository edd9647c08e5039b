use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// DynamicTrigger
// ---------------------------------------------------------------------------

/// A declaration that activates extra context sections when its pattern is
/// present in the session's trigger set.
///
/// Patterns come in two forms:
///   - extension globs: `*.rs`, `*.tsx`, matched against file paths
///   - tool tags: `tool:cargo`, matched against invoked tool names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicTrigger {
    pub pattern: String,
    /// Logical keys of the fragments this trigger pulls into the dynamic layer.
    pub sections: Vec<String>,
}

impl DynamicTrigger {
    pub fn new(pattern: impl Into<String>, sections: Vec<String>) -> Self {
        Self {
            pattern: pattern.into(),
            sections,
        }
    }
}

/// Derive the trigger pattern for a file path, if it has an extension.
/// `src/main.rs` → `*.rs`. Matching is case-insensitive.
pub fn pattern_for_file(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(format!("*.{}", ext.to_ascii_lowercase()))
}

/// Trigger pattern for an invoked tool name. `cargo` → `tool:cargo`.
pub fn pattern_for_tool(tool: &str) -> String {
    format!("tool:{}", tool.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// TriggerSet
// ---------------------------------------------------------------------------

/// The session's accumulated trigger patterns. Monotone for the lifetime of
/// a session unless explicitly cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerSet {
    active: BTreeSet<String>,
}

impl TriggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the patterns derived from a request's files and tools into the
    /// session set. Returns the patterns that were newly added.
    pub fn activate(&mut self, files: &[String], tools: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for file in files {
            if let Some(pattern) = pattern_for_file(file) {
                if self.active.insert(pattern.clone()) {
                    added.push(pattern);
                }
            }
        }
        for tool in tools {
            let pattern = pattern_for_tool(tool);
            if self.active.insert(pattern.clone()) {
                added.push(pattern);
            }
        }
        added
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.active.contains(pattern)
    }

    /// Declarations whose pattern is in the active set, in stable order.
    pub fn matching<'a>(&self, declarations: &'a [DynamicTrigger]) -> Vec<&'a DynamicTrigger> {
        declarations
            .iter()
            .filter(|d| self.active.contains(&d.pattern))
            .collect()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
