use crate::error::{Result, WardenError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// GateType / Severity / GateStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    PreExecution,
    PostExecution,
    Continuous,
}

impl GateType {
    pub fn as_str(self) -> &'static str {
        match self {
            GateType::PreExecution => "pre_execution",
            GateType::PostExecution => "post_execution",
            GateType::Continuous => "continuous",
        }
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateStatus::Pending => "pending",
            GateStatus::Passed => "passed",
            GateStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// PhaseSelector
// ---------------------------------------------------------------------------

/// Which phase a gate belongs to. `All` is the wildcard: the gate applies to
/// every phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSelector {
    All,
    Phase(String),
}

impl PhaseSelector {
    pub fn applies_to(&self, phase: &str) -> bool {
        match self {
            PhaseSelector::All => true,
            PhaseSelector::Phase(p) => p == phase,
        }
    }
}

impl fmt::Display for PhaseSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseSelector::All => f.write_str("*"),
            PhaseSelector::Phase(p) => f.write_str(p),
        }
    }
}

// ---------------------------------------------------------------------------
// GateRequirements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateRequirements {
    /// Section names that must be present (case-insensitive substring match).
    #[serde(default)]
    pub sections: Vec<String>,
    /// File paths that must exist and be readable.
    #[serde(default)]
    pub files: Vec<String>,
    /// Gate ids that must already be in `passed` state.
    #[serde(default)]
    pub gates: Vec<String>,
    /// Named conditions whose registered predicates must hold.
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl GateRequirements {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
            && self.files.is_empty()
            && self.gates.is_empty()
            && self.conditions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ValidationGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationGate {
    pub id: String,
    #[serde(default = "default_phase_selector")]
    pub phase: PhaseSelector,
    pub gate_type: GateType,
    #[serde(default = "default_gate_enabled")]
    pub enabled: bool,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub requirements: GateRequirements,
    /// Whether this gate declares an auto-fix routine. The routine itself is
    /// registered on the registry, not serialized.
    #[serde(default)]
    pub auto_fixable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_phase_selector() -> PhaseSelector {
    PhaseSelector::All
}

fn default_severity() -> Severity {
    Severity::Error
}

fn default_gate_enabled() -> bool {
    true
}

impl ValidationGate {
    pub fn new(id: impl Into<String>, gate_type: GateType) -> Self {
        Self {
            id: id.into(),
            phase: PhaseSelector::All,
            gate_type,
            enabled: true,
            severity: Severity::Error,
            requirements: GateRequirements::default(),
            auto_fixable: false,
            description: None,
        }
    }

    pub fn for_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = PhaseSelector::Phase(phase.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_requirements(mut self, requirements: GateRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn auto_fixable(mut self) -> Self {
        self.auto_fixable = true;
        self
    }
}

// ---------------------------------------------------------------------------
// GateResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub passed: bool,
    pub severity: Severity,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// True if an auto-fix was applied before the passing evaluation.
    #[serde(default)]
    pub fix_applied: bool,
    pub evaluated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl GateResult {
    pub fn passed(gate_id: impl Into<String>, severity: Severity) -> Self {
        Self {
            gate_id: gate_id.into(),
            passed: true,
            severity,
            errors: Vec::new(),
            warnings: Vec::new(),
            fix_applied: false,
            evaluated_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn failed(gate_id: impl Into<String>, severity: Severity, errors: Vec<String>) -> Self {
        Self {
            gate_id: gate_id.into(),
            passed: false,
            severity,
            errors,
            warnings: Vec::new(),
            fix_applied: false,
            evaluated_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn status(&self) -> GateStatus {
        if self.passed {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Gate and phase ids share the slug grammar: lowercase alphanumeric with
/// interior hyphens, at most 64 chars.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !id_re().is_match(id) {
        return Err(WardenError::InvalidId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
