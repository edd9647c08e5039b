use crate::gate::GateResult;
use crate::history::ExecutionHistory;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Error categories
// ---------------------------------------------------------------------------

/// Coarse bucket for a gate error message, used by pattern matchers and by
/// per-gate failure-category history.
pub fn error_category(error: &str) -> &'static str {
    if error.starts_with("Missing required section") {
        "missing_section"
    } else if error.starts_with("Missing or inaccessible file") {
        "missing_file"
    } else if error.starts_with("Required gate not passed") {
        "gate_dependency"
    } else if error.starts_with("Unknown condition") || error.starts_with("Condition") {
        "condition"
    } else if error.contains("exceeded") && error.contains("ms") {
        "timeout"
    } else {
        "custom"
    }
}

/// Dominant category for a result: the category of its first error, or
/// "none" for a pass.
pub fn result_category(result: &GateResult) -> &'static str {
    result
        .errors
        .first()
        .map(|e| error_category(e))
        .unwrap_or("none")
}

// ---------------------------------------------------------------------------
// SuggestionPriority / ImprovementSuggestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionPriority {
    High,
    Medium,
    Low,
}

impl fmt::Display for SuggestionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SuggestionPriority::High => "high",
            SuggestionPriority::Medium => "medium",
            SuggestionPriority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Advisory output only; never applied automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementSuggestion {
    pub pattern_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<String>,
    pub category: String,
    pub priority: SuggestionPriority,
    pub suggestion: String,
    pub rationale: String,
    pub estimated_impact: String,
}

// ---------------------------------------------------------------------------
// ImprovementPattern
// ---------------------------------------------------------------------------

/// A matcher over (gate id, error category, historical failure rate) with an
/// associated suggestion template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementPattern {
    pub id: String,
    /// Exact gate id to match, or `None` for any gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<String>,
    /// Substring the failure category must contain.
    pub category_contains: String,
    /// Historical failure rate the gate must exceed.
    pub min_failure_rate: f64,
    pub priority: SuggestionPriority,
    pub suggestion: String,
    pub rationale: String,
    pub estimated_impact: String,
}

impl ImprovementPattern {
    pub fn matches(&self, gate_id: &str, category: &str, failure_rate: f64) -> bool {
        if let Some(expected) = &self.gate_id {
            if expected != gate_id {
                return false;
            }
        }
        category.contains(&self.category_contains) && failure_rate > self.min_failure_rate
    }
}

/// Built-in pattern table. Hosts may extend it; ordering is part of the
/// deterministic-output contract.
pub fn default_patterns() -> Vec<ImprovementPattern> {
    vec![
        ImprovementPattern {
            id: "recurring-doc-failure".to_string(),
            gate_id: None,
            category_contains: "missing_section".to_string(),
            min_failure_rate: 0.3,
            priority: SuggestionPriority::High,
            suggestion: "Add a documentation template that pre-populates the required sections"
                .to_string(),
            rationale: "The same sections are repeatedly missing when this gate runs".to_string(),
            estimated_impact: "Removes the most frequent validation failure for this phase"
                .to_string(),
        },
        ImprovementPattern {
            id: "recurring-artifact-failure".to_string(),
            gate_id: None,
            category_contains: "missing_file".to_string(),
            min_failure_rate: 0.3,
            priority: SuggestionPriority::High,
            suggestion: "Generate the required output files as part of the previous step"
                .to_string(),
            rationale: "Required files are routinely absent at validation time".to_string(),
            estimated_impact: "Avoids a retry cycle on most runs".to_string(),
        },
        ImprovementPattern {
            id: "unstable-condition".to_string(),
            gate_id: None,
            category_contains: "condition".to_string(),
            min_failure_rate: 0.5,
            priority: SuggestionPriority::Medium,
            suggestion: "Review the condition predicate for environment dependence".to_string(),
            rationale: "The condition fails on more than half of evaluations".to_string(),
            estimated_impact: "Stabilizes gate outcomes across hosts".to_string(),
        },
        ImprovementPattern {
            id: "ordering-problem".to_string(),
            gate_id: None,
            category_contains: "gate_dependency".to_string(),
            min_failure_rate: 0.3,
            priority: SuggestionPriority::Medium,
            suggestion: "Reorder gates so prerequisites run earlier in the phase".to_string(),
            rationale: "A prerequisite gate is regularly still pending at evaluation time"
                .to_string(),
            estimated_impact: "Eliminates dependency-ordering failures".to_string(),
        },
        ImprovementPattern {
            id: "slow-gate".to_string(),
            gate_id: None,
            category_contains: "timeout".to_string(),
            min_failure_rate: 0.2,
            priority: SuggestionPriority::Low,
            suggestion: "Raise the gate timeout or split the check into smaller gates".to_string(),
            rationale: "Attempts regularly exceed the configured time box".to_string(),
            estimated_impact: "Converts timed-out attempts into clean passes or fast failures"
                .to_string(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Suggestion mining
// ---------------------------------------------------------------------------

/// Derive suggestions for a set of failed gate results. Deterministic given
/// identical history: patterns are consulted in table order, failed results
/// in result order, and each (pattern, gate) pair emits at most once.
pub fn derive_suggestions(
    failed: &[&GateResult],
    history: &ExecutionHistory,
    patterns: &[ImprovementPattern],
) -> Vec<ImprovementSuggestion> {
    let mut suggestions = Vec::new();
    for result in failed {
        let rate = history.gate_failure_rate(&result.gate_id);
        let category = result_category(result);
        for pattern in patterns {
            if pattern.matches(&result.gate_id, category, rate) {
                let already = suggestions.iter().any(|s: &ImprovementSuggestion| {
                    s.pattern_id == pattern.id && s.gate_id.as_deref() == Some(&*result.gate_id)
                });
                if already {
                    continue;
                }
                suggestions.push(ImprovementSuggestion {
                    pattern_id: pattern.id.clone(),
                    gate_id: Some(result.gate_id.clone()),
                    category: category.to_string(),
                    priority: pattern.priority,
                    suggestion: pattern.suggestion.clone(),
                    rationale: format!(
                        "{} (failure rate {:.0}%)",
                        pattern.rationale,
                        rate * 100.0
                    ),
                    estimated_impact: pattern.estimated_impact.clone(),
                });
            }
        }
    }
    suggestions
}

/// The generic low-success-rate advice emitted when a phase run's success
/// rate falls under the threshold.
pub fn decompose_suggestion(phase: &str, success_rate: f64) -> ImprovementSuggestion {
    ImprovementSuggestion {
        pattern_id: "decompose-phase".to_string(),
        gate_id: None,
        category: "phase".to_string(),
        priority: SuggestionPriority::High,
        suggestion: format!("Decompose phase '{phase}' into smaller steps"),
        rationale: format!(
            "Phase success rate {:.0}% is below the 80% threshold",
            success_rate * 100.0
        ),
        estimated_impact: "Smaller steps localize failures and shorten retry loops".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
